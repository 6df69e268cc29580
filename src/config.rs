//! Run configuration.
//!
//! The config file is JSON with a `schema_version`. Every field other than the
//! version has a default, so a stub written by `rpress init` can be trimmed to
//! just the settings a user wants to change.
use crate::state::SectionId;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_SCHEMA_VERSION: u32 = 1;

/// Overrides the configured model backend with a command line.
pub const LM_COMMAND_ENV: &str = "RPRESS_LM_COMMAND";

pub const DEFAULT_LM_COMMAND: &str = "ollama run gemma3";
pub const DEFAULT_OLLAMA_ENDPOINT: &str = "http://127.0.0.1:11434";
pub const DEFAULT_COMPILER_COMMAND: &str =
    "pdflatex -interaction=nonstopmode -output-directory={workdir} -jobname={jobname} {source}";

const MAX_RETRY_BUDGET: u32 = 10;
const MIN_CONTEXT_BYTES: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    pub schema_version: u32,
    /// Extra generator attempts after the first.
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
    #[serde(default = "default_compile_passes")]
    pub compile_passes: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_output_path")]
    pub output_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<PathBuf>,
    #[serde(default = "default_sections")]
    pub sections: Vec<SectionId>,
    #[serde(default = "default_review_rounds")]
    pub review_rounds: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_max_context_bytes")]
    pub max_context_bytes: usize,
    #[serde(default)]
    pub document: DocumentMeta,
    #[serde(default)]
    pub compiler: CompilerConfig,
    #[serde(default)]
    pub lm: LmConfig,
}

impl RunConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Text for the title block of the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DocumentMeta {
    pub title: String,
    pub author: String,
    /// Printed verbatim; empty leaves the date line blank.
    #[serde(default)]
    pub date: String,
}

impl Default for DocumentMeta {
    fn default() -> Self {
        Self {
            title: "Data Analysis Report".to_string(),
            author: "Automated Analytics Pipeline".to_string(),
            date: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompilerConfig {
    /// Command line with `{source}`, `{workdir}` and `{jobname}` placeholders.
    pub command: String,
    pub jobname: String,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            command: DEFAULT_COMPILER_COMMAND.to_string(),
            jobname: "report".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LmConfig {
    /// Prompt on stdin, response on stdout.
    Command { command: String },
    /// Ollama `/api/generate` over HTTP.
    Ollama {
        endpoint: String,
        model: String,
        #[serde(default = "default_temperature")]
        temperature: f64,
    },
}

impl Default for LmConfig {
    fn default() -> Self {
        Self::Command {
            command: DEFAULT_LM_COMMAND.to_string(),
        }
    }
}

fn default_retry_budget() -> u32 {
    2
}

fn default_compile_passes() -> u32 {
    2
}

fn default_timeout_secs() -> u64 {
    900
}

fn default_output_path() -> PathBuf {
    PathBuf::from("output/report.pdf")
}

fn default_sections() -> Vec<SectionId> {
    SectionId::ALL.to_vec()
}

fn default_review_rounds() -> u32 {
    2
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_max_context_bytes() -> usize {
    16 * 1024
}

fn default_temperature() -> f64 {
    0.1
}

/// Config used when no file is given and by `rpress init`.
pub fn default_config() -> RunConfig {
    RunConfig {
        schema_version: CONFIG_SCHEMA_VERSION,
        retry_budget: default_retry_budget(),
        compile_passes: default_compile_passes(),
        timeout_secs: default_timeout_secs(),
        output_path: default_output_path(),
        work_dir: None,
        sections: default_sections(),
        review_rounds: default_review_rounds(),
        retry_backoff_ms: default_retry_backoff_ms(),
        max_context_bytes: default_max_context_bytes(),
        document: DocumentMeta::default(),
        compiler: CompilerConfig::default(),
        lm: LmConfig::default(),
    }
}

pub fn config_stub() -> Result<String> {
    serde_json::to_string_pretty(&default_config()).context("serialize config stub")
}

pub fn load_config(path: &Path) -> Result<RunConfig> {
    let bytes = fs::read(path).with_context(|| format!("read config {}", path.display()))?;
    let config: RunConfig = serde_json::from_slice(&bytes)
        .with_context(|| format!("parse config JSON {}", path.display()))?;
    Ok(config)
}

pub fn write_config(path: &Path, config: &RunConfig) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let mut text = serde_json::to_string_pretty(config).context("serialize config")?;
    text.push('\n');
    fs::write(path, text.as_bytes()).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

/// Replace the model backend when [`LM_COMMAND_ENV`] is set.
pub fn apply_env_overrides(config: &mut RunConfig) {
    apply_lm_command_override(config, env::var(LM_COMMAND_ENV).ok());
}

fn apply_lm_command_override(config: &mut RunConfig, command: Option<String>) {
    if let Some(command) = command.filter(|command| !command.trim().is_empty()) {
        config.lm = LmConfig::Command { command };
    }
}

pub fn validate_config(config: &RunConfig) -> Result<()> {
    if config.schema_version != CONFIG_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported config schema_version {} (expected {CONFIG_SCHEMA_VERSION})",
            config.schema_version
        ));
    }
    if config.retry_budget > MAX_RETRY_BUDGET {
        return Err(anyhow!(
            "retry_budget must be at most {MAX_RETRY_BUDGET} (got {})",
            config.retry_budget
        ));
    }
    if config.compile_passes == 0 {
        return Err(anyhow!("compile_passes must be at least 1"));
    }
    if config.timeout_secs == 0 {
        return Err(anyhow!("timeout_secs must be at least 1"));
    }
    if config.output_path.file_name().is_none() {
        return Err(anyhow!(
            "output_path must name a file (got {})",
            config.output_path.display()
        ));
    }
    if config.max_context_bytes < MIN_CONTEXT_BYTES {
        return Err(anyhow!(
            "max_context_bytes must be at least {MIN_CONTEXT_BYTES} (got {})",
            config.max_context_bytes
        ));
    }
    validate_sections(&config.sections)?;
    if config.document.title.trim().is_empty() {
        return Err(anyhow!("document.title must be non-empty"));
    }
    validate_compiler(&config.compiler)?;
    validate_lm(&config.lm)?;
    Ok(())
}

fn validate_sections(sections: &[SectionId]) -> Result<()> {
    if sections.is_empty() {
        return Err(anyhow!("sections must list at least one section"));
    }
    let mut seen = BTreeSet::new();
    for section in sections {
        if !seen.insert(*section) {
            return Err(anyhow!("sections lists {section} more than once"));
        }
    }
    Ok(())
}

fn validate_compiler(compiler: &CompilerConfig) -> Result<()> {
    let argv = shell_words::split(&compiler.command)
        .with_context(|| format!("parse compiler.command: {}", compiler.command))?;
    if argv.is_empty() {
        return Err(anyhow!("compiler.command is empty"));
    }
    if !argv.iter().any(|arg| arg.contains("{source}")) {
        return Err(anyhow!("compiler.command must reference {{source}}"));
    }
    let jobname_ok = !compiler.jobname.is_empty()
        && compiler
            .jobname
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_');
    if !jobname_ok {
        return Err(anyhow!(
            "compiler.jobname must be letters, digits, '-' or '_' (got {:?})",
            compiler.jobname
        ));
    }
    Ok(())
}

fn validate_lm(lm: &LmConfig) -> Result<()> {
    match lm {
        LmConfig::Command { command } => {
            let argv = shell_words::split(command)
                .with_context(|| format!("parse lm.command: {command}"))?;
            if argv.is_empty() {
                return Err(anyhow!("lm.command is empty"));
            }
        }
        LmConfig::Ollama {
            endpoint,
            model,
            temperature,
        } => {
            if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                return Err(anyhow!(
                    "lm.endpoint must be an http(s) URL (got {endpoint:?})"
                ));
            }
            if model.trim().is_empty() {
                return Err(anyhow!("lm.model must be non-empty"));
            }
            if !(0.0..=2.0).contains(temperature) {
                return Err(anyhow!(
                    "lm.temperature must be between 0 and 2 (got {temperature})"
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
