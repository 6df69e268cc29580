//! Compiler driver.
//!
//! Writes the assembled source into the work directory and runs the
//! configured typesetter a fixed number of passes. A pass that leaves no
//! artifact is fatal; a non-zero exit that still leaves one is recorded and
//! the run continues.
use crate::assemble::Document;
use crate::config::RunConfig;
use crate::error::PipelineError;
use crate::process::{run_captured, Deadline, ProcessError};
use crate::state::{CompileMessage, MessageLevel, Status};
use crate::util::{display_path, preview};
use regex::Regex;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::LazyLock;

const MAX_FAILURE_PREVIEW: usize = 600;

static RE_ERROR_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^!\s*(.+)$").expect("valid error line regex"));
static RE_WARNING_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Warning\b").expect("valid warning line regex"));
static RE_BOX_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(Overfull|Underfull) \\[hv]box").expect("valid box regex"));

#[derive(Debug, Clone)]
pub struct CompileSettings {
    /// Command line with `{source}`, `{workdir}` and `{jobname}` placeholders.
    pub command: String,
    pub jobname: String,
    pub passes: u32,
    pub work_dir: PathBuf,
}

impl CompileSettings {
    pub fn from_config(config: &RunConfig, work_dir: &Path) -> Self {
        Self {
            command: config.compiler.command.clone(),
            jobname: config.compiler.jobname.clone(),
            passes: config.compile_passes,
            work_dir: work_dir.to_path_buf(),
        }
    }

    pub fn source_path(&self) -> PathBuf {
        self.work_dir.join(format!("{}.tex", self.jobname))
    }

    pub fn artifact_path(&self) -> PathBuf {
        self.work_dir.join(format!("{}.pdf", self.jobname))
    }
}

/// A pass that exited non-zero but still produced the artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoftFailure {
    pub pass: u32,
    pub exit_code: Option<i32>,
    pub detail: String,
}

#[derive(Debug, Clone)]
pub struct CompileResult {
    pub artifact_path: PathBuf,
    pub source_path: PathBuf,
    pub passes: u32,
    pub messages: Vec<CompileMessage>,
    pub soft_failures: Vec<SoftFailure>,
}

pub fn compile(
    document: &Document,
    settings: &CompileSettings,
    deadline: &Deadline,
) -> Result<CompileResult, PipelineError> {
    let source_path = settings.source_path();
    let artifact_path = settings.artifact_path();
    fs::write(&source_path, &document.source).map_err(|err| {
        PipelineError::CompileHardFailure(format!(
            "write {}: {err}",
            display_path(&source_path, None)
        ))
    })?;
    match fs::remove_file(&artifact_path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(PipelineError::CompileHardFailure(format!(
                "remove stale {}: {err}",
                display_path(&artifact_path, None)
            )))
        }
    }

    let argv = compiler_argv(settings, &source_path)?;
    let program = which::which(&argv[0]).map_err(|err| {
        PipelineError::CompileHardFailure(format!("compiler `{}` not found: {err}", argv[0]))
    })?;

    let mut messages = Vec::new();
    let mut soft_failures = Vec::new();
    for pass in 1..=settings.passes {
        if deadline.expired() {
            return Err(PipelineError::Timeout(Status::Compiling));
        }
        let mut command = Command::new(&program);
        command
            .args(&argv[1..])
            .current_dir(&settings.work_dir)
            .env("SOURCE_DATE_EPOCH", "0")
            .env("FORCE_SOURCE_DATE", "1");

        let output = match run_captured(command, None, deadline) {
            Ok(output) => output,
            Err(ProcessError::DeadlineExpired { .. }) => {
                return Err(PipelineError::Timeout(Status::Compiling))
            }
            Err(err) => return Err(PipelineError::CompileHardFailure(err.to_string())),
        };

        let combined = format!(
            "{}\n{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        let pass_messages = parse_messages(pass, &combined);
        let produced = artifact_path.is_file();
        tracing::info!(
            pass,
            exit_code = output.status.code(),
            duration_ms = output.duration_ms,
            produced,
            errors = pass_messages
                .iter()
                .filter(|message| message.level == MessageLevel::Error)
                .count(),
            "compile pass complete"
        );

        if !produced {
            messages.extend(pass_messages);
            return Err(PipelineError::CompileHardFailure(format!(
                "pass {pass} produced no {}: {}",
                display_path(&artifact_path, Some(&settings.work_dir)),
                failure_detail(&messages, &combined)
            )));
        }
        if !output.status.success() {
            let detail = failure_detail(&pass_messages, &combined);
            tracing::warn!(pass, detail = %detail, "compile pass exited non-zero");
            soft_failures.push(SoftFailure {
                pass,
                exit_code: output.status.code(),
                detail,
            });
        }
        messages.extend(pass_messages);
    }

    Ok(CompileResult {
        artifact_path,
        source_path,
        passes: settings.passes,
        messages,
        soft_failures,
    })
}

fn compiler_argv(settings: &CompileSettings, source_path: &Path) -> Result<Vec<String>, PipelineError> {
    let tokens = shell_words::split(&settings.command).map_err(|err| {
        PipelineError::CompileHardFailure(format!("parse compiler command: {err}"))
    })?;
    if tokens.is_empty() {
        return Err(PipelineError::CompileHardFailure(
            "compiler command is empty".to_string(),
        ));
    }
    let source = source_path.to_string_lossy();
    let work_dir = settings.work_dir.to_string_lossy();
    Ok(tokens
        .into_iter()
        .map(|token| {
            token
                .replace("{source}", &source)
                .replace("{workdir}", &work_dir)
                .replace("{jobname}", &settings.jobname)
        })
        .collect())
}

/// Pick out `!` error lines, warnings and box notices from compiler output.
pub fn parse_messages(pass: u32, output: &str) -> Vec<CompileMessage> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim_end();
            let (level, text) = if let Some(caps) = RE_ERROR_LINE.captures(line) {
                (MessageLevel::Error, caps[1].to_string())
            } else if RE_WARNING_LINE.is_match(line) {
                (MessageLevel::Warning, line.to_string())
            } else if RE_BOX_LINE.is_match(line) {
                (MessageLevel::Info, line.to_string())
            } else {
                return None;
            };
            Some(CompileMessage { pass, level, text })
        })
        .collect()
}

fn failure_detail(messages: &[CompileMessage], output: &str) -> String {
    let errors: Vec<&str> = messages
        .iter()
        .filter(|message| message.level == MessageLevel::Error)
        .map(|message| message.text.as_str())
        .collect();
    if errors.is_empty() {
        preview(output, MAX_FAILURE_PREVIEW)
    } else {
        preview(&errors.join("; "), MAX_FAILURE_PREVIEW)
    }
}
