//! Record of every language model call made during a run.
//!
//! Entries are written to `lm_log.jsonl` in the work directory as
//! newline-delimited JSON, one object per call, with the complete prompt and
//! reply so a failed run can be replayed by hand:
//!
//! ```jsonl
//! {"schema_version":1,"ts":1707900000000,"kind":"plan","attempt":1,"duration_ms":4200,...}
//! {"schema_version":1,"ts":1707900004300,"kind":"section","section":"kpis","attempt":1,...}
//! ```
use crate::state::SectionId;
use crate::util::{now_epoch_ms, preview};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::time::Instant;

pub const LM_LOG_SCHEMA_VERSION: u32 = 1;

pub const LM_LOG_FILE: &str = "lm_log.jsonl";

const PROMPT_PREVIEW_BYTES: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LmCallKind {
    /// Section goals for the plan.
    Plan,
    /// First attempt at a section.
    Section,
    /// A section attempt carrying the previous failure.
    SectionRetry,
}

impl fmt::Display for LmCallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plan => write!(f, "plan"),
            Self::Section => write!(f, "section"),
            Self::SectionRetry => write!(f, "section_retry"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LmOutcome {
    /// Reply was used.
    Success,
    /// Reply arrived but was rejected.
    Rejected,
    /// No reply.
    Unavailable,
    Cancelled,
}

impl fmt::Display for LmOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Rejected => write!(f, "rejected"),
            Self::Unavailable => write!(f, "unavailable"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LmLogEntry {
    pub schema_version: u32,

    /// Unix timestamp in milliseconds when the entry was finished.
    pub ts: u64,

    pub kind: LmCallKind,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub section: Option<SectionId>,

    /// 1-based attempt number within the section or plan call.
    pub attempt: u32,

    pub duration_ms: u64,

    pub outcome: LmOutcome,

    /// Why the reply was rejected or missing.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,

    /// First ~500 bytes of the prompt on one line, for grepping.
    pub prompt_preview: String,

    pub prompt: String,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub response: Option<String>,
}

/// Times one call and finishes it into an [`LmLogEntry`].
pub struct LmLogBuilder {
    start: Instant,
    kind: LmCallKind,
    section: Option<SectionId>,
    attempt: u32,
    prompt: String,
}

impl LmLogBuilder {
    pub fn new(kind: LmCallKind, attempt: u32, prompt: &str) -> Self {
        Self {
            start: Instant::now(),
            kind,
            section: None,
            attempt,
            prompt: prompt.to_string(),
        }
    }

    pub fn with_section(mut self, section: SectionId) -> Self {
        self.section = Some(section);
        self
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn success(self, response: &str) -> LmLogEntry {
        self.build(LmOutcome::Success, None, Some(response.to_string()))
    }

    /// The reply arrived but could not be used.
    pub fn rejected(self, response: &str, error: impl Into<String>) -> LmLogEntry {
        self.build(
            LmOutcome::Rejected,
            Some(error.into()),
            Some(response.to_string()),
        )
    }

    pub fn unavailable(self, error: impl Into<String>) -> LmLogEntry {
        self.build(LmOutcome::Unavailable, Some(error.into()), None)
    }

    pub fn cancelled(self) -> LmLogEntry {
        self.build(
            LmOutcome::Cancelled,
            Some("run deadline expired".to_string()),
            None,
        )
    }

    fn build(
        self,
        outcome: LmOutcome,
        error: Option<String>,
        response: Option<String>,
    ) -> LmLogEntry {
        let duration_ms = self.elapsed_ms();
        LmLogEntry {
            schema_version: LM_LOG_SCHEMA_VERSION,
            ts: now_epoch_ms().map(|ms| ms as u64).unwrap_or(0),
            kind: self.kind,
            section: self.section,
            attempt: self.attempt,
            duration_ms,
            outcome,
            error,
            prompt_preview: preview(&self.prompt, PROMPT_PREVIEW_BYTES),
            prompt: self.prompt,
            response,
        }
    }
}

/// Append entries to the log at `path`, creating it if needed.
pub fn append_lm_log(path: &Path, entries: &[LmLogEntry]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open lm_log for append: {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    for entry in entries {
        let line = serde_json::to_string(entry).context("serialize lm_log entry")?;
        writeln!(writer, "{line}").context("write lm_log entry")?;
    }
    writer.flush().context("flush lm_log")?;
    Ok(())
}

/// Load all entries; corrupt lines are skipped with a warning.
pub fn load_lm_log(path: &Path) -> Result<Vec<LmLogEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path).with_context(|| format!("open lm_log: {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut entries = Vec::new();

    for (line_num, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("read line {} of lm_log", line_num + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LmLogEntry>(&line) {
            Ok(entry) => entries.push(entry),
            Err(err) => {
                tracing::warn!(line = line_num + 1, error = %err, "skip corrupt lm_log entry");
            }
        }
    }

    Ok(entries)
}
