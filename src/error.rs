//! Failure taxonomy for the report pipeline.
//!
//! Stage code returns [`PipelineError`]; the orchestrator turns whatever
//! escapes a stage into a [`crate::state::FailureRecord`] on the run state.
use crate::state::{SectionId, Status};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Serializable classification of a failure or diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    GenerationUnavailable,
    ValidationFailure,
    AssemblyMissingFragment,
    Template,
    CompileHardFailure,
    CompileSoftFailure,
    PostprocessIo,
    Timeout,
    Config,
    WorkDir,
    State,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::GenerationUnavailable => "generation_unavailable",
            Self::ValidationFailure => "validation_failure",
            Self::AssemblyMissingFragment => "assembly_missing_fragment",
            Self::Template => "template",
            Self::CompileHardFailure => "compile_hard_failure",
            Self::CompileSoftFailure => "compile_soft_failure",
            Self::PostprocessIo => "postprocess_io",
            Self::Timeout => "timeout",
            Self::Config => "config",
            Self::WorkDir => "work_dir",
            Self::State => "state",
        };
        f.write_str(label)
    }
}

/// Unrecoverable pipeline failure. Recoverable conditions never escape the
/// stage that produced them.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{section}: generative capability unavailable after {attempts} attempts: {detail}")]
    GenerationUnavailable {
        section: SectionId,
        attempts: u32,
        detail: String,
    },

    #[error("{section}: fragment failed validation after {attempts} attempts: {detail}")]
    ValidationFailure {
        section: SectionId,
        attempts: u32,
        detail: String,
    },

    #[error("planned section {0} has no valid fragment")]
    AssemblyMissingFragment(SectionId),

    #[error("document template error: {0}")]
    Template(String),

    #[error("compile failed: {0}")]
    CompileHardFailure(String),

    #[error("postprocess failed: {0}")]
    PostprocessIo(String),

    #[error("run deadline expired during {0}")]
    Timeout(Status),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("work directory unavailable: {0}")]
    WorkDir(String),

    #[error(transparent)]
    State(#[from] StateError),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::GenerationUnavailable { .. } => ErrorKind::GenerationUnavailable,
            Self::ValidationFailure { .. } => ErrorKind::ValidationFailure,
            Self::AssemblyMissingFragment(_) => ErrorKind::AssemblyMissingFragment,
            Self::Template(_) => ErrorKind::Template,
            Self::CompileHardFailure(_) => ErrorKind::CompileHardFailure,
            Self::PostprocessIo(_) => ErrorKind::PostprocessIo,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Config(_) => ErrorKind::Config,
            Self::WorkDir(_) => ErrorKind::WorkDir,
            Self::State(_) => ErrorKind::State,
        }
    }

    /// Section the failure is attributed to, when there is one.
    pub fn section(&self) -> Option<SectionId> {
        match self {
            Self::GenerationUnavailable { section, .. }
            | Self::ValidationFailure { section, .. } => Some(*section),
            Self::AssemblyMissingFragment(section) => Some(*section),
            _ => None,
        }
    }
}

/// Rejected status transition on the pipeline state.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("illegal status transition {from} -> {to}")]
    IllegalTransition { from: Status, to: Status },

    #[error("fragment for {0} already recorded")]
    FragmentExists(SectionId),

    #[error("no fragment recorded for {0}")]
    FragmentMissing(SectionId),
}
