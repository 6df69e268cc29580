//! Run state threaded through the pipeline stages.
//!
//! The orchestrator is the only writer. Generators receive borrowed inputs and
//! hand results back by value, so nothing here needs interior mutability.
use crate::error::{ErrorKind, StateError};
use crate::lm_log::LmLogEntry;
use crate::markup::ValidFragment;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Identifier of a report section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionId {
    Stats,
    Kpis,
    Narrative,
}

impl SectionId {
    pub const ALL: [SectionId; 3] = [SectionId::Stats, SectionId::Kpis, SectionId::Narrative];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stats => "stats",
            Self::Kpis => "kpis",
            Self::Narrative => "narrative",
        }
    }

    /// Heading used for the section in the assembled document.
    pub fn title(self) -> &'static str {
        match self {
            Self::Stats => "Statistical Insights",
            Self::Kpis => "Key Performance Indicators",
            Self::Narrative => "Executive Summary",
        }
    }
}

impl fmt::Display for SectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SectionId {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "stats" => Ok(Self::Stats),
            "kpis" | "kpi" => Ok(Self::Kpis),
            "narrative" => Ok(Self::Narrative),
            other => Err(format!(
                "unknown section {other:?} (expected stats, kpis or narrative)"
            )),
        }
    }
}

/// Pipeline status. `Failed` is reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Planning,
    Generating,
    Assembling,
    Compiling,
    Postprocessing,
    Done,
    Failed,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// The stage that follows on success.
    pub fn next(self) -> Option<Status> {
        match self {
            Self::Planning => Some(Self::Generating),
            Self::Generating => Some(Self::Assembling),
            Self::Assembling => Some(Self::Compiling),
            Self::Compiling => Some(Self::Postprocessing),
            Self::Postprocessing => Some(Self::Done),
            Self::Done | Self::Failed => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Planning => "planning",
            Self::Generating => "generating",
            Self::Assembling => "assembling",
            Self::Compiling => "compiling",
            Self::Postprocessing => "postprocessing",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// One planned section and the intent handed to its generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedSection {
    pub id: SectionId,
    pub title: String,
    pub goal: String,
}

/// Ordered section plan decided before generation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub sections: Vec<PlannedSection>,
}

impl Plan {
    pub fn ids(&self) -> impl Iterator<Item = SectionId> + '_ {
        self.sections.iter().map(|section| section.id)
    }

    pub fn get(&self, id: SectionId) -> Option<&PlannedSection> {
        self.sections.iter().find(|section| section.id == id)
    }
}

/// Chart image produced for a section by the external renderer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartRef {
    pub section: SectionId,
    pub path: PathBuf,
}

impl FromStr for ChartRef {
    type Err = String;

    /// Parse `<section>=<path>`.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (section, path) = raw
            .split_once('=')
            .ok_or_else(|| format!("chart must be <section>=<path> (got {raw:?})"))?;
        let path = path.trim();
        if path.is_empty() {
            return Err(format!("chart path is empty in {raw:?}"));
        }
        Ok(Self {
            section: section.parse()?,
            path: PathBuf::from(path),
        })
    }
}

/// Message captured from a compiler pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileMessage {
    pub pass: u32,
    pub level: MessageLevel,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    Sanitize,
    Repair,
    Retry,
    PlanFallback,
    ChartSkipped,
    CompileSoftFailure,
    Review,
    TitlePageRemoved,
}

/// Non-fatal observation accumulated over the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub stage: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<SectionId>,
    pub kind: DiagnosticKind,
    pub message: String,
}

/// Terminal failure recorded when the run halts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub stage: Status,
    pub kind: ErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<SectionId>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Accepted,
    Unavailable,
    Invalid,
    Cancelled,
}

/// One generator attempt, kept for the run report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub section: SectionId,
    /// 1-based attempt number.
    pub attempt: u32,
    pub outcome: AttemptOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Repair the validator tried before giving up or accepting.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repair: Option<String>,
    pub duration_ms: u64,
}

/// Mutable record owned by the orchestrator for the lifetime of one run.
#[derive(Debug, Serialize)]
pub struct PipelineState {
    pub dataset_summary: String,
    pub plan: Plan,
    fragments: IndexMap<SectionId, ValidFragment>,
    pub chart_paths: Vec<ChartRef>,
    pub compile_log: Vec<CompileMessage>,
    status: Status,
    error: Option<FailureRecord>,
    pub diagnostics: Vec<Diagnostic>,
    pub attempts: Vec<AttemptRecord>,
    /// Full prompts and replies; written to `lm_log.jsonl`, not the report.
    #[serde(skip)]
    pub lm_calls: Vec<LmLogEntry>,
}

impl PipelineState {
    pub fn new(dataset_summary: impl Into<String>, chart_paths: Vec<ChartRef>) -> Self {
        Self {
            dataset_summary: dataset_summary.into(),
            plan: Plan::default(),
            fragments: IndexMap::new(),
            chart_paths,
            compile_log: Vec::new(),
            status: Status::Planning,
            error: None,
            diagnostics: Vec::new(),
            attempts: Vec::new(),
            lm_calls: Vec::new(),
        }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn error(&self) -> Option<&FailureRecord> {
        self.error.as_ref()
    }

    pub fn fragments(&self) -> &IndexMap<SectionId, ValidFragment> {
        &self.fragments
    }

    /// Move to the next stage. Only single forward steps are legal.
    pub fn advance(&mut self, to: Status) -> Result<(), StateError> {
        if self.status.next() != Some(to) {
            return Err(StateError::IllegalTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Return to an earlier non-terminal stage for a retry.
    pub fn revert_to(&mut self, to: Status) -> Result<(), StateError> {
        if self.status.is_terminal() || to.is_terminal() || to >= self.status {
            return Err(StateError::IllegalTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Halt the run. Terminal states are final.
    pub fn fail(&mut self, record: FailureRecord) -> Result<(), StateError> {
        if self.status.is_terminal() {
            return Err(StateError::IllegalTransition {
                from: self.status,
                to: Status::Failed,
            });
        }
        self.status = Status::Failed;
        self.error = Some(record);
        Ok(())
    }

    pub fn insert_fragment(&mut self, fragment: ValidFragment) -> Result<(), StateError> {
        let section = fragment.section();
        if self.fragments.contains_key(&section) {
            return Err(StateError::FragmentExists(section));
        }
        self.fragments.insert(section, fragment);
        Ok(())
    }

    /// Swap a regenerated fragment in, keeping its plan position.
    pub fn replace_fragment(&mut self, fragment: ValidFragment) -> Result<(), StateError> {
        let section = fragment.section();
        match self.fragments.get_mut(&section) {
            Some(slot) => {
                *slot = fragment;
                Ok(())
            }
            None => Err(StateError::FragmentMissing(section)),
        }
    }

    pub fn diagnose(
        &mut self,
        section: Option<SectionId>,
        kind: DiagnosticKind,
        message: impl Into<String>,
    ) {
        self.diagnostics.push(Diagnostic {
            stage: self.status,
            section,
            kind,
            message: message.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markup::{validate, MarkupFragment};

    fn fragment(section: SectionId, text: &str) -> ValidFragment {
        validate(&MarkupFragment::new(section, text)).expect("valid fragment")
    }

    #[test]
    fn advance_only_steps_forward() {
        let mut state = PipelineState::new("summary", Vec::new());
        assert_eq!(
            state.advance(Status::Compiling),
            Err(StateError::IllegalTransition {
                from: Status::Planning,
                to: Status::Compiling
            })
        );
        state.advance(Status::Generating).unwrap();
        state.advance(Status::Assembling).unwrap();
        assert_eq!(state.status(), Status::Assembling);
    }

    #[test]
    fn revert_moves_back_but_never_forward() {
        let mut state = PipelineState::new("summary", Vec::new());
        state.advance(Status::Generating).unwrap();
        state.advance(Status::Assembling).unwrap();
        assert!(state.revert_to(Status::Compiling).is_err());
        state.revert_to(Status::Generating).unwrap();
        assert_eq!(state.status(), Status::Generating);
    }

    #[test]
    fn failed_is_terminal() {
        let mut state = PipelineState::new("summary", Vec::new());
        state
            .fail(FailureRecord {
                stage: Status::Planning,
                kind: ErrorKind::Timeout,
                section: None,
                message: "deadline".to_string(),
            })
            .unwrap();
        assert_eq!(state.status(), Status::Failed);
        assert!(state.advance(Status::Generating).is_err());
        assert!(state.revert_to(Status::Planning).is_err());
        assert!(state
            .fail(FailureRecord {
                stage: Status::Failed,
                kind: ErrorKind::Timeout,
                section: None,
                message: "again".to_string(),
            })
            .is_err());
    }

    #[test]
    fn fragments_are_written_once_and_replaced_in_place() {
        let mut state = PipelineState::new("summary", Vec::new());
        state
            .insert_fragment(fragment(SectionId::Stats, "stats body"))
            .unwrap();
        state
            .insert_fragment(fragment(SectionId::Kpis, "kpi body"))
            .unwrap();
        assert_eq!(
            state.insert_fragment(fragment(SectionId::Stats, "again")),
            Err(StateError::FragmentExists(SectionId::Stats))
        );
        state
            .replace_fragment(fragment(SectionId::Stats, "regenerated"))
            .unwrap();
        let order: Vec<_> = state.fragments().keys().copied().collect();
        assert_eq!(order, vec![SectionId::Stats, SectionId::Kpis]);
        assert_eq!(state.fragments()[&SectionId::Stats].text(), "regenerated");
        assert_eq!(
            state.replace_fragment(fragment(SectionId::Narrative, "x")),
            Err(StateError::FragmentMissing(SectionId::Narrative))
        );
    }

    #[test]
    fn chart_ref_parses_section_and_path() {
        let chart: ChartRef = "kpis=charts/units.png".parse().unwrap();
        assert_eq!(chart.section, SectionId::Kpis);
        assert_eq!(chart.path, PathBuf::from("charts/units.png"));
        assert!("units.png".parse::<ChartRef>().is_err());
        assert!("other=units.png".parse::<ChartRef>().is_err());
    }
}
