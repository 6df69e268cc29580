//! `run_report.json`: what a run did, written whether it succeeded or not.
use crate::state::{
    AttemptRecord, ChartRef, CompileMessage, Diagnostic, FailureRecord, PipelineState, Plan,
    SectionId, Status,
};
use crate::util::sha256_hex;
use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const RUN_REPORT_SCHEMA_VERSION: u32 = 1;
pub const RUN_REPORT_FILE: &str = "run_report.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentSummary {
    pub bytes: usize,
    pub sha256: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repair: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSummary {
    pub path: PathBuf,
    pub page_count: usize,
    pub removed_pages: Vec<u32>,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub schema_version: u32,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FailureRecord>,
    pub work_dir: PathBuf,
    pub duration_ms: u64,
    pub plan: Plan,
    pub charts: Vec<ChartRef>,
    pub fragments: IndexMap<SectionId, FragmentSummary>,
    pub attempts: Vec<AttemptRecord>,
    pub diagnostics: Vec<Diagnostic>,
    pub compile_log: Vec<CompileMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactSummary>,
}

impl RunReport {
    pub fn from_state(state: &PipelineState, work_dir: &Path, duration_ms: u64) -> Self {
        let fragments = state
            .fragments()
            .iter()
            .map(|(id, fragment)| {
                (
                    *id,
                    FragmentSummary {
                        bytes: fragment.text().len(),
                        sha256: sha256_hex(fragment.text().as_bytes()),
                        repair: fragment.repair().map(str::to_string),
                    },
                )
            })
            .collect();
        Self {
            schema_version: RUN_REPORT_SCHEMA_VERSION,
            status: state.status(),
            error: state.error().cloned(),
            work_dir: work_dir.to_path_buf(),
            duration_ms,
            plan: state.plan.clone(),
            charts: state.chart_paths.clone(),
            fragments,
            attempts: state.attempts.clone(),
            diagnostics: state.diagnostics.clone(),
            compile_log: state.compile_log.clone(),
            source_sha256: None,
            artifact: None,
        }
    }
}

pub fn write_run_report(path: &Path, report: &RunReport) -> Result<()> {
    let mut text = serde_json::to_string_pretty(report).context("serialize run report")?;
    text.push('\n');
    fs::write(path, text.as_bytes()).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

pub fn load_run_report(path: &Path) -> Result<RunReport> {
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let report: RunReport =
        serde_json::from_slice(&bytes).with_context(|| format!("parse {}", path.display()))?;
    if report.schema_version != RUN_REPORT_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported run report schema_version {} (expected {})",
            report.schema_version,
            RUN_REPORT_SCHEMA_VERSION
        ));
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::markup::{validate, MarkupFragment};
    use crate::state::DiagnosticKind;

    #[test]
    fn report_survives_a_write_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = PipelineState::new("Columns: region", Vec::new());
        state.advance(Status::Generating).unwrap();
        let fragment = validate(&MarkupFragment::new(SectionId::Kpis, "\\begin{itemize}\\item a"))
            .unwrap();
        state.insert_fragment(fragment).unwrap();
        state.diagnose(Some(SectionId::Kpis), DiagnosticKind::Repair, "appended \\end{itemize}");
        state
            .fail(FailureRecord {
                stage: Status::Generating,
                kind: ErrorKind::ValidationFailure,
                section: Some(SectionId::Stats),
                message: "unterminated".to_string(),
            })
            .unwrap();

        let path = dir.path().join(RUN_REPORT_FILE);
        write_run_report(&path, &RunReport::from_state(&state, dir.path(), 42)).unwrap();
        let loaded = load_run_report(&path).unwrap();
        assert_eq!(loaded.status, Status::Failed);
        assert_eq!(loaded.error.unwrap().kind, ErrorKind::ValidationFailure);
        let kpis = &loaded.fragments[&SectionId::Kpis];
        assert_eq!(kpis.repair.as_deref(), Some("appended \\end{itemize}"));
        assert_eq!(loaded.diagnostics.len(), 1);
        assert!(loaded.artifact.is_none());
    }

    #[test]
    fn rejects_other_schema_versions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(RUN_REPORT_FILE);
        let state = PipelineState::new("", Vec::new());
        let mut report = RunReport::from_state(&state, dir.path(), 0);
        report.schema_version = 99;
        write_run_report(&path, &report).unwrap();
        let err = load_run_report(&path).unwrap_err();
        assert!(err.to_string().contains("schema_version 99"));
    }
}
