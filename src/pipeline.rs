//! Run orchestration.
//!
//! One control thread owns the [`PipelineState`] and walks it through
//! planning, generation, review, assembly, compilation and postprocessing.
//! Stage failures end the run in `Failed`; either way the run report and the
//! LM log are written into the work directory before returning.
use crate::assemble::assemble;
use crate::compile::{compile, CompileSettings};
use crate::config::{validate_config, RunConfig};
use crate::error::PipelineError;
use crate::lm::LanguageModel;
use crate::lm_log::{append_lm_log, LM_LOG_FILE};
use crate::markup::ValidFragment;
use crate::plan::plan_sections;
use crate::postprocess::{inspect, trim, FinalArtifact, TitleHeuristic};
use crate::process::Deadline;
use crate::report::{write_run_report, ArtifactSummary, RunReport, RUN_REPORT_FILE};
use crate::sections::{generate_sections, GenerationPolicy, SectionOutcome};
use crate::state::{
    ChartRef, DiagnosticKind, FailureRecord, PipelineState, PlannedSection, SectionId, Status,
};
use crate::util::{now_epoch_ms, sha256_hex};
use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

pub const LOCK_FILE: &str = ".rpress.lock";

/// What the caller supplies per run.
#[derive(Debug, Clone)]
pub struct RunInputs {
    pub dataset_summary: String,
    pub charts: Vec<ChartRef>,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub state: PipelineState,
    pub work_dir: PathBuf,
    pub report_path: PathBuf,
    pub lm_log_path: PathBuf,
    pub artifact: Option<FinalArtifact>,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.state.status() == Status::Done
    }
}

/// Exclusive claim on a work directory, released on drop.
#[derive(Debug)]
struct WorkDirLock {
    dir: PathBuf,
    lock_path: PathBuf,
}

impl WorkDirLock {
    fn claim(dir: &Path) -> Result<Self, PipelineError> {
        fs::create_dir_all(dir)
            .map_err(|err| PipelineError::WorkDir(format!("create {}: {err}", dir.display())))?;
        let lock_path = dir.join(LOCK_FILE);
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                return Err(PipelineError::WorkDir(format!(
                    "{} is in use by another run ({} exists)",
                    dir.display(),
                    lock_path.display()
                )))
            }
            Err(err) => {
                return Err(PipelineError::WorkDir(format!(
                    "create {}: {err}",
                    lock_path.display()
                )))
            }
        };
        if let Err(err) = writeln!(file, "{}", std::process::id()) {
            tracing::warn!(path = %lock_path.display(), error = %err, "write pid to work dir lock");
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            lock_path,
        })
    }
}

impl Drop for WorkDirLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.lock_path) {
            tracing::warn!(path = %self.lock_path.display(), error = %err, "release work dir lock");
        }
    }
}

/// Unique per-run directory under the user cache dir.
pub fn default_work_dir() -> Result<PathBuf> {
    let root = dirs::cache_dir().unwrap_or_else(std::env::temp_dir);
    Ok(root.join("rpress").join(format!(
        "run-{}-{}",
        std::process::id(),
        now_epoch_ms()?
    )))
}

pub struct Pipeline<'a> {
    config: &'a RunConfig,
    model: &'a dyn LanguageModel,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a RunConfig, model: &'a dyn LanguageModel) -> Self {
        Self { config, model }
    }

    /// Execute one run. Errors are returned only when the work directory
    /// cannot be claimed, or when a run that published nothing cannot write
    /// its record; stage failures are reported through [`RunOutcome::state`].
    pub fn run(&self, inputs: RunInputs) -> Result<RunOutcome> {
        validate_config(self.config)
            .map_err(|err| PipelineError::Config(format!("{err:#}")))?;
        let work_dir = match &self.config.work_dir {
            Some(dir) => dir.clone(),
            None => default_work_dir()?,
        };
        let lock = WorkDirLock::claim(&work_dir)?;

        let started = Instant::now();
        let deadline = Deadline::after(self.config.timeout());
        let mut state = PipelineState::new(inputs.dataset_summary, inputs.charts);
        let mut run = Run {
            config: self.config,
            model: self.model,
            deadline,
            work_dir: lock.dir.clone(),
            source_sha256: None,
            artifact: None,
        };
        tracing::info!(
            work_dir = %run.work_dir.display(),
            model = %self.model.describe(),
            sections = self.config.sections.len(),
            timeout_secs = self.config.timeout_secs,
            "run start"
        );

        if let Err(err) = run.drive(&mut state) {
            let stage = state.status();
            tracing::error!(stage = %stage, kind = %err.kind(), error = %err, "run failed");
            let record = FailureRecord {
                stage,
                kind: err.kind(),
                section: err.section(),
                message: err.to_string(),
            };
            if let Err(state_err) = state.fail(record) {
                tracing::error!(error = %state_err, "record failure");
            }
        }
        let duration_ms = started.elapsed().as_millis() as u64;

        let lm_log_path = run.work_dir.join(LM_LOG_FILE);
        let report_path = run.work_dir.join(RUN_REPORT_FILE);
        if let Err(err) = run.record(&state, &report_path, &lm_log_path, duration_ms) {
            // The PDF is already at the publish path; a missing record does
            // not undo that.
            if run.artifact.is_none() {
                return Err(err);
            }
            tracing::warn!(
                work_dir = %run.work_dir.display(),
                error = %format!("{err:#}"),
                "run record incomplete after publishing"
            );
        }

        tracing::info!(
            status = %state.status(),
            duration_ms,
            diagnostics = state.diagnostics.len(),
            "run complete"
        );
        drop(lock);
        Ok(RunOutcome {
            state,
            work_dir: run.work_dir,
            report_path,
            lm_log_path,
            artifact: run.artifact,
        })
    }
}

struct Run<'a> {
    config: &'a RunConfig,
    model: &'a dyn LanguageModel,
    deadline: Deadline,
    work_dir: PathBuf,
    source_sha256: Option<String>,
    artifact: Option<FinalArtifact>,
}

impl Run<'_> {
    /// Write `run_report.json`, then append the LM calls to the log. Both are
    /// attempted; the first error is returned.
    fn record(
        &self,
        state: &PipelineState,
        report_path: &Path,
        lm_log_path: &Path,
        duration_ms: u64,
    ) -> Result<()> {
        let mut report = RunReport::from_state(state, &self.work_dir, duration_ms);
        report.source_sha256 = self.source_sha256.clone();
        report.artifact = self.artifact.as_ref().map(|artifact| ArtifactSummary {
            path: artifact.path.clone(),
            page_count: artifact.page_count,
            removed_pages: artifact.removed_pages.clone(),
            sha256: artifact.sha256.clone(),
        });
        let report_written = write_run_report(report_path, &report)
            .with_context(|| format!("record run in {}", self.work_dir.display()));
        let log_written = append_lm_log(lm_log_path, &state.lm_calls);
        report_written.and(log_written)
    }

    fn drive(&mut self, state: &mut PipelineState) -> Result<(), PipelineError> {
        plan_sections(
            state,
            &self.config.sections,
            self.model,
            self.config.max_context_bytes,
            &self.deadline,
        )?;

        self.enter(state, Status::Generating)?;
        let planned: Vec<SectionId> = state.plan.ids().collect();
        for fragment in self.generate(state, &planned)? {
            state.insert_fragment(fragment)?;
        }

        self.enter(state, Status::Assembling)?;
        self.review(state)?;
        let document = assemble(
            &state.plan,
            state.fragments(),
            &state.chart_paths,
            &self.config.document,
        )?;
        for skipped in &document.skipped_charts {
            tracing::warn!(
                section = %skipped.chart.section,
                path = %skipped.chart.path.display(),
                reason = %skipped.reason,
                "chart skipped"
            );
            state.diagnose(
                Some(skipped.chart.section),
                DiagnosticKind::ChartSkipped,
                format!("{}: {}", skipped.chart.path.display(), skipped.reason),
            );
        }
        self.source_sha256 = Some(sha256_hex(document.source.as_bytes()));

        self.enter(state, Status::Compiling)?;
        let settings = CompileSettings::from_config(self.config, &self.work_dir);
        let compiled = compile(&document, &settings, &self.deadline)?;
        state.compile_log.extend(compiled.messages.iter().cloned());
        for soft in &compiled.soft_failures {
            state.diagnose(
                None,
                DiagnosticKind::CompileSoftFailure,
                format!(
                    "pass {} exited with {}: {}",
                    soft.pass,
                    soft.exit_code
                        .map(|code| code.to_string())
                        .unwrap_or_else(|| "signal".to_string()),
                    soft.detail
                ),
            );
        }

        self.enter(state, Status::Postprocessing)?;
        let heuristic = TitleHeuristic::from_meta(&self.config.document);
        let artifact = inspect(&compiled.artifact_path, &heuristic)?;
        for page in &artifact.removable_leading_pages {
            state.diagnose(
                None,
                DiagnosticKind::TitlePageRemoved,
                format!("removed leading page {page} (title boilerplate only)"),
            );
        }
        self.checkpoint(state)?;
        let published = trim(&artifact, &self.config.output_path)?;
        state.advance(Status::Done)?;
        self.artifact = Some(published);
        Ok(())
    }

    fn checkpoint(&self, state: &PipelineState) -> Result<(), PipelineError> {
        if self.deadline.expired() {
            return Err(PipelineError::Timeout(state.status()));
        }
        Ok(())
    }

    /// Deadline check, then a forward step.
    fn enter(&self, state: &mut PipelineState, to: Status) -> Result<(), PipelineError> {
        self.checkpoint(state)?;
        state.advance(to)?;
        tracing::info!(
            stage = %to,
            remaining_ms = self.deadline.remaining().as_millis() as u64,
            "stage start"
        );
        Ok(())
    }

    fn policy(&self) -> GenerationPolicy {
        GenerationPolicy {
            retry_budget: self.config.retry_budget,
            backoff: self.config.retry_backoff(),
            max_context_bytes: self.config.max_context_bytes,
        }
    }

    /// Fan out generators for `ids`, fold their records into `state`, and
    /// return the fragments. The first failure in plan order wins.
    fn generate(
        &self,
        state: &mut PipelineState,
        ids: &[SectionId],
    ) -> Result<Vec<ValidFragment>, PipelineError> {
        let planned: Vec<&PlannedSection> = state
            .plan
            .sections
            .iter()
            .filter(|section| ids.contains(&section.id))
            .collect();
        let outcomes: Vec<SectionOutcome> = generate_sections(
            &planned,
            &state.dataset_summary,
            &state.chart_paths,
            self.model,
            &self.policy(),
            &self.deadline,
        );

        let mut fragments = Vec::new();
        let mut first_error = None;
        for outcome in outcomes {
            state.attempts.extend(outcome.attempts);
            state.diagnostics.extend(outcome.diagnostics);
            state.lm_calls.extend(outcome.lm_calls);
            match outcome.result {
                Ok(fragment) => fragments.push(fragment),
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(fragments),
        }
    }

    /// Regenerate sections whose text repeats an earlier section's.
    fn review(&self, state: &mut PipelineState) -> Result<(), PipelineError> {
        for round in 1..=self.config.review_rounds {
            let duplicates = duplicate_sections(state);
            if duplicates.is_empty() {
                return Ok(());
            }
            let listed = join_ids(&duplicates);
            tracing::info!(round, sections = %listed, "review regenerating duplicates");
            state.diagnose(
                None,
                DiagnosticKind::Review,
                format!("round {round}: regenerating {listed} (duplicate of an earlier section)"),
            );
            state.revert_to(Status::Generating)?;
            let fragments = self.generate(state, &duplicates)?;
            for fragment in fragments {
                state.replace_fragment(fragment)?;
            }
            self.enter(state, Status::Assembling)?;
        }
        let leftover = duplicate_sections(state);
        if !leftover.is_empty() {
            state.diagnose(
                None,
                DiagnosticKind::Review,
                format!(
                    "accepted duplicate content in {} after {} review rounds",
                    join_ids(&leftover),
                    self.config.review_rounds
                ),
            );
        }
        Ok(())
    }
}

fn join_ids(ids: &[SectionId]) -> String {
    ids.iter().map(|id| id.as_str()).collect::<Vec<_>>().join(", ")
}

/// Sections, in plan order, whose fragment matches an earlier one once
/// whitespace is collapsed.
fn duplicate_sections(state: &PipelineState) -> Vec<SectionId> {
    let mut seen: Vec<String> = Vec::new();
    let mut duplicates = Vec::new();
    for id in state.plan.ids() {
        let Some(fragment) = state.fragments().get(&id) else {
            continue;
        };
        let key = fragment.text().split_whitespace().collect::<Vec<_>>().join(" ");
        if seen.contains(&key) {
            duplicates.push(id);
        } else {
            seen.push(key);
        }
    }
    duplicates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markup::{validate, MarkupFragment};
    use crate::plan::default_plan;

    fn state_with(texts: &[(SectionId, &str)]) -> PipelineState {
        let mut state = PipelineState::new("summary", Vec::new());
        state.plan = default_plan(&SectionId::ALL);
        for (id, text) in texts {
            state
                .insert_fragment(validate(&MarkupFragment::new(*id, *text)).unwrap())
                .unwrap();
        }
        state
    }

    #[test]
    fn duplicates_are_reported_after_their_first_occurrence() {
        let state = state_with(&[
            (SectionId::Narrative, "Same  text"),
            (SectionId::Stats, "Same text"),
            (SectionId::Kpis, "Different"),
        ]);
        assert_eq!(duplicate_sections(&state), vec![SectionId::Narrative]);
    }

    #[test]
    fn distinct_fragments_have_no_duplicates() {
        let state = state_with(&[(SectionId::Stats, "a"), (SectionId::Kpis, "b")]);
        assert!(duplicate_sections(&state).is_empty());
    }

    #[test]
    fn lock_rejects_a_second_claim_and_releases_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let first = WorkDirLock::claim(dir.path()).unwrap();
        let err = WorkDirLock::claim(dir.path()).unwrap_err();
        assert!(matches!(err, PipelineError::WorkDir(_)));
        drop(first);
        assert!(!dir.path().join(LOCK_FILE).exists());
        WorkDirLock::claim(dir.path()).unwrap();
    }
}
