//! Section generators.
//!
//! Each planned section is written by the model, normalized, sanitized and
//! validated. A rejected reply is retried with a prompt that carries the
//! validator's complaint; an unavailable model is retried after a doubling
//! backoff. Generators see only borrowed inputs and hand their results back
//! by value, so they can run side by side on scoped threads.
use crate::error::PipelineError;
use crate::lm::{strip_code_fences, LanguageModel, LmError};
use crate::lm_log::{LmCallKind, LmLogBuilder, LmLogEntry};
use crate::markup::{sanitize, validate, MarkupFragment, ValidFragment};
use crate::process::Deadline;
use crate::state::{
    AttemptOutcome, AttemptRecord, ChartRef, Diagnostic, DiagnosticKind, PlannedSection,
    SectionId, Status,
};
use crate::templates::{NARRATIVE_PROMPT_MD, RETRY_PROMPT_MD, SECTION_PROMPT_MD};
use crate::util::{preview, truncate_string};
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;
use std::thread;
use std::time::Duration;

const RETRY_SNIPPET_BYTES: usize = 1000;
const TRUNCATED_MARKER: &str = "\n[... summary truncated]";

static RE_PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\[insert[^\]\n]*\]").expect("valid placeholder regex"));

/// Lines that belong to the document template, not to a section body.
const TEMPLATE_LINE_PREFIXES: &[&str] = &[
    "\\documentclass",
    "\\usepackage",
    "\\title{",
    "\\author{",
    "\\date{",
    "\\maketitle",
    "\\tableofcontents",
];

#[derive(Debug, Clone, Copy)]
pub struct GenerationPolicy {
    /// Attempts after the first.
    pub retry_budget: u32,
    /// First wait after an unavailable reply; doubles each time.
    pub backoff: Duration,
    pub max_context_bytes: usize,
}

/// Read-only view of what one generator needs.
#[derive(Debug, Clone, Copy)]
pub struct SectionInput<'a> {
    pub section: &'a PlannedSection,
    pub dataset_summary: &'a str,
    pub charts: &'a [ChartRef],
}

#[derive(Debug)]
pub struct SectionOutcome {
    pub section: SectionId,
    pub result: Result<ValidFragment, PipelineError>,
    pub attempts: Vec<AttemptRecord>,
    pub diagnostics: Vec<Diagnostic>,
    pub lm_calls: Vec<LmLogEntry>,
}

/// What went wrong last time, carried into the next prompt.
#[derive(Debug, Clone)]
struct FailureContext {
    error: String,
    repair: Option<String>,
    response: String,
}

enum LastFailure {
    Unavailable(String),
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionGenerator {
    id: SectionId,
}

impl SectionGenerator {
    pub fn for_section(id: SectionId) -> Self {
        Self { id }
    }

    fn persona(&self) -> &'static str {
        match self.id {
            SectionId::Stats => "Lead Statistical Analyst",
            SectionId::Kpis | SectionId::Narrative => "Senior Business Consultant",
        }
    }

    fn template(&self) -> &'static str {
        match self.id {
            SectionId::Narrative => NARRATIVE_PROMPT_MD,
            SectionId::Stats | SectionId::Kpis => SECTION_PROMPT_MD,
        }
    }

    pub fn build_prompt(&self, input: &SectionInput<'_>, max_context_bytes: usize) -> String {
        let charts = input
            .charts
            .iter()
            .filter(|chart| chart.section == self.id)
            .map(|chart| format!("- {}", chart_label(&chart.path)))
            .collect::<Vec<_>>();
        let charts = if charts.is_empty() {
            "(no charts for this section)".to_string()
        } else {
            charts.join("\n")
        };
        let summary = bounded_summary(input.dataset_summary, max_context_bytes);

        self.template()
            .replace("{persona}", self.persona())
            .replace("{section_title}", &input.section.title)
            .replace("{section_label}", &self.id.as_str().to_ascii_uppercase())
            .replace("{goal}", &input.section.goal)
            .replace("{charts}", &charts)
            .replace("{dataset_summary}", &summary)
    }

    /// Run the bounded attempt loop for one section.
    pub fn generate(
        &self,
        input: &SectionInput<'_>,
        model: &dyn LanguageModel,
        policy: &GenerationPolicy,
        deadline: &Deadline,
    ) -> SectionOutcome {
        let mut outcome = SectionOutcome {
            section: self.id,
            result: Err(PipelineError::Timeout(Status::Generating)),
            attempts: Vec::new(),
            diagnostics: Vec::new(),
            lm_calls: Vec::new(),
        };
        let max_attempts = policy.retry_budget + 1;
        let base_prompt = self.build_prompt(input, policy.max_context_bytes);
        let mut failure: Option<FailureContext> = None;
        let mut last: Option<LastFailure> = None;
        let mut backoff = policy.backoff;

        for attempt in 1..=max_attempts {
            if deadline.expired() {
                return outcome;
            }
            let (kind, prompt) = match &failure {
                Some(context) => (
                    LmCallKind::SectionRetry,
                    build_retry_prompt(&base_prompt, context),
                ),
                None => (LmCallKind::Section, base_prompt.clone()),
            };
            if attempt > 1 {
                tracing::info!(section = %self.id, attempt, max_attempts, "section retry");
            }

            let log = LmLogBuilder::new(kind, attempt, &prompt).with_section(self.id);
            let reply = match model.invoke(&prompt, deadline) {
                Ok(reply) => reply,
                Err(LmError::Cancelled) => {
                    outcome
                        .attempts
                        .push(self.record(attempt, AttemptOutcome::Cancelled, None, None, &log));
                    outcome.lm_calls.push(log.cancelled());
                    return outcome;
                }
                Err(LmError::Unavailable(detail)) => {
                    tracing::warn!(section = %self.id, attempt, error = %detail, "model unavailable");
                    outcome.attempts.push(self.record(
                        attempt,
                        AttemptOutcome::Unavailable,
                        Some(detail.clone()),
                        None,
                        &log,
                    ));
                    outcome.lm_calls.push(log.unavailable(detail.clone()));
                    self.note(
                        &mut outcome,
                        DiagnosticKind::Retry,
                        format!("attempt {attempt}/{max_attempts}: model unavailable: {detail}"),
                    );
                    last = Some(LastFailure::Unavailable(detail));
                    if attempt < max_attempts {
                        thread::sleep(backoff.min(deadline.remaining()));
                        backoff = backoff.saturating_mul(2);
                    }
                    continue;
                }
            };

            let sanitized = sanitize(&normalize_reply(&reply));
            for dropped in &sanitized.diagnostics {
                self.note(
                    &mut outcome,
                    DiagnosticKind::Sanitize,
                    format!(
                        "dropped U+{:04X} at char {} ({:?})",
                        u32::from(dropped.character),
                        dropped.char_offset,
                        dropped.reason
                    ),
                );
            }

            match validate(&MarkupFragment::new(self.id, sanitized.text)) {
                Ok(fragment) => {
                    if let Some(repair) = fragment.repair() {
                        self.note(
                            &mut outcome,
                            DiagnosticKind::Repair,
                            format!("attempt {attempt}: repaired fragment ({repair})"),
                        );
                    }
                    outcome.attempts.push(self.record(
                        attempt,
                        AttemptOutcome::Accepted,
                        None,
                        fragment.repair().map(str::to_string),
                        &log,
                    ));
                    outcome.lm_calls.push(log.success(&reply));
                    tracing::info!(
                        section = %self.id,
                        attempt,
                        fragment_bytes = fragment.text().len(),
                        "section accepted"
                    );
                    outcome.result = Ok(fragment);
                    return outcome;
                }
                Err(err) => {
                    let detail = err.to_string();
                    tracing::warn!(section = %self.id, attempt, error = %detail, "fragment rejected");
                    if let Some(repair) = &err.repair {
                        self.note(
                            &mut outcome,
                            DiagnosticKind::Repair,
                            format!("attempt {attempt}: repair failed ({repair}): {detail}"),
                        );
                    } else {
                        self.note(
                            &mut outcome,
                            DiagnosticKind::Retry,
                            format!("attempt {attempt}/{max_attempts}: {detail}"),
                        );
                    }
                    outcome.attempts.push(self.record(
                        attempt,
                        AttemptOutcome::Invalid,
                        Some(detail.clone()),
                        err.repair.clone(),
                        &log,
                    ));
                    outcome.lm_calls.push(log.rejected(&reply, detail.clone()));
                    failure = Some(FailureContext {
                        error: detail.clone(),
                        repair: err.repair,
                        response: reply,
                    });
                    last = Some(LastFailure::Invalid(detail));
                }
            }
        }

        outcome.result = Err(match last {
            Some(LastFailure::Unavailable(detail)) => PipelineError::GenerationUnavailable {
                section: self.id,
                attempts: max_attempts,
                detail,
            },
            Some(LastFailure::Invalid(detail)) => PipelineError::ValidationFailure {
                section: self.id,
                attempts: max_attempts,
                detail,
            },
            None => PipelineError::Timeout(Status::Generating),
        });
        outcome
    }

    fn record(
        &self,
        attempt: u32,
        outcome: AttemptOutcome,
        detail: Option<String>,
        repair: Option<String>,
        log: &LmLogBuilder,
    ) -> AttemptRecord {
        AttemptRecord {
            section: self.id,
            attempt,
            outcome,
            detail,
            repair,
            duration_ms: log.elapsed_ms(),
        }
    }

    fn note(&self, outcome: &mut SectionOutcome, kind: DiagnosticKind, message: String) {
        outcome.diagnostics.push(Diagnostic {
            stage: Status::Generating,
            section: Some(self.id),
            kind,
            message,
        });
    }
}

/// Fan out one generator per section and collect outcomes in input order.
pub fn generate_sections(
    sections: &[&PlannedSection],
    dataset_summary: &str,
    charts: &[ChartRef],
    model: &dyn LanguageModel,
    policy: &GenerationPolicy,
    deadline: &Deadline,
) -> Vec<SectionOutcome> {
    thread::scope(|scope| {
        let handles: Vec<_> = sections
            .iter()
            .map(|&section| {
                let input = SectionInput {
                    section,
                    dataset_summary,
                    charts,
                };
                let handle = scope.spawn(move || {
                    SectionGenerator::for_section(section.id).generate(
                        &input, model, policy, deadline,
                    )
                });
                (section.id, handle)
            })
            .collect();

        handles
            .into_iter()
            .map(|(id, handle)| {
                handle.join().unwrap_or_else(|_| SectionOutcome {
                    section: id,
                    result: Err(PipelineError::GenerationUnavailable {
                        section: id,
                        attempts: 0,
                        detail: "generator thread panicked".to_string(),
                    }),
                    attempts: Vec::new(),
                    diagnostics: Vec::new(),
                    lm_calls: Vec::new(),
                })
            })
            .collect()
    })
}

/// Dataset summary cut to the prompt budget on a char boundary.
pub fn bounded_summary(summary: &str, max_bytes: usize) -> String {
    if summary.len() <= max_bytes {
        return summary.to_string();
    }
    let keep = max_bytes.saturating_sub(TRUNCATED_MARKER.len());
    format!("{}{TRUNCATED_MARKER}", truncate_string(summary, keep))
}

/// Strip wrapping the model adds around the LaTeX body.
pub fn normalize_reply(reply: &str) -> String {
    let mut body = strip_code_fences(reply);
    if let Some(start) = body.find("\\begin{document}") {
        body = &body[start + "\\begin{document}".len()..];
    }
    if let Some(end) = body.find("\\end{document}") {
        body = &body[..end];
    }
    let kept = body
        .lines()
        .filter(|line| {
            let line = line.trim_start();
            !TEMPLATE_LINE_PREFIXES
                .iter()
                .any(|prefix| line.starts_with(prefix))
        })
        .collect::<Vec<_>>()
        .join("\n");
    RE_PLACEHOLDER
        .replace_all(kept.trim(), "N/A")
        .into_owned()
}

fn build_retry_prompt(base_prompt: &str, failure: &FailureContext) -> String {
    let repair = match &failure.repair {
        Some(repair) => format!("An automatic repair was tried ({repair}) and did not fix it."),
        None => String::new(),
    };
    let snippet = if failure.response.len() > RETRY_SNIPPET_BYTES {
        format!(
            "{}...(truncated)",
            truncate_string(&failure.response, RETRY_SNIPPET_BYTES)
        )
    } else {
        failure.response.clone()
    };
    RETRY_PROMPT_MD
        .replace("{error}", &failure.error)
        .replace("{repair}", &repair)
        .replace("{previous_response}", &snippet)
        .replace("{task}", base_prompt)
}

fn chart_label(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| preview(&path.display().to_string(), 80))
}

#[cfg(test)]
#[path = "sections_tests.rs"]
mod tests;
