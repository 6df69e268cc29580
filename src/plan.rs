//! Section planning.
//!
//! The model is asked for one goal per configured section. Anything it gets
//! wrong (no reply, invalid JSON, a missing or empty goal) falls back to a
//! fixed default goal, so planning itself never fails except on timeout.
use crate::error::PipelineError;
use crate::lm::{extract_json, LanguageModel, LmError};
use crate::lm_log::{LmCallKind, LmLogBuilder};
use crate::process::Deadline;
use crate::sections::bounded_summary;
use crate::state::{DiagnosticKind, PipelineState, Plan, PlannedSection, SectionId, Status};
use crate::templates::PLAN_PROMPT_MD;
use crate::util::truncate_string;
use serde::Deserialize;
use serde_json::Value;

const MAX_GOAL_BYTES: usize = 600;

#[derive(Debug, Default, Deserialize)]
struct PlanGoals {
    #[serde(default)]
    stats_goal: Option<Value>,
    #[serde(default, alias = "kpis_goal")]
    kpi_goal: Option<Value>,
    #[serde(default, alias = "summary_goal")]
    narrative_goal: Option<Value>,
}

impl PlanGoals {
    fn goal(&self, id: SectionId) -> Option<String> {
        let value = match id {
            SectionId::Stats => self.stats_goal.as_ref(),
            SectionId::Kpis => self.kpi_goal.as_ref(),
            SectionId::Narrative => self.narrative_goal.as_ref(),
        }?;
        let text = flatten_goal(value);
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        Some(truncate_string(text, MAX_GOAL_BYTES))
    }
}

/// Goals sometimes come back as lists or objects instead of a sentence.
fn flatten_goal(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Array(items) => items
            .iter()
            .map(flatten_goal)
            .collect::<Vec<_>>()
            .join("; "),
        Value::Object(fields) => fields
            .iter()
            .map(|(key, value)| format!("{}: {}", key.replace('_', " "), flatten_goal(value)))
            .collect::<Vec<_>>()
            .join("; "),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

pub fn default_goal(id: SectionId) -> &'static str {
    match id {
        SectionId::Stats => {
            "Describe the distribution, spread and notable outliers of the main numeric columns."
        }
        SectionId::Kpis => {
            "Report the headline performance indicators and how they compare across categories."
        }
        SectionId::Narrative => {
            "Summarize the most important findings for an executive audience and recommend actions."
        }
    }
}

pub fn default_plan(sections: &[SectionId]) -> Plan {
    Plan {
        sections: sections
            .iter()
            .map(|&id| PlannedSection {
                id,
                title: id.title().to_string(),
                goal: default_goal(id).to_string(),
            })
            .collect(),
    }
}

pub fn build_plan_prompt(summary: &str, sections: &[SectionId]) -> String {
    let listed = sections
        .iter()
        .map(|id| format!("- `{}`: {}", id, id.title()))
        .collect::<Vec<_>>()
        .join("\n");
    PLAN_PROMPT_MD
        .replace("{sections}", &listed)
        .replace("{dataset_summary}", summary)
}

/// Ask the model for section goals and record the plan on `state`.
pub fn plan_sections(
    state: &mut PipelineState,
    sections: &[SectionId],
    model: &dyn LanguageModel,
    max_context_bytes: usize,
    deadline: &Deadline,
) -> Result<(), PipelineError> {
    if deadline.expired() {
        return Err(PipelineError::Timeout(Status::Planning));
    }
    let summary = bounded_summary(&state.dataset_summary, max_context_bytes);
    let prompt = build_plan_prompt(&summary, sections);
    let log = LmLogBuilder::new(LmCallKind::Plan, 1, &prompt);

    let goals = match model.invoke(&prompt, deadline) {
        Ok(reply) => match serde_json::from_str::<PlanGoals>(extract_json(&reply)) {
            Ok(goals) => {
                state.lm_calls.push(log.success(&reply));
                Some(goals)
            }
            Err(err) => {
                let detail = format!("plan reply is not valid JSON: {err}");
                state.lm_calls.push(log.rejected(&reply, detail.clone()));
                state.diagnose(None, DiagnosticKind::PlanFallback, detail);
                None
            }
        },
        Err(LmError::Cancelled) => {
            state.lm_calls.push(log.cancelled());
            return Err(PipelineError::Timeout(Status::Planning));
        }
        Err(LmError::Unavailable(detail)) => {
            state.lm_calls.push(log.unavailable(detail.clone()));
            state.diagnose(
                None,
                DiagnosticKind::PlanFallback,
                format!("planner unavailable, using default goals: {detail}"),
            );
            None
        }
    };

    let parsed = goals.is_some();
    let goals = goals.unwrap_or_default();
    let mut plan = Plan::default();
    for &id in sections {
        let goal = match goals.goal(id) {
            Some(goal) => goal,
            None => {
                if parsed {
                    state.diagnose(
                        Some(id),
                        DiagnosticKind::PlanFallback,
                        "planner gave no goal for this section; using default",
                    );
                }
                default_goal(id).to_string()
            }
        };
        plan.sections.push(PlannedSection {
            id,
            title: id.title().to_string(),
            goal,
        });
    }

    tracing::info!(
        sections = plan.sections.len(),
        fallbacks = state
            .diagnostics
            .iter()
            .filter(|diag| diag.kind == DiagnosticKind::PlanFallback)
            .count(),
        "plan ready"
    );
    state.plan = plan;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Reply(Result<String, LmError>);

    impl LanguageModel for Reply {
        fn describe(&self) -> String {
            "fixed reply".to_string()
        }

        fn invoke(&self, _prompt: &str, _deadline: &Deadline) -> Result<String, LmError> {
            self.0.clone()
        }
    }

    fn run(reply: Result<String, LmError>) -> (PipelineState, Result<(), PipelineError>) {
        let mut state = PipelineState::new("Columns: region, units, price", Vec::new());
        let result = plan_sections(
            &mut state,
            &SectionId::ALL,
            &Reply(reply),
            4096,
            &Deadline::after(Duration::from_secs(30)),
        );
        (state, result)
    }

    #[test]
    fn uses_model_goals_in_configured_order() {
        let reply = "```json\n{\"kpi_goal\": \"Compare units by region\", \"stats_goal\": \"Price spread\", \"narrative_goal\": [\"Summarize\", \"Recommend\"]}\n```";
        let (state, result) = run(Ok(reply.to_string()));
        result.unwrap();
        let ids: Vec<_> = state.plan.ids().collect();
        assert_eq!(ids, SectionId::ALL.to_vec());
        assert_eq!(state.plan.sections[0].goal, "Price spread");
        assert_eq!(state.plan.sections[1].goal, "Compare units by region");
        assert_eq!(state.plan.sections[2].goal, "Summarize; Recommend");
        assert!(state.diagnostics.is_empty());
        assert_eq!(state.lm_calls.len(), 1);
    }

    #[test]
    fn missing_goal_falls_back_per_section() {
        let (state, result) = run(Ok(r#"{"stats_goal": "Price spread", "kpi_goal": ""}"#.to_string()));
        result.unwrap();
        assert_eq!(state.plan.sections[1].goal, default_goal(SectionId::Kpis));
        let fallbacks: Vec<_> = state
            .diagnostics
            .iter()
            .filter_map(|diag| diag.section)
            .collect();
        assert_eq!(fallbacks, vec![SectionId::Kpis, SectionId::Narrative]);
    }

    #[test]
    fn unparsable_reply_uses_default_plan() {
        let (state, result) = run(Ok("I think the KPIs are great".to_string()));
        result.unwrap();
        assert_eq!(state.plan, default_plan(&SectionId::ALL));
        assert_eq!(state.diagnostics.len(), 1);
        assert_eq!(state.diagnostics[0].kind, DiagnosticKind::PlanFallback);
    }

    #[test]
    fn unavailable_model_uses_default_plan() {
        let (state, result) = run(Err(LmError::Unavailable("connection refused".to_string())));
        result.unwrap();
        assert_eq!(state.plan, default_plan(&SectionId::ALL));
        assert!(state.diagnostics[0].message.contains("connection refused"));
    }

    #[test]
    fn cancelled_planner_is_timeout() {
        let (_state, result) = run(Err(LmError::Cancelled));
        assert!(matches!(result, Err(PipelineError::Timeout(Status::Planning))));
    }

    #[test]
    fn prompt_lists_sections_and_summary() {
        let prompt = build_plan_prompt("Columns: a, b", &[SectionId::Kpis]);
        assert!(prompt.contains("- `kpis`: Key Performance Indicators"));
        assert!(prompt.contains("Columns: a, b"));
        assert!(!prompt.contains("{sections}"));
    }
}
