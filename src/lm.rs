//! Language model backends.
//!
//! The pipeline only needs "prompt in, text out". Two backends are provided:
//! an arbitrary command that reads the prompt on stdin (`ollama run`, `llm`,
//! wrapper scripts) and the Ollama HTTP API. Both honour the run deadline.
use crate::config::LmConfig;
use crate::process::{run_captured, Deadline, ProcessError};
use crate::util::preview;
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::json;
use std::process::Command;
use std::time::Instant;
use thiserror::Error;

const STDERR_PREVIEW_BYTES: usize = 400;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LmError {
    /// Transient: network, model load, crashed helper. Retried by callers.
    #[error("language model unavailable: {0}")]
    Unavailable(String),

    #[error("language model call cancelled at run deadline")]
    Cancelled,
}

pub trait LanguageModel: Send + Sync {
    /// Short label for logs.
    fn describe(&self) -> String;

    fn invoke(&self, prompt: &str, deadline: &Deadline) -> Result<String, LmError>;
}

/// Build the backend named by the run config.
pub fn from_config(config: &LmConfig) -> Result<Box<dyn LanguageModel>> {
    match config {
        LmConfig::Command { command } => Ok(Box::new(CommandModel::from_command_line(command)?)),
        LmConfig::Ollama {
            endpoint,
            model,
            temperature,
        } => Ok(Box::new(OllamaModel::new(endpoint, model, *temperature))),
    }
}

/// Runs a local command with the prompt on stdin and reads the reply from
/// stdout.
#[derive(Debug, Clone)]
pub struct CommandModel {
    argv: Vec<String>,
}

impl CommandModel {
    pub fn from_command_line(command: &str) -> Result<Self> {
        let argv =
            shell_words::split(command).with_context(|| format!("parse LM command: {command}"))?;
        if argv.is_empty() {
            return Err(anyhow!("LM command is empty"));
        }
        Ok(Self { argv })
    }
}

impl LanguageModel for CommandModel {
    fn describe(&self) -> String {
        self.argv.join(" ")
    }

    fn invoke(&self, prompt: &str, deadline: &Deadline) -> Result<String, LmError> {
        let mut command = Command::new(&self.argv[0]);
        command.args(&self.argv[1..]);

        let output = match run_captured(command, Some(prompt.as_bytes()), deadline) {
            Ok(output) => output,
            Err(ProcessError::DeadlineExpired { .. }) => return Err(LmError::Cancelled),
            Err(err) => return Err(LmError::Unavailable(err.to_string())),
        };

        tracing::info!(
            elapsed_ms = output.duration_ms,
            prompt_bytes = prompt.len(),
            response_bytes = output.stdout.len(),
            "lm invoke complete"
        );

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(LmError::Unavailable(format!(
                "LM command failed with status {}: {}",
                output.status,
                preview(&stderr, STDERR_PREVIEW_BYTES)
            )));
        }
        let text = String::from_utf8_lossy(&output.stdout).into_owned();
        if text.trim().is_empty() {
            return Err(LmError::Unavailable(
                "LM command returned an empty response".to_string(),
            ));
        }
        Ok(text)
    }
}

/// Ollama `/api/generate` client.
#[derive(Debug, Clone)]
pub struct OllamaModel {
    url: String,
    model: String,
    temperature: f64,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

impl OllamaModel {
    pub fn new(endpoint: &str, model: &str, temperature: f64) -> Self {
        Self {
            url: format!("{}/api/generate", endpoint.trim_end_matches('/')),
            model: model.to_string(),
            temperature,
        }
    }
}

impl LanguageModel for OllamaModel {
    fn describe(&self) -> String {
        format!("ollama {} at {}", self.model, self.url)
    }

    fn invoke(&self, prompt: &str, deadline: &Deadline) -> Result<String, LmError> {
        if deadline.expired() {
            return Err(LmError::Cancelled);
        }
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(deadline.remaining()))
            .build()
            .into();
        let payload = json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "options": { "temperature": self.temperature },
        });

        let start = Instant::now();
        let mut response = agent
            .post(&self.url)
            .send_json(&payload)
            .map_err(|err| classify_http_error(err, deadline))?;
        let body: GenerateResponse = response
            .body_mut()
            .read_json()
            .map_err(|err| classify_http_error(err, deadline))?;

        tracing::info!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            prompt_bytes = prompt.len(),
            response_bytes = body.response.len(),
            model = %self.model,
            "lm invoke complete"
        );

        if body.response.trim().is_empty() {
            return Err(LmError::Unavailable(
                "Ollama returned an empty response".to_string(),
            ));
        }
        Ok(body.response)
    }
}

fn classify_http_error(err: ureq::Error, deadline: &Deadline) -> LmError {
    if deadline.expired() {
        return LmError::Cancelled;
    }
    LmError::Unavailable(format!("ollama request failed: {err}"))
}

/// Extract JSON from text that might have markdown code fences.
pub fn extract_json(text: &str) -> &str {
    let text = text.trim();

    if let Some(start) = text.find("```json") {
        let start = start + 7;
        if let Some(end) = text[start..].find("```") {
            return text[start..start + end].trim();
        }
    }

    if let Some(fenced) = fenced_body(text) {
        return fenced;
    }

    // Fall back to the outermost object.
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => text,
    }
}

/// Remove a surrounding markdown fence (with any language tag) from a reply.
pub fn strip_code_fences(text: &str) -> &str {
    fenced_body(text.trim()).unwrap_or_else(|| text.trim())
}

fn fenced_body(text: &str) -> Option<&str> {
    let start = text.find("```")? + 3;
    // Skip language identifier if present
    let start = text[start..]
        .find('\n')
        .map(|i| start + i + 1)
        .unwrap_or(start);
    let end = text[start..].find("```")?;
    Some(text[start..start + end].trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn deadline() -> Deadline {
        Deadline::after(Duration::from_secs(30))
    }

    #[test]
    fn extract_json_plain() {
        let text = r#"{"kpi_goal": "x"}"#;
        assert_eq!(extract_json(text), text);
    }

    #[test]
    fn extract_json_with_fences_and_chatter() {
        let text = "Here is the plan:\n```json\n{\"kpi_goal\": \"x\"}\n```\n";
        assert_eq!(extract_json(text), r#"{"kpi_goal": "x"}"#);
        let text = "Sure! {\"stats_goal\": \"y\"} Hope this helps.";
        assert_eq!(extract_json(text), r#"{"stats_goal": "y"}"#);
    }

    #[test]
    fn strip_code_fences_handles_language_tags() {
        let text = "```latex\n\\subsection*{KPIs}\nbody\n```";
        assert_eq!(strip_code_fences(text), "\\subsection*{KPIs}\nbody");
        assert_eq!(strip_code_fences("  plain text \n"), "plain text");
    }

    #[test]
    fn command_model_round_trips_stdin() {
        let model = CommandModel::from_command_line("sh -c 'printf \"reply: \"; cat'").unwrap();
        let reply = model.invoke("hello", &deadline()).unwrap();
        assert_eq!(reply, "reply: hello");
    }

    #[test]
    fn command_failure_is_unavailable() {
        let model = CommandModel::from_command_line("sh -c 'echo model not loaded >&2; exit 3'")
            .unwrap();
        match model.invoke("hello", &deadline()) {
            Err(LmError::Unavailable(detail)) => assert!(detail.contains("model not loaded")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn empty_reply_is_unavailable() {
        let model = CommandModel::from_command_line("true").unwrap();
        assert!(matches!(
            model.invoke("hello", &deadline()),
            Err(LmError::Unavailable(_))
        ));
    }

    #[test]
    fn deadline_cancels_command() {
        let model = CommandModel::from_command_line("sh -c 'exec sleep 30'").unwrap();
        let deadline = Deadline::after(Duration::from_millis(150));
        assert_eq!(model.invoke("hello", &deadline), Err(LmError::Cancelled));
    }

    #[test]
    fn reply_held_open_by_background_job_is_cancelled() {
        let model = CommandModel::from_command_line("sh -c 'echo reply; (sleep 4) &'").unwrap();
        let deadline = Deadline::after(Duration::from_millis(300));
        let start = std::time::Instant::now();
        assert_eq!(model.invoke("hello", &deadline), Err(LmError::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(CommandModel::from_command_line("   ").is_err());
        assert!(CommandModel::from_command_line("'unterminated").is_err());
    }

    #[test]
    fn ollama_url_is_normalized() {
        let model = OllamaModel::new("http://localhost:11434/", "gemma3", 0.1);
        assert_eq!(model.url, "http://localhost:11434/api/generate");
    }
}
