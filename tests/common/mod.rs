//! Shared test infrastructure for pipeline integration tests.
#![allow(dead_code)]

use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream};
use report_press::config::{default_config, DocumentMeta, RunConfig};
use report_press::lm::{LanguageModel, LmError};
use report_press::process::Deadline;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

pub const TITLE: &str = "Q3 Sales Review";
pub const AUTHOR: &str = "Analytics Team";

pub const PLAN_REPLY: &str = r#"{"stats_goal": "Describe price spread", "kpi_goal": "Compare units by region", "narrative_goal": "Summarize for executives"}"#;
pub const STATS_REPLY: &str = "\\subsection*{STATS Analysis}\n\\textbf{Key Finding:} Prices cluster near the median.\n\\begin{itemize}\n  \\item \\textbf{Trend:} stable\n\\end{itemize}";
pub const KPIS_REPLY: &str = "\\subsection*{KPIS Analysis}\n\\textbf{Key Finding:} North leads on units sold.\n\\begin{itemize}\n  \\item \\textbf{Metrics:} 1,204 units\n\\end{itemize}";
pub const NARRATIVE_REPLY: &str = "\\subsection*{Overview}\nSales were steady.\n\\subsection*{Recommended Actions}\n\\begin{enumerate}\n  \\item Expand North.\n\\end{enumerate}";
/// Two environments left open; the validator's single repair cannot fix it.
pub const TWO_UNCLOSED: &str = "\\begin{itemize}\n\\item Revenue\n\\begin{itemize}\n\\item growth";

/// Which caller a prompt came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Plan,
    Stats,
    Kpis,
    Narrative,
}

pub fn role_of(prompt: &str) -> Role {
    if prompt.contains("Strategic Report Planner") {
        Role::Plan
    } else if prompt.contains("Recommended Actions") {
        Role::Narrative
    } else if prompt.contains("STATS Analysis") {
        Role::Stats
    } else {
        Role::Kpis
    }
}

/// Scripted model: queued replies per role, then a fixed good reply.
#[derive(Default)]
pub struct FakeModel {
    queued: Mutex<HashMap<Role, VecDeque<Result<String, LmError>>>>,
    calls: Mutex<Vec<(Role, String)>>,
}

impl FakeModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(self, role: Role, replies: &[Result<&str, LmError>]) -> Self {
        self.queued
            .lock()
            .unwrap()
            .entry(role)
            .or_default()
            .extend(replies.iter().map(|reply| reply.clone().map(str::to_string)));
        self
    }

    pub fn calls(&self, role: Role) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(called, _)| *called == role)
            .map(|(_, prompt)| prompt.clone())
            .collect()
    }

    fn fallback(role: Role) -> &'static str {
        match role {
            Role::Plan => PLAN_REPLY,
            Role::Stats => STATS_REPLY,
            Role::Kpis => KPIS_REPLY,
            Role::Narrative => NARRATIVE_REPLY,
        }
    }
}

impl LanguageModel for FakeModel {
    fn describe(&self) -> String {
        "fake".to_string()
    }

    fn invoke(&self, prompt: &str, _deadline: &Deadline) -> Result<String, LmError> {
        let role = role_of(prompt);
        self.calls.lock().unwrap().push((role, prompt.to_string()));
        let queued = self
            .queued
            .lock()
            .unwrap()
            .get_mut(&role)
            .and_then(VecDeque::pop_front);
        queued.unwrap_or_else(|| Ok(Self::fallback(role).to_string()))
    }
}

/// Hangs until the deadline, like a model that never answers.
pub struct StalledModel;

impl LanguageModel for StalledModel {
    fn describe(&self) -> String {
        "stalled".to_string()
    }

    fn invoke(&self, _prompt: &str, deadline: &Deadline) -> Result<String, LmError> {
        while !deadline.expired() {
            thread::sleep(Duration::from_millis(10));
        }
        Err(LmError::Cancelled)
    }
}

/// Answers the planner, then hangs on every section prompt until the
/// deadline.
#[derive(Default)]
pub struct StalledSectionsModel {
    stalled: Mutex<Vec<Role>>,
}

impl StalledSectionsModel {
    pub fn stalled(&self) -> Vec<Role> {
        self.stalled.lock().unwrap().clone()
    }
}

impl LanguageModel for StalledSectionsModel {
    fn describe(&self) -> String {
        "stalled-sections".to_string()
    }

    fn invoke(&self, prompt: &str, deadline: &Deadline) -> Result<String, LmError> {
        let role = role_of(prompt);
        if role == Role::Plan {
            return Ok(PLAN_REPLY.to_string());
        }
        self.stalled.lock().unwrap().push(role);
        while !deadline.expired() {
            thread::sleep(Duration::from_millis(10));
        }
        Err(LmError::Cancelled)
    }
}

/// Scratch layout for one run: fixture PDF, work dir and publish path.
pub struct Workspace {
    pub temp: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        Self {
            temp: tempfile::tempdir().expect("create temp dir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    pub fn work_dir(&self) -> PathBuf {
        self.path().join("work")
    }

    pub fn output_path(&self) -> PathBuf {
        self.path().join("out").join("report.pdf")
    }

    /// Write a fixture PDF whose pages carry the given lines.
    pub fn fixture(&self, pages: &[&[&str]]) -> PathBuf {
        let path = self.path().join("fixture.pdf");
        std::fs::write(&path, build_pdf(pages)).expect("write fixture pdf");
        path
    }

    pub fn chart(&self, name: &str) -> PathBuf {
        let path = self.path().join(name);
        std::fs::write(&path, b"\x89PNG\r\n").expect("write chart");
        path
    }

    /// Config whose compiler is a shell script run in the work dir with the
    /// source path as `$1`.
    pub fn config(&self, compiler_script: &str) -> RunConfig {
        let mut config = default_config();
        config.work_dir = Some(self.work_dir());
        config.output_path = self.output_path();
        config.timeout_secs = 30;
        config.retry_backoff_ms = 0;
        config.document = DocumentMeta {
            title: TITLE.to_string(),
            author: AUTHOR.to_string(),
            date: String::new(),
        };
        config.compiler.command = format!("sh -c '{compiler_script}' sh {{source}}");
        config
    }

    /// Compiler that copies `fixture` into place on every pass.
    pub fn copying_config(&self, fixture: &Path) -> RunConfig {
        self.config(&format!("cp {} {{jobname}}.pdf", fixture.display()))
    }
}

/// Standard compiled output: standalone title page, then content pages that
/// repeat the title in a running header.
pub fn title_page_fixture() -> Vec<Vec<&'static str>> {
    vec![
        vec![TITLE, AUTHOR],
        vec![TITLE, "Statistical Insights", "Prices cluster near the median."],
        vec![TITLE, "Key Performance Indicators", "North leads on units sold."],
        vec![TITLE, "Executive Summary", "Sales were steady.", "2"],
    ]
}

pub fn as_pages<'a>(pages: &'a [Vec<&'a str>]) -> Vec<&'a [&'a str]> {
    pages.iter().map(Vec::as_slice).collect()
}

pub fn page_count(path: &Path) -> usize {
    Document::load(path).expect("load pdf").get_pages().len()
}

pub fn build_pdf(pages: &[&[&str]]) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
        "Encoding" => "WinAnsiEncoding",
    });
    let mut kids: Vec<Object> = Vec::new();
    for lines in pages {
        let mut operations = Vec::new();
        for (idx, line) in lines.iter().enumerate() {
            operations.push(Operation::new("BT", vec![]));
            operations.push(Operation::new("Tf", vec!["F1".into(), 12.into()]));
            operations.push(Operation::new(
                "Td",
                vec![72.into(), (720 - 20 * idx as i64).into()],
            ));
            operations.push(Operation::new("Tj", vec![Object::string_literal(*line)]));
            operations.push(Operation::new("ET", vec![]));
        }
        let content = Content { operations };
        let content_id = doc.add_object(Stream::new(
            dictionary! {},
            content.encode().expect("encode content"),
        ));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "Resources" => dictionary! { "Font" => dictionary! { "F1" => font_id } },
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        });
        kids.push(page_id.into());
    }
    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).expect("serialize pdf");
    bytes
}
