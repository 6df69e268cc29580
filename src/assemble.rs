//! Document assembly.
//!
//! One instantiation of the fixed report template per run: the title block,
//! then every planned section in plan order, each followed by the figures
//! rendered for that section.
use crate::config::DocumentMeta;
use crate::error::PipelineError;
use crate::markup::{sanitize, ValidFragment};
use crate::state::{ChartRef, Plan, SectionId};
use crate::templates::{REPORT_TEX, SECTION_TEX};
use indexmap::IndexMap;
use std::fs;
use std::path::PathBuf;
use thiserror::Error;

const SLOT_TITLE: &str = "%%SLOT:title%%";
const SLOT_AUTHOR: &str = "%%SLOT:author%%";
const SLOT_DATE: &str = "%%SLOT:date%%";
const SLOT_SECTIONS: &str = "%%SLOT:sections%%";
const SLOT_SECTION_TITLE: &str = "%%SLOT:section_title%%";
const SLOT_SECTION_BODY: &str = "%%SLOT:section_body%%";
const SLOT_SECTION_FIGURES: &str = "%%SLOT:section_figures%%";
const SLOT_PREFIX: &str = "%%SLOT:";

/// Characters that cannot appear in an `\includegraphics` path argument.
const UNSAFE_PATH_CHARS: &[char] = &[' ', '%', '#', '{', '}', '\\', '~', '$', '&', '^'];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssemblyError {
    #[error("planned section {0} has no valid fragment")]
    MissingFragment(SectionId),

    #[error("template slot {0} was not substituted")]
    UnresolvedSlot(String),
}

impl From<AssemblyError> for PipelineError {
    fn from(err: AssemblyError) -> Self {
        match err {
            AssemblyError::MissingFragment(section) => {
                PipelineError::AssemblyMissingFragment(section)
            }
            AssemblyError::UnresolvedSlot(_) => PipelineError::Template(err.to_string()),
        }
    }
}

/// A chart that was left out of the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedChart {
    pub chart: ChartRef,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct Document {
    pub source: String,
    /// Absolute paths of the figures placed, in document order.
    pub figures: Vec<PathBuf>,
    pub skipped_charts: Vec<SkippedChart>,
}

/// Fill the report template. Fails before rendering anything if a planned
/// section has no fragment.
pub fn assemble(
    plan: &Plan,
    fragments: &IndexMap<SectionId, ValidFragment>,
    charts: &[ChartRef],
    meta: &DocumentMeta,
) -> Result<Document, AssemblyError> {
    if let Some(missing) = plan.ids().find(|id| !fragments.contains_key(id)) {
        return Err(AssemblyError::MissingFragment(missing));
    }

    let (placed, skipped_charts) = place_charts(plan, charts);

    let mut figures = Vec::new();
    let mut sections = Vec::new();
    for planned in &plan.sections {
        let fragment = fragments
            .get(&planned.id)
            .ok_or(AssemblyError::MissingFragment(planned.id))?;
        let section_figures: Vec<&PathBuf> = placed
            .iter()
            .filter(|(section, _)| *section == planned.id)
            .map(|(_, path)| path)
            .collect();
        let figure_block = section_figures
            .iter()
            .map(|path| figure_markup(path))
            .collect::<Vec<_>>()
            .join("\n");
        figures.extend(section_figures.into_iter().cloned());

        // Body goes in last so fragment text is never scanned for slots.
        let rendered = SECTION_TEX
            .replace(SLOT_SECTION_TITLE, &sanitize(&planned.title).text)
            .replace(SLOT_SECTION_FIGURES, &figure_block)
            .replace(SLOT_SECTION_BODY, fragment.text());
        sections.push(rendered);
    }

    let source = REPORT_TEX
        .replace(SLOT_TITLE, &sanitize(&meta.title).text)
        .replace(SLOT_AUTHOR, &sanitize(&meta.author).text)
        .replace(SLOT_DATE, &sanitize(&meta.date).text)
        .replace(SLOT_SECTIONS, sections.join("\n").trim_end());

    if let Some(slot) = unresolved_slot(&source) {
        return Err(AssemblyError::UnresolvedSlot(slot));
    }

    Ok(Document {
        source,
        figures,
        skipped_charts,
    })
}

/// Split charts into placeable `(section, absolute path)` pairs and skips.
fn place_charts(plan: &Plan, charts: &[ChartRef]) -> (Vec<(SectionId, PathBuf)>, Vec<SkippedChart>) {
    let mut placed = Vec::new();
    let mut skipped = Vec::new();
    for chart in charts {
        let skip = |reason: String| SkippedChart {
            chart: chart.clone(),
            reason,
        };
        if plan.get(chart.section).is_none() {
            skipped.push(skip(format!("section {} is not planned", chart.section)));
            continue;
        }
        let absolute = match fs::canonicalize(&chart.path) {
            Ok(path) if path.is_file() => path,
            Ok(_) => {
                skipped.push(skip("not a regular file".to_string()));
                continue;
            }
            Err(err) => {
                skipped.push(skip(format!("cannot read chart: {err}")));
                continue;
            }
        };
        let text = absolute.to_string_lossy();
        if text.contains(UNSAFE_PATH_CHARS) {
            skipped.push(skip(
                "path contains characters LaTeX cannot include".to_string(),
            ));
            continue;
        }
        placed.push((chart.section, absolute));
    }
    (placed, skipped)
}

fn figure_markup(path: &std::path::Path) -> String {
    format!(
        "\\begin{{figure}}[h!]\\centering\\includegraphics[width=0.8\\textwidth]{{{}}}\\end{{figure}}",
        path.display()
    )
}

fn unresolved_slot(source: &str) -> Option<String> {
    let start = source.find(SLOT_PREFIX)?;
    let rest = &source[start + SLOT_PREFIX.len()..];
    let name = rest.split("%%").next().unwrap_or(rest);
    Some(format!("{SLOT_PREFIX}{name}%%"))
}
