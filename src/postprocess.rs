//! Artifact postprocessing.
//!
//! Drops leading pages that carry nothing but title-block boilerplate and
//! publishes the result at the output path with a temp-file rename.
use crate::config::DocumentMeta;
use crate::error::PipelineError;
use crate::util::{display_path, sha256_hex};
use lopdf::Document as PdfDocument;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Title-block strings a duplicate title page is recognised by.
#[derive(Debug, Clone, Default)]
pub struct TitleHeuristic {
    title: String,
    needles: Vec<String>,
}

impl TitleHeuristic {
    pub fn new(title: &str, author: &str, date: &str) -> Self {
        let mut needles: Vec<String> = [title, author, date]
            .into_iter()
            .map(normalize)
            .filter(|text| !text.is_empty())
            .collect();
        // Longest first so a short needle never splits a longer one.
        needles.sort_by_key(|needle| std::cmp::Reverse(needle.len()));
        Self {
            title: normalize(title),
            needles,
        }
    }

    pub fn from_meta(meta: &DocumentMeta) -> Self {
        Self::new(&meta.title, &meta.author, &meta.date)
    }

    fn is_boilerplate(&self, page: &str) -> bool {
        let mut rest = page.to_string();
        for needle in &self.needles {
            rest = rest.replace(needle.as_str(), "");
        }
        rest.chars().all(|ch| ch.is_ascii_digit())
    }

    /// Number of leading pages to drop. `None` marks a page whose text could
    /// not be read; it is never removed.
    pub fn removable_leading_pages(&self, pages: &[Option<String>]) -> usize {
        let normalized: Vec<Option<String>> = pages
            .iter()
            .map(|page| page.as_deref().map(normalize))
            .collect();
        let mut removable = 0;
        for (idx, page) in normalized.iter().enumerate() {
            if removable + 1 >= normalized.len() {
                break;
            }
            let Some(page) = page else {
                break;
            };
            if !self.is_boilerplate(page) {
                break;
            }
            let title_later = !self.title.is_empty()
                && normalized[idx + 1..]
                    .iter()
                    .flatten()
                    .any(|later| later.contains(self.title.as_str()));
            if !page.is_empty() && !title_later {
                break;
            }
            removable += 1;
        }
        removable
    }
}

/// Lowercase alphanumerics only.
fn normalize(text: &str) -> String {
    text.chars()
        .filter(|ch| ch.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

#[derive(Debug, Clone)]
pub struct CompiledArtifact {
    pub path: PathBuf,
    bytes: Vec<u8>,
    pub page_count: usize,
    /// 1-based page numbers selected for removal.
    pub removable_leading_pages: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalArtifact {
    pub path: PathBuf,
    pub page_count: usize,
    pub removed_pages: Vec<u32>,
    pub sha256: String,
}

fn io_error(action: &str, path: &Path, err: impl std::fmt::Display) -> PipelineError {
    PipelineError::PostprocessIo(format!("{action} {}: {err}", display_path(path, None)))
}

pub fn inspect(path: &Path, heuristic: &TitleHeuristic) -> Result<CompiledArtifact, PipelineError> {
    let bytes = fs::read(path).map_err(|err| io_error("read", path, err))?;
    let document = PdfDocument::load_mem(&bytes).map_err(|err| io_error("parse", path, err))?;
    let page_numbers: Vec<u32> = document.get_pages().keys().copied().collect();
    let texts: Vec<Option<String>> = page_numbers
        .iter()
        .map(|&number| match document.extract_text(&[number]) {
            Ok(text) => Some(text),
            Err(err) => {
                tracing::warn!(page = number, error = %err, "page text unreadable; keeping page");
                None
            }
        })
        .collect();
    let removable = heuristic.removable_leading_pages(&texts);
    tracing::info!(
        path = %display_path(path, None),
        pages = page_numbers.len(),
        removable,
        "artifact inspected"
    );
    Ok(CompiledArtifact {
        path: path.to_path_buf(),
        bytes,
        page_count: page_numbers.len(),
        removable_leading_pages: page_numbers[..removable].to_vec(),
    })
}

/// Remove the selected pages and publish at `output_path`. With nothing to
/// remove the compiled bytes are published unchanged.
pub fn trim(artifact: &CompiledArtifact, output_path: &Path) -> Result<FinalArtifact, PipelineError> {
    let bytes = if artifact.removable_leading_pages.is_empty() {
        artifact.bytes.clone()
    } else {
        let mut document = PdfDocument::load_mem(&artifact.bytes)
            .map_err(|err| io_error("parse", &artifact.path, err))?;
        document.delete_pages(&artifact.removable_leading_pages);
        document.prune_objects();
        let mut out = Vec::with_capacity(artifact.bytes.len());
        document
            .save_to(&mut out)
            .map_err(|err| io_error("serialize", &artifact.path, err))?;
        out
    };

    publish(output_path, &bytes)?;
    let removed_pages = artifact.removable_leading_pages.clone();
    tracing::info!(
        path = %display_path(output_path, None),
        removed = removed_pages.len(),
        bytes = bytes.len(),
        "artifact published"
    );
    Ok(FinalArtifact {
        path: output_path.to_path_buf(),
        page_count: artifact.page_count - removed_pages.len(),
        removed_pages,
        sha256: sha256_hex(&bytes),
    })
}

/// Write to a temp file beside `path`, fsync, then rename over it.
fn publish(path: &Path, bytes: &[u8]) -> Result<(), PipelineError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).map_err(|err| io_error("create", &parent, err))?;
    let mut temp =
        tempfile::NamedTempFile::new_in(&parent).map_err(|err| io_error("create temp in", &parent, err))?;
    temp.write_all(bytes)
        .map_err(|err| io_error("write", temp.path(), err))?;
    temp.as_file()
        .sync_all()
        .map_err(|err| io_error("sync", temp.path(), err))?;
    temp.persist(path)
        .map_err(|err| io_error("rename onto", path, err.error))?;
    Ok(())
}
