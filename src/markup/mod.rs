//! LaTeX safety layer for generated text.
//!
//! Generated prose goes through [`sanitize`] and then [`validate`]; only the
//! latter can mint a [`ValidFragment`], which is the sole input type the
//! assembler accepts.
use crate::state::SectionId;
use serde::Serialize;

mod sanitize;
mod validate;

pub use sanitize::{sanitize, DropReason, SanitizeDiagnostic, SanitizedText};
pub use validate::{validate, ValidationError, ValidationErrorKind};

/// Sanitized but not yet validated markup for one section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkupFragment {
    pub section: SectionId,
    pub text: String,
}

impl MarkupFragment {
    pub fn new(section: SectionId, text: impl Into<String>) -> Self {
        Self {
            section,
            text: text.into(),
        }
    }
}

/// Markup that passed structure validation, possibly after one repair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidFragment {
    section: SectionId,
    text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    repair: Option<String>,
}

impl ValidFragment {
    pub fn section(&self) -> SectionId {
        self.section
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Description of the repair applied, if any.
    pub fn repair(&self) -> Option<&str> {
        self.repair.as_deref()
    }
}
