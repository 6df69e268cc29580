//! Structure checks for sanitized fragments.
//!
//! A fragment is valid when every environment and brace group it opens is
//! closed in order, sectioning commands carry a one-line title, and it uses
//! none of the commands that reach outside the document. One repair is
//! attempted: closing the innermost unterminated construct.
use super::{MarkupFragment, ValidFragment};
use std::fmt;
use thiserror::Error;

/// File access, shell escape, macro rewiring, and anything the document
/// template owns.
const BANNED_COMMANDS: &[&str] = &[
    "input",
    "include",
    "includeonly",
    "InputIfFileExists",
    "IfFileExists",
    "openin",
    "openout",
    "read",
    "readline",
    "write",
    "immediate",
    "newwrite",
    "newread",
    "ShellEscape",
    "directlua",
    "catcode",
    "csname",
    "def",
    "gdef",
    "edef",
    "xdef",
    "let",
    "special",
    "usepackage",
    "RequirePackage",
    "documentclass",
    "maketitle",
    "includegraphics",
];

const BANNED_ENVIRONMENTS: &[&str] = &["document", "filecontents", "filecontents*"];

const HEADER_COMMANDS: &[&str] = &[
    "section",
    "subsection",
    "subsubsection",
    "paragraph",
    "subparagraph",
];

/// Sectioning levels the article-style template does not define.
const UNSUPPORTED_HEADERS: &[&str] = &["part", "chapter"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationErrorKind {
    Malformed,
    BannedCommand,
    Empty,
}

impl fmt::Display for ValidationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed => write!(f, "malformed"),
            Self::BannedCommand => write!(f, "banned command"),
            Self::Empty => write!(f, "empty"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {detail}")]
pub struct ValidationError {
    pub kind: ValidationErrorKind,
    pub detail: String,
    /// Repair that was tried before the fragment was rejected.
    pub repair: Option<String>,
}

/// Check a fragment and, if only unterminated constructs are wrong, try one
/// repair pass.
pub fn validate(fragment: &MarkupFragment) -> Result<ValidFragment, ValidationError> {
    if fragment.text.trim().is_empty() {
        return Err(ValidationError {
            kind: ValidationErrorKind::Empty,
            detail: "fragment has no content".to_string(),
            repair: None,
        });
    }

    let first = scan(&fragment.text);
    if let Some(err) = first.rejection(None) {
        return Err(err);
    }
    let Some(innermost) = first.open.last() else {
        return Ok(ValidFragment {
            section: fragment.section,
            text: fragment.text.clone(),
            repair: None,
        });
    };

    let mut repaired = fragment.text.clone();
    let repair = match innermost {
        Construct::Environment(name) => {
            if !repaired.ends_with('\n') {
                repaired.push('\n');
            }
            repaired.push_str(&format!("\\end{{{name}}}"));
            format!("appended \\end{{{name}}}")
        }
        Construct::Group => {
            repaired.push('}');
            "appended }".to_string()
        }
    };

    let second = scan(&repaired);
    if let Some(err) = second.rejection(Some(&repair)) {
        return Err(err);
    }
    if !second.open.is_empty() {
        return Err(ValidationError {
            kind: ValidationErrorKind::Malformed,
            detail: format!(
                "{} unterminated construct(s) remain after repair: {}",
                second.open.len(),
                describe_open(&second.open)
            ),
            repair: Some(repair),
        });
    }

    Ok(ValidFragment {
        section: fragment.section,
        text: repaired,
        repair: Some(repair),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Construct {
    Environment(String),
    Group,
}

#[derive(Debug)]
enum Defect {
    Banned(String),
    Malformed(String),
}

struct Scan {
    defects: Vec<Defect>,
    open: Vec<Construct>,
}

impl Scan {
    /// Defects other than unterminated constructs; banned commands first.
    fn rejection(&self, repair: Option<&str>) -> Option<ValidationError> {
        let banned = self.defects.iter().find_map(|defect| match defect {
            Defect::Banned(detail) => Some(detail),
            Defect::Malformed(_) => None,
        });
        if let Some(detail) = banned {
            return Some(ValidationError {
                kind: ValidationErrorKind::BannedCommand,
                detail: detail.clone(),
                repair: repair.map(str::to_string),
            });
        }
        self.defects.iter().find_map(|defect| match defect {
            Defect::Malformed(detail) => Some(ValidationError {
                kind: ValidationErrorKind::Malformed,
                detail: detail.clone(),
                repair: repair.map(str::to_string),
            }),
            Defect::Banned(_) => None,
        })
    }
}

fn describe_open(open: &[Construct]) -> String {
    open.iter()
        .map(|construct| match construct {
            Construct::Environment(name) => format!("\\begin{{{name}}}"),
            Construct::Group => "{".to_string(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone, Copy)]
enum Token<'a> {
    Command {
        name: &'a str,
        start: usize,
        end: usize,
    },
    Open(usize),
    Close(usize),
}

/// Split text into control words and unescaped braces, skipping comments.
fn lex(text: &str) -> Vec<Token<'_>> {
    let bytes = text.as_bytes();
    let mut tokens = Vec::new();
    let mut idx = 0;
    while idx < bytes.len() {
        match bytes[idx] {
            b'\\' => {
                let name_start = idx + 1;
                let mut end = name_start;
                while end < bytes.len() && bytes[end].is_ascii_alphabetic() {
                    end += 1;
                }
                if end == name_start {
                    idx += 2;
                    continue;
                }
                let name = &text[name_start..end];
                if bytes.get(end) == Some(&b'*') {
                    end += 1;
                }
                tokens.push(Token::Command {
                    name,
                    start: idx,
                    end,
                });
                idx = end;
            }
            b'{' => {
                tokens.push(Token::Open(idx));
                idx += 1;
            }
            b'}' => {
                tokens.push(Token::Close(idx));
                idx += 1;
            }
            b'%' => {
                while idx < bytes.len() && bytes[idx] != b'\n' {
                    idx += 1;
                }
            }
            _ => idx += 1,
        }
    }
    tokens
}

fn scan(text: &str) -> Scan {
    let mut open = Vec::new();
    let mut defects = Vec::new();
    // Braces belonging to an environment name were consumed with the command.
    let mut consumed_until = 0;

    for token in lex(text) {
        match token {
            Token::Open(pos) | Token::Close(pos) if pos < consumed_until => {}
            Token::Open(_) => open.push(Construct::Group),
            Token::Close(pos) => match open.last() {
                Some(Construct::Group) => {
                    open.pop();
                }
                Some(Construct::Environment(name)) => defects.push(Defect::Malformed(format!(
                    "'}}' at byte {pos} has no matching '{{' inside \\begin{{{name}}}"
                ))),
                None => defects.push(Defect::Malformed(format!(
                    "'}}' at byte {pos} has no matching '{{'"
                ))),
            },
            Token::Command { start, .. } if start < consumed_until => {}
            Token::Command { name, start, end } => {
                if BANNED_COMMANDS.contains(&name) {
                    defects.push(Defect::Banned(format!(
                        "\\{name} is not allowed in generated content (byte {start})"
                    )));
                    continue;
                }
                if UNSUPPORTED_HEADERS.contains(&name) {
                    defects.push(Defect::Malformed(format!(
                        "\\{name} is not available in the report template"
                    )));
                    continue;
                }
                if name == "begin" || name == "end" {
                    let Some((env, after)) = environment_name(text, end) else {
                        defects.push(Defect::Malformed(format!(
                            "\\{name} at byte {start} has no environment name"
                        )));
                        continue;
                    };
                    consumed_until = after;
                    if name == "begin" {
                        if BANNED_ENVIRONMENTS.contains(&env) {
                            defects.push(Defect::Banned(format!(
                                "environment {env} is not allowed in generated content"
                            )));
                        }
                        open.push(Construct::Environment(env.to_string()));
                    } else {
                        close_environment(env, &mut open, &mut defects);
                    }
                } else if HEADER_COMMANDS.contains(&name) {
                    if let Err(detail) = check_header(text, name, end) {
                        defects.push(Defect::Malformed(detail));
                    }
                }
            }
        }
    }

    Scan { defects, open }
}

fn close_environment(env: &str, open: &mut Vec<Construct>, defects: &mut Vec<Defect>) {
    match open.last() {
        Some(Construct::Environment(top)) if top == env => {
            open.pop();
        }
        Some(Construct::Environment(top)) => defects.push(Defect::Malformed(format!(
            "\\end{{{env}}} does not match open \\begin{{{top}}}"
        ))),
        Some(Construct::Group) => defects.push(Defect::Malformed(format!(
            "\\end{{{env}}} closes an environment while a brace group is open"
        ))),
        None => defects.push(Defect::Malformed(format!(
            "\\end{{{env}}} has no matching \\begin"
        ))),
    }
}

/// Parse `{name}` directly after `\begin`/`\end`; returns the name and the
/// byte index after the closing brace.
fn environment_name(text: &str, after_command: usize) -> Option<(&str, usize)> {
    let rest = text.get(after_command..)?;
    let inner = rest.strip_prefix('{')?;
    let close = inner.find('}')?;
    let name = &inner[..close];
    let well_formed = !name.is_empty()
        && name
            .bytes()
            .all(|byte| byte.is_ascii_alphanumeric() || byte == b'*');
    if !well_formed {
        return None;
    }
    Some((name, after_command + 1 + close + 1))
}

fn check_header(text: &str, name: &str, after_command: usize) -> Result<(), String> {
    let bytes = text.as_bytes();
    let mut idx = after_command;
    if bytes.get(idx) == Some(&b'[') {
        match text[idx..].find(']') {
            Some(close) if !text[idx..idx + close].contains('\n') => idx += close + 1,
            _ => return Err(format!("\\{name} has an unterminated short title")),
        }
    }
    if bytes.get(idx) != Some(&b'{') {
        return Err(format!("\\{name} must be followed by {{title}}"));
    }
    let title_start = idx + 1;
    let mut depth = 0usize;
    while idx < bytes.len() {
        match bytes[idx] {
            b'\\' => {
                idx += 2;
                continue;
            }
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    let title = text[title_start..idx].trim();
                    if title.is_empty() {
                        return Err(format!("\\{name} has an empty title"));
                    }
                    return Ok(());
                }
            }
            b'\n' => return Err(format!("\\{name} title spans multiple lines")),
            _ => {}
        }
        idx += 1;
    }
    Err(format!("\\{name} title is not terminated"))
}
