//! Escaping of LaTeX-reserved characters in generated text.
//!
//! The scanner walks the text once. Control words and control symbols pass
//! through untouched, so already-escaped input is left alone and the function
//! is idempotent. Arguments of name/path-taking commands are copied verbatim;
//! everything else is treated as prose.
use serde::Serialize;

/// Commands whose leading brace arguments are names or paths, with the number
/// of brace groups to copy verbatim.
const RAW_ARGUMENT_COMMANDS: &[(&str, usize)] = &[
    ("begin", 1),
    ("end", 1),
    ("label", 1),
    ("ref", 1),
    ("pageref", 1),
    ("eqref", 1),
    ("cite", 1),
    ("url", 1),
    ("href", 1),
    ("includegraphics", 1),
    ("hspace", 1),
    ("vspace", 1),
];

const TEXT_BACKSLASH: &str = r"\textbackslash{}";
const TEXT_CIRCUMFLEX: &str = r"\textasciicircum{}";
const TEXT_TILDE: &str = r"\textasciitilde{}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    ControlCharacter,
    OutsideBasicPlane,
    ReplacementCharacter,
}

/// A character the sanitizer could not express and removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SanitizeDiagnostic {
    /// Position in the input, counted in chars.
    pub char_offset: usize,
    pub character: char,
    pub reason: DropReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizedText {
    pub text: String,
    pub diagnostics: Vec<SanitizeDiagnostic>,
}

/// Escape reserved characters outside recognized command spans.
pub fn sanitize(input: &str) -> SanitizedText {
    let chars: Vec<char> = input.chars().collect();
    let partners = match_braces(&chars);
    let mut out = String::with_capacity(input.len() + input.len() / 8);
    let mut diagnostics = Vec::new();
    let mut idx = 0;

    while idx < chars.len() {
        let ch = chars[idx];
        if let Some(reason) = drop_reason(ch) {
            diagnostics.push(SanitizeDiagnostic {
                char_offset: idx,
                character: ch,
                reason,
            });
            idx += 1;
            continue;
        }
        match ch {
            '\\' => {
                idx = copy_command(&chars, &partners, idx, &mut out, &mut diagnostics);
            }
            '{' | '}' => {
                if partners[idx].is_none() {
                    out.push('\\');
                }
                out.push(ch);
                idx += 1;
            }
            '$' | '%' | '&' | '#' | '_' => {
                out.push('\\');
                out.push(ch);
                idx += 1;
            }
            '^' => {
                out.push_str(TEXT_CIRCUMFLEX);
                idx += 1;
            }
            '~' => {
                out.push_str(TEXT_TILDE);
                idx += 1;
            }
            _ => {
                out.push(ch);
                idx += 1;
            }
        }
    }

    SanitizedText {
        text: out,
        diagnostics,
    }
}

fn drop_reason(ch: char) -> Option<DropReason> {
    if ch.is_control() && !matches!(ch, '\n' | '\t' | '\r') {
        return Some(DropReason::ControlCharacter);
    }
    if ch == '\u{FFFD}' {
        return Some(DropReason::ReplacementCharacter);
    }
    if u32::from(ch) > 0xFFFF {
        return Some(DropReason::OutsideBasicPlane);
    }
    None
}

/// Pair up unescaped braces. Unmatched braces map to `None`.
fn match_braces(chars: &[char]) -> Vec<Option<usize>> {
    let mut partners = vec![None; chars.len()];
    let mut stack = Vec::new();
    let mut idx = 0;
    while idx < chars.len() {
        match chars[idx] {
            '\\' => {
                idx += 2;
                continue;
            }
            '{' => stack.push(idx),
            '}' => {
                if let Some(open) = stack.pop() {
                    partners[open] = Some(idx);
                    partners[idx] = Some(open);
                }
            }
            _ => {}
        }
        idx += 1;
    }
    partners
}

/// Emit the backslash sequence starting at `idx`; returns the next index.
fn copy_command(
    chars: &[char],
    partners: &[Option<usize>],
    idx: usize,
    out: &mut String,
    diagnostics: &mut Vec<SanitizeDiagnostic>,
) -> usize {
    match chars.get(idx + 1).copied() {
        Some(next) if next.is_ascii_alphabetic() => {
            let mut end = idx + 1;
            while end < chars.len() && chars[end].is_ascii_alphabetic() {
                end += 1;
            }
            let name: String = chars[idx + 1..end].iter().collect();
            if chars.get(end) == Some(&'*') {
                end += 1;
            }
            out.extend(&chars[idx..end]);

            let mut remaining = raw_argument_groups(&name);
            while remaining > 0 {
                match chars.get(end) {
                    Some('[') if name == "includegraphics" => match bracket_end(chars, end) {
                        Some(close) => {
                            copy_raw(chars, end, close, out, diagnostics);
                            end = close + 1;
                        }
                        None => break,
                    },
                    Some('{') => match partners[end] {
                        Some(close) if !has_dangling_escape(chars, end, close) => {
                            copy_raw(chars, end, close, out, diagnostics);
                            end = close + 1;
                            remaining -= 1;
                        }
                        _ => break,
                    },
                    _ => break,
                }
            }
            end
        }
        Some(next) if next.is_ascii_punctuation() || next == ' ' => {
            out.push('\\');
            out.push(next);
            idx + 2
        }
        _ => {
            out.push_str(TEXT_BACKSLASH);
            idx + 1
        }
    }
}

fn raw_argument_groups(name: &str) -> usize {
    RAW_ARGUMENT_COMMANDS
        .iter()
        .find(|(command, _)| *command == name)
        .map(|(_, groups)| *groups)
        .unwrap_or(0)
}

/// Closing `]` of an optional argument. Braces and line breaks disqualify it.
fn bracket_end(chars: &[char], open: usize) -> Option<usize> {
    let mut idx = open + 1;
    while idx < chars.len() {
        match chars[idx] {
            '\\' if chars.get(idx + 1).is_some_and(|&next| drop_reason(next).is_some()) => {
                return None
            }
            '\\' => idx += 2,
            ']' => return Some(idx),
            '{' | '}' | '[' | '\n' => return None,
            _ => idx += 1,
        }
    }
    None
}

/// A backslash escaping a character that will be dropped would pair with a
/// different character after dropping, so such spans are not copied verbatim.
fn has_dangling_escape(chars: &[char], start: usize, end: usize) -> bool {
    let mut idx = start;
    while idx < end {
        if chars[idx] == '\\' {
            if chars.get(idx + 1).is_some_and(|&next| drop_reason(next).is_some()) {
                return true;
            }
            idx += 2;
        } else {
            idx += 1;
        }
    }
    false
}

fn copy_raw(
    chars: &[char],
    start: usize,
    end: usize,
    out: &mut String,
    diagnostics: &mut Vec<SanitizeDiagnostic>,
) {
    for (offset, &ch) in chars[start..=end].iter().enumerate() {
        if let Some(reason) = drop_reason(ch) {
            diagnostics.push(SanitizeDiagnostic {
                char_offset: start + offset,
                character: ch,
                reason,
            });
            continue;
        }
        out.push(ch);
    }
}
