//! Turns model output that is supposed to be a JSON array of pages into
//! `PageRecord`s. Each fix is a separate pass so it can be tested (and
//! reordered) on its own; every pass leaves already-valid JSON untouched.

use crate::core::error::PipelineError;
use crate::core::state::{PageRecord, MISSING_TEXT_PLACEHOLDER};
use serde::Deserialize;

/// Repair passes in the order they are applied.
pub const PASSES: [fn(&str) -> String; 5] = [
    strip_code_fences,
    strip_line_comments,
    complete_brackets,
    normalize_quotes,
    remove_trailing_commas,
];

pub fn repair(raw: &str) -> String {
    PASSES.iter().fold(raw.to_string(), |text, pass| pass(&text))
}

/// Cuts the payload out of a ``` fence, wherever the markers sit.
///
/// The opening marker (and its language tag) counts only when no bracket
/// precedes it; the closing one only when no bracket follows it.
pub fn strip_code_fences(s: &str) -> String {
    const FENCE: &str = "```";
    if !s.contains(FENCE) {
        return s.to_string();
    }
    let mut body = s;
    if let Some(i) = body.find(FENCE).filter(|&i| !body[..i].contains(['[', '{'])) {
        body = body[i + FENCE.len()..]
            .trim_start_matches(|c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    }
    if let Some(j) = body.rfind(FENCE).filter(|&j| !body[j + FENCE.len()..].contains([']', '}'])) {
        body = &body[..j];
    }
    body.trim().to_string()
}

/// Removes `// ...` comments that are not inside a string literal.
pub fn strip_line_comments(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    let mut quote: Option<char> = None;

    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                out.push(c);
                if c == '\\' {
                    if let Some(escaped) = chars.next() {
                        out.push(escaped);
                    }
                } else if c == q || c == '\n' {
                    quote = None;
                }
            }
            None => {
                if c == '/' && chars.peek() == Some(&'/') {
                    while let Some(&next) = chars.peek() {
                        if next == '\n' {
                            break;
                        }
                        chars.next();
                    }
                    continue;
                }
                if c == '"' || c == '\'' {
                    quote = Some(c);
                }
                out.push(c);
            }
        }
    }

    out
}

/// Trims and closes an array the model left open (or never opened).
pub fn complete_brackets(s: &str) -> String {
    let trimmed = s.trim();
    let mut out = String::with_capacity(trimmed.len() + 2);
    if !trimmed.starts_with('[') {
        out.push('[');
    }
    out.push_str(trimmed);
    if !trimmed.ends_with(']') {
        out.push(']');
    }
    out
}

/// Rewrites single-quoted strings as double-quoted ones.
///
/// Apostrophes inside double-quoted strings are left alone, and double
/// quotes inside single-quoted strings get escaped.
pub fn normalize_quotes(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    let mut quote: Option<char> = None;

    while let Some(c) = chars.next() {
        match (quote, c) {
            (None, '\'') => {
                quote = Some('\'');
                out.push('"');
            }
            (None, '"') => {
                quote = Some('"');
                out.push('"');
            }
            (None, _) => out.push(c),
            (Some('\''), '\\') => match chars.next() {
                Some('\'') => out.push('\''),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            },
            (Some('\''), '"') => out.push_str("\\\""),
            (Some('\''), '\'') => {
                quote = None;
                out.push('"');
            }
            (Some(_), '\\') => {
                out.push('\\');
                if let Some(escaped) = chars.next() {
                    out.push(escaped);
                }
            }
            (Some('"'), '"') => {
                quote = None;
                out.push('"');
            }
            (Some(_), _) => out.push(c),
        }
    }

    out
}

/// Drops a comma whose next non-whitespace character closes an object or array.
pub fn remove_trailing_commas(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len());
    let mut in_string = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if in_string {
            out.push(c);
            if c == '\\' {
                if let Some(&escaped) = chars.get(i + 1) {
                    out.push(escaped);
                    i += 1;
                }
            } else if c == '"' {
                in_string = false;
            }
        } else if c == '"' {
            in_string = true;
            out.push(c);
        } else if c == ',' {
            let next = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
            if !matches!(next, Some('}') | Some(']')) {
                out.push(c);
            }
        } else {
            out.push(c);
        }
        i += 1;
    }

    out
}

#[derive(Deserialize)]
struct RawPage {
    #[serde(default)]
    text: Option<String>,
    #[serde(default, rename = "imagePrompt", alias = "image_prompt")]
    image_prompt: Option<String>,
}

impl From<RawPage> for PageRecord {
    fn from(raw: RawPage) -> Self {
        let text = raw
            .text
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| MISSING_TEXT_PLACEHOLDER.to_string());
        PageRecord {
            text,
            image_prompt: raw.image_prompt.unwrap_or_default().trim().to_string(),
        }
    }
}

/// Parses already-repaired text. Missing fields fall back to placeholders.
pub fn parse_pages(candidate: &str) -> Result<Vec<PageRecord>, serde_json::Error> {
    let pages: Vec<RawPage> = serde_json::from_str(candidate)?;
    Ok(pages.into_iter().map(PageRecord::from).collect())
}

/// Repairs then parses; the error keeps both texts for diagnosis.
pub fn extract_pages(raw: &str) -> Result<Vec<PageRecord>, PipelineError> {
    let repaired = repair(raw);
    parse_pages(&repaired).map_err(|e| PipelineError::JsonStructure {
        raw: raw.to_string(),
        repaired: repaired.clone(),
        message: e.to_string(),
    })
}
