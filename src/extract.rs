//! Snippet extraction from free-form agent output
//!
//! Agent completions mix prose, code fences and several `def` blocks, often
//! malformed. Extraction is line-based and never fails: methods that cannot
//! be found are simply absent from the result.

use crate::python::{expand_leading_tabs, indent_width};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;

static DEF_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:async\s+)?def\s+([A-Za-z_][A-Za-z0-9_]*)\s*\(")
        .unwrap_or_else(|_| Regex::new("$^").unwrap())
});

/// Pull method definitions for `allowed` names out of raw agent text.
///
/// Each returned snippet starts with its `def` line at indentation 0 and
/// ends with a newline. Keys are always a subset of `allowed`.
pub fn extract_snippets<S: AsRef<str>>(text: &str, allowed: &[S]) -> BTreeMap<String, String> {
    let mut snippets = BTreeMap::new();
    if allowed.is_empty() {
        return snippets;
    }

    let code = strip_first_fence(text);
    let raw: Vec<&str> = code.lines().collect();
    let lines: Vec<String> = raw.iter().map(|line| expand_leading_tabs(line)).collect();

    let mut i = 0;
    while i < lines.len() {
        let name = DEF_LINE
            .captures(&lines[i])
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
            .filter(|name| allowed.iter().any(|a| a.as_ref() == *name));

        let Some(name) = name else {
            i += 1;
            continue;
        };

        let end = capture_end(&lines, i);
        if !snippets.contains_key(name) {
            let def_indent = indent_width(&lines[i]);
            let in_string = string_continuation_rows(&raw[i..end]);
            let body = (i..end)
                .zip(in_string)
                .map(|(k, inside)| {
                    if inside {
                        raw[k]
                    } else {
                        strip_indent(&lines[k], def_indent)
                    }
                })
                .collect::<Vec<_>>()
                .join("\n");
            snippets.insert(name.to_string(), format!("{}\n", body));
        }
        i = end;
    }

    snippets
}

/// Contents of the first fenced block, or the whole text when there is none.
///
/// An unterminated fence runs to the end of the text.
pub fn strip_first_fence(text: &str) -> &str {
    let Some(open) = find_fence(text, 0) else {
        return text;
    };
    let body_start = match text[open..].find('\n') {
        Some(offset) => open + offset + 1,
        None => return "",
    };
    match find_fence(text, body_start) {
        Some(close) => &text[body_start..close],
        None => &text[body_start..],
    }
}

/// Byte offset of the next line (at or after `from`) that opens or closes a fence.
fn find_fence(text: &str, from: usize) -> Option<usize> {
    let mut offset = from;
    for line in text[from..].split_inclusive('\n') {
        if line.trim_start().starts_with("```") {
            return Some(offset);
        }
        offset += line.len();
    }
    None
}

/// Index one past the last line belonging to the definition opened at `start`.
pub(crate) fn capture_end(lines: &[String], start: usize) -> usize {
    let def_indent = indent_width(&lines[start]);
    let mut open_quote = update_triple_quotes(&lines[start], None);
    let mut end = start + 1;

    while end < lines.len() {
        let line = &lines[end];
        if open_quote.is_some() {
            open_quote = update_triple_quotes(line, open_quote);
            end += 1;
            continue;
        }

        let trimmed = line.trim();
        if !trimmed.is_empty() && !trimmed.starts_with('#') {
            let closes_bracket = trimmed.starts_with([')', ']', '}']);
            if indent_width(line) <= def_indent && !closes_bracket {
                break;
            }
        }
        open_quote = update_triple_quotes(line, None);
        end += 1;
    }

    while end > start + 1 && lines[end - 1].trim().is_empty() {
        end -= 1;
    }
    end
}

/// Flags the rows that start inside a triple-quoted string opened earlier.
/// Their leading whitespace is string content.
pub(crate) fn string_continuation_rows<S: AsRef<str>>(lines: &[S]) -> Vec<bool> {
    let mut open = None;
    lines
        .iter()
        .map(|line| {
            let inside = open.is_some();
            open = update_triple_quotes(line.as_ref(), open);
            inside
        })
        .collect()
}

/// Track whether a line leaves a triple-quoted string open.
fn update_triple_quotes(line: &str, mut open: Option<&'static str>) -> Option<&'static str> {
    let mut rest = line;
    loop {
        match open {
            Some(quote) => match rest.find(quote) {
                Some(pos) => {
                    rest = &rest[pos + 3..];
                    open = None;
                }
                None => return open,
            },
            None => {
                let (pos, quote) = find_triple_quote(rest)?;
                rest = &rest[pos + 3..];
                open = Some(quote);
            }
        }
    }
}

/// First triple quote outside a one-line string literal, stopping at a comment.
fn find_triple_quote(text: &str) -> Option<(usize, &'static str)> {
    let bytes = text.as_bytes();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                if b == b'\\' {
                    i += 2;
                    continue;
                }
                if b == q {
                    quote = None;
                }
            }
            None => match b {
                b'#' => return None,
                b'"' | b'\'' => {
                    if bytes[i..].starts_with(&[b; 3]) {
                        let triple = if b == b'"' { "\"\"\"" } else { "'''" };
                        return Some((i, triple));
                    }
                    quote = Some(b);
                }
                _ => {}
            },
        }
        i += 1;
    }
    None
}

fn strip_indent(line: &str, width: usize) -> &str {
    let leading = line.len() - line.trim_start_matches(' ').len();
    &line[leading.min(width)..]
}
