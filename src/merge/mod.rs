//! Splicing selected snippets into the class skeleton
//!
//! Merging is line-based on purpose: the skeleton is valid Python, but the
//! snippets going into it come from generated text, and splice bookkeeping
//! has to survive whatever they contain.

mod normalize;
mod select;

pub use normalize::{format_or_keep, normalize_whitespace, CommandFormatter, SourceFormatter};
pub use select::{select, CandidateSnippet, Selection, Visibility};

use crate::error::ConfigurationError;
use crate::extract::{capture_end, string_continuation_rows};
use crate::python::{expand_leading_tabs, indent_width};
use rand::Rng;
use regex::Regex;
use std::collections::BTreeMap;

const DEFAULT_INDENT: &str = "    ";

/// Location of the target class inside the current line buffer.
#[derive(Debug, Clone, Copy)]
struct ClassBlock {
    header: usize,
    header_indent: usize,
    /// Indentation of the first body statement, if any
    body_indent: Option<usize>,
    /// One past the last line of the block
    end: usize,
}

impl ClassBlock {
    /// Index just after the last non-blank body line.
    fn insert_at(&self, lines: &[String]) -> usize {
        (self.header + 1..self.end)
            .rev()
            .find(|&i| !lines[i].trim().is_empty() && indent_width(&lines[i]) > self.header_indent)
            .map(|i| i + 1)
            .unwrap_or(self.header + 1)
    }
}

/// Splice `method_to_code` into the `class_name` block of `skeleton`.
///
/// Only a missing class or an empty skeleton is an error; bad snippets
/// degrade to whatever lines they contain.
pub fn merge(
    skeleton: &str,
    class_name: &str,
    method_to_code: &BTreeMap<String, String>,
) -> Result<String, ConfigurationError> {
    merge_with(skeleton, class_name, method_to_code, None)
}

/// [`merge`] with an optional autoformat pass at the end.
pub fn merge_with(
    skeleton: &str,
    class_name: &str,
    method_to_code: &BTreeMap<String, String>,
    formatter: Option<&dyn SourceFormatter>,
) -> Result<String, ConfigurationError> {
    if skeleton.trim().is_empty() {
        return Err(ConfigurationError::EmptySkeleton);
    }
    let header_re = Regex::new(&format!(r"^\s*class\s+{}\b", regex::escape(class_name)))
        .map_err(|e| ConfigurationError::InvalidConfig(e.to_string()))?;

    let mut lines: Vec<String> = skeleton.lines().map(str::to_string).collect();
    if locate_class(&lines, &header_re).is_none() {
        return Err(ConfigurationError::ClassNotFound(class_name.to_string()));
    }

    for method in splice_order(&lines, &header_re, method_to_code) {
        let code = &method_to_code[method];
        let snippet = snippet_lines(code);
        if snippet.is_empty() {
            continue;
        }

        // Positions shift after every splice, so the class is re-located each time.
        let Some(block) = locate_class(&lines, &header_re) else {
            break;
        };

        match locate_method(&lines, &block, method) {
            Some(region) => {
                let snippet_decorated = snippet[0].0.trim_start().starts_with('@');
                let start = if snippet_decorated {
                    region.start
                } else {
                    region.def_line
                };
                let replacement = reindent(&snippet, &region.indent);
                lines.splice(start..region.end, replacement);
            }
            None => {
                let indent = block
                    .body_indent
                    .map(|w| " ".repeat(w))
                    .unwrap_or_else(|| format!("{}{}", " ".repeat(block.header_indent), DEFAULT_INDENT));
                let at = block.insert_at(&lines);
                let mut replacement = vec![String::new()];
                replacement.extend(reindent(&snippet, &indent));
                lines.splice(at..at, replacement);
            }
        }
    }

    let mut merged = lines.join("\n");
    merged.push('\n');
    let normalized = normalize_whitespace(&merged);
    Ok(format_or_keep(normalized, formatter))
}

/// Select one candidate per method from the agents' texts and merge them.
pub fn select_and_merge<S, R>(
    skeleton: &str,
    class_name: &str,
    method_names: &[String],
    agent_texts: &[S],
    visibility: &Visibility,
    rng: &mut R,
) -> Result<String, ConfigurationError>
where
    S: AsRef<str>,
    R: Rng + ?Sized,
{
    let selection = select(agent_texts, method_names, visibility, rng)?;
    merge(skeleton, class_name, &selection.code_by_method())
}

/// Methods present in the skeleton first (by position), then the rest by name.
fn splice_order<'a>(
    lines: &[String],
    header_re: &Regex,
    method_to_code: &'a BTreeMap<String, String>,
) -> Vec<&'a str> {
    let block = locate_class(lines, header_re);
    let mut keyed: Vec<(usize, &str)> = method_to_code
        .keys()
        .map(|name| {
            let position = block
                .as_ref()
                .and_then(|b| locate_method(lines, b, name))
                .map(|r| r.def_line)
                .unwrap_or(usize::MAX);
            (position, name.as_str())
        })
        .collect();
    keyed.sort();
    keyed.into_iter().map(|(_, name)| name).collect()
}

fn locate_class(lines: &[String], header_re: &Regex) -> Option<ClassBlock> {
    let header = lines.iter().position(|l| header_re.is_match(l))?;
    let header_indent = indent_width(&lines[header]);

    // Decorator lines don't end the block by themselves; the first line at or
    // below the header's indentation that is not a decorator does.
    let mut end = lines.len();
    for (i, line) in lines.iter().enumerate().skip(header + 1) {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('@') {
            continue;
        }
        if indent_width(line) <= header_indent {
            end = i;
            break;
        }
    }
    // Hand decorators (and blank/comment lines) directly above the terminator back
    // to whatever follows the class.
    while end > header + 1 {
        let prev = &lines[end - 1];
        let trimmed = prev.trim();
        let detached = trimmed.is_empty()
            || (indent_width(prev) <= header_indent
                && (trimmed.starts_with('@') || trimmed.starts_with('#')));
        if !detached {
            break;
        }
        end -= 1;
    }

    let body_indent = lines[header + 1..end]
        .iter()
        .find(|l| {
            let t = l.trim();
            !t.is_empty() && !t.starts_with('#')
        })
        .map(|l| indent_width(l))
        .filter(|&w| w > header_indent);

    Some(ClassBlock {
        header,
        header_indent,
        body_indent,
        end,
    })
}

#[derive(Debug)]
struct MethodRegion {
    /// First decorator line, or the `def` line when undecorated
    start: usize,
    def_line: usize,
    end: usize,
    indent: String,
}

fn locate_method(lines: &[String], block: &ClassBlock, name: &str) -> Option<MethodRegion> {
    let def_re = Regex::new(&format!(
        r"^\s*(?:async\s+)?def\s+{}\s*\(",
        regex::escape(name)
    ))
    .ok()?;

    let def_line = (block.header + 1..block.end).find(|&i| {
        let line = &lines[i];
        let width = indent_width(line);
        let at_member_level = match block.body_indent {
            Some(body) => width == body,
            None => width > block.header_indent,
        };
        at_member_level && def_re.is_match(line)
    })?;

    let width = indent_width(&lines[def_line]);
    let mut start = def_line;
    while start > block.header + 1 {
        let prev = &lines[start - 1];
        if prev.trim_start().starts_with('@') && indent_width(prev) == width {
            start -= 1;
        } else {
            break;
        }
    }

    let expanded: Vec<String> = lines[..block.end]
        .iter()
        .map(|l| expand_leading_tabs(l))
        .collect();
    let mut end = capture_end(&expanded, def_line);
    // Comments at or left of the def line introduce whatever comes next.
    while end > def_line + 1 {
        let prev = &expanded[end - 1];
        let trimmed = prev.trim();
        if trimmed.is_empty() || (trimmed.starts_with('#') && indent_width(prev) <= width) {
            end -= 1;
        } else {
            break;
        }
    }

    let line = &lines[def_line];
    let indent = line[..line.len() - line.trim_start().len()].to_string();

    Some(MethodRegion {
        start,
        def_line,
        end,
        indent,
    })
}

/// Snippet lines with surrounding blank lines removed, each flagged when it
/// continues a multi-line string. Flagged lines are kept verbatim; the rest
/// get their tabs expanded.
fn snippet_lines(code: &str) -> Vec<(String, bool)> {
    let raw: Vec<&str> = code.lines().collect();
    let mut lines: Vec<(String, bool)> = raw
        .iter()
        .zip(string_continuation_rows(&raw))
        .map(|(line, inside)| {
            if inside {
                (line.to_string(), true)
            } else {
                (expand_leading_tabs(line), false)
            }
        })
        .collect();
    while lines
        .last()
        .map(|(l, inside)| !inside && l.trim().is_empty())
        .unwrap_or(false)
    {
        lines.pop();
    }
    let first = lines
        .iter()
        .position(|(l, _)| !l.trim().is_empty())
        .unwrap_or(lines.len());
    lines.drain(..first);
    lines
}

fn reindent(snippet: &[(String, bool)], indent: &str) -> Vec<String> {
    snippet
        .iter()
        .map(|(line, inside)| {
            if *inside {
                line.clone()
            } else if line.trim().is_empty() {
                String::new()
            } else {
                format!("{}{}", indent, line)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::python::parses_cleanly;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const SKELETON: &str = r#"import math


class Shapes:
    """Geometry helpers."""

    def __init__(self, scale):
        self.scale = scale

    def area(self, r):
        pass

    @staticmethod
    def unit():
        """Return the unit value."""
        raise NotImplementedError

    def perimeter(self, r):
        ...


def helper():
    return 1
"#;

    fn code(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_replaces_stub_and_keeps_structure() {
        let merged = merge(
            SKELETON,
            "Shapes",
            &code(&[("area", "def area(self, r):\n    return math.pi * r * r * self.scale\n")]),
        )
        .unwrap();

        assert!(merged.contains(
            "    def area(self, r):\n        return math.pi * r * r * self.scale\n\n    @staticmethod"
        ));
        assert!(!merged.contains("    def area(self, r):\n        pass"));
        assert!(merged.contains("def helper():\n    return 1\n"));
        assert!(parses_cleanly(&merged));
    }

    #[test]
    fn test_undecorated_snippet_keeps_skeleton_decorators() {
        let merged = merge(
            SKELETON,
            "Shapes",
            &code(&[("unit", "def unit():\n    return 1.0\n")]),
        )
        .unwrap();
        assert!(merged.contains("    @staticmethod\n    def unit():\n        return 1.0\n"));
        assert!(!merged.contains("NotImplementedError"));
    }

    #[test]
    fn test_decorated_snippet_replaces_skeleton_decorators() {
        let merged = merge(
            SKELETON,
            "Shapes",
            &code(&[("unit", "@classmethod\ndef unit(cls):\n    return 1.0\n")]),
        )
        .unwrap();
        assert!(merged.contains("    @classmethod\n    def unit(cls):\n        return 1.0\n"));
        assert!(!merged.contains("@staticmethod"));
    }

    #[test]
    fn test_missing_method_is_appended_inside_class() {
        let merged = merge(
            SKELETON,
            "Shapes",
            &code(&[("volume", "def volume(self, r):\n    return r ** 3\n")]),
        )
        .unwrap();
        assert!(merged.contains(
            "    def perimeter(self, r):\n        ...\n\n    def volume(self, r):\n        return r ** 3\n\n\ndef helper():"
        ));
        assert!(parses_cleanly(&merged));
    }

    #[test]
    fn test_multiple_splices_and_idempotence() {
        let snippets = code(&[
            ("perimeter", "def perimeter(self, r):\n    total = 2 * math.pi * r\n    return total\n"),
            ("area", "def area(self, r):\n    return r * r\n"),
        ]);
        let first = merge(SKELETON, "Shapes", &snippets).unwrap();
        let second = merge(SKELETON, "Shapes", &snippets).unwrap();
        assert_eq!(first, second);
        assert!(parses_cleanly(&first));
        assert!(first.contains("        total = 2 * math.pi * r\n        return total\n\n\ndef helper"));

        // Re-merging into an already merged module changes nothing.
        assert_eq!(merge(&first, "Shapes", &snippets).unwrap(), first);
    }

    #[test]
    fn test_tab_indented_skeleton() {
        let skeleton = "class T:\n\tdef f(self):\n\t\tpass\n\n\tdef g(self):\n\t\tpass\n";
        let merged = merge(skeleton, "T", &code(&[("f", "def f(self):\n    return 3\n")])).unwrap();
        assert_eq!(
            merged,
            "class T:\n    def f(self):\n        return 3\n\n    def g(self):\n        pass\n"
        );
    }

    #[test]
    fn test_class_followed_by_decorated_function() {
        let skeleton = "class K:\n    def f(self):\n        pass\n\n@cache\ndef top():\n    return 0\n";
        let merged = merge(skeleton, "K", &code(&[("g", "def g(self):\n    return 1\n")])).unwrap();
        assert!(merged.contains("    def g(self):\n        return 1\n\n@cache\ndef top():"));
    }

    #[test]
    fn test_multiline_string_rows_are_not_reindented() {
        let snippet = "def area(self, r):\n    return \"\"\"a\nb\"\"\"\n";
        let merged = merge(SKELETON, "Shapes", &code(&[("area", snippet)])).unwrap();
        assert!(merged.contains("    def area(self, r):\n        return \"\"\"a\nb\"\"\"\n"));
        assert!(parses_cleanly(&merged));
    }

    #[test]
    fn test_comment_between_methods_survives_splice() {
        let skeleton = "class Foo:\n    def foo(self):\n        pass\n\n    # helpers below are public API\n\n    def bar(self):\n        pass\n";
        let merged = merge(skeleton, "Foo", &code(&[("foo", "def foo(self):\n    return 1\n")])).unwrap();
        assert_eq!(
            merged,
            "class Foo:\n    def foo(self):\n        return 1\n\n    # helpers below are public API\n\n    def bar(self):\n        pass\n"
        );
    }

    #[test]
    fn test_configuration_errors() {
        assert_eq!(
            merge("", "Shapes", &BTreeMap::new()).unwrap_err(),
            ConfigurationError::EmptySkeleton
        );
        assert_eq!(
            merge(SKELETON, "Circle", &BTreeMap::new()).unwrap_err(),
            ConfigurationError::ClassNotFound("Circle".to_string())
        );
    }

    #[test]
    fn test_malformed_snippet_does_not_panic() {
        let merged = merge(
            SKELETON,
            "Shapes",
            &code(&[("area", "def area(self, r:\n  return (\n\n\n")]),
        )
        .unwrap();
        assert!(merged.contains("def area(self, r:"));
    }

    #[test]
    fn test_select_and_merge_prefers_valid_snippet() {
        let skeleton = "class Foo:\n    def foo(self):\n        pass\n";
        let texts = [
            "def foo(self) return 1",
            "Sure!\n```python\ndef foo(self):\n    return 42\n```\n",
        ];
        let merged = select_and_merge(
            skeleton,
            "Foo",
            &["foo".to_string()],
            &texts,
            &Visibility::SelfSelect,
            &mut StdRng::seed_from_u64(1),
        )
        .unwrap();
        assert_eq!(merged, "class Foo:\n    def foo(self):\n        return 42\n");
    }
}
