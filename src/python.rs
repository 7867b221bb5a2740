//! Tree-sitter helpers for the Python sources flowing through the pipeline
//!
//! Everything that needs a syntax tree (stub classification, snippet
//! validation, attribution, string-aware normalization) goes through here.

use std::cell::RefCell;
use tree_sitter::{Node, Parser, Tree};

// ═══════════════════════════════════════════════════════════════════════════
//  THREAD-LOCAL PARSER
// ═══════════════════════════════════════════════════════════════════════════
//
// Tree-sitter parsers are expensive to create but can be reused. Each rayon
// worker scoring a rollout gets its own pre-configured parser.

thread_local! {
    static PYTHON_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        // Ignore error here - will be caught at parse time if language fails
        let _ = p.set_language(&tree_sitter_python::LANGUAGE.into());
        p
    });
}

/// Parse Python source with the thread-local parser.
///
/// Returns `None` only when tree-sitter itself gives up (language not set,
/// cancellation); malformed code still yields a tree with error nodes.
pub fn parse(source: &str) -> Option<Tree> {
    PYTHON_PARSER.with(|p| p.borrow_mut().parse(source, None))
}

/// True when the source parses without error or missing nodes.
pub fn parses_cleanly(source: &str) -> bool {
    match parse(source) {
        Some(tree) => !tree.root_node().has_error(),
        None => false,
    }
}

/// True when `snippet` is a standalone, error-free definition of `method`.
///
/// Used to decide whether an agent's candidate is syntax-valid before it is
/// considered for splicing.
pub fn is_valid_method_snippet(snippet: &str, method: &str) -> bool {
    let Some(tree) = parse(snippet) else {
        return false;
    };
    let root = tree.root_node();
    if root.has_error() {
        return false;
    }

    let mut cursor = root.walk();
    let mut defs = root
        .named_children(&mut cursor)
        .filter(|n| n.kind() != "comment");
    let Some(first) = defs.next() else {
        return false;
    };
    let Some(function) = unwrap_decorated(first) else {
        return false;
    };
    function
        .child_by_field_name("name")
        .map(|name| node_text(&name, snippet) == method)
        .unwrap_or(false)
}

/// Resolve a `decorated_definition` to the function it wraps.
pub fn unwrap_decorated(node: Node<'_>) -> Option<Node<'_>> {
    match node.kind() {
        "function_definition" => Some(node),
        "decorated_definition" => node
            .child_by_field_name("definition")
            .filter(|d| d.kind() == "function_definition"),
        _ => None,
    }
}

/// Row spans (0-based, inclusive) of string literals that cross a line break.
///
/// Everything after the opening quote belongs to the literal's value, so
/// formatting passes must leave those rows alone.
pub fn multiline_string_rows(source: &str) -> Vec<(usize, usize)> {
    let Some(tree) = parse(source) else {
        return Vec::new();
    };
    let mut rows = Vec::new();
    let mut cursor = tree.root_node().walk();

    loop {
        let node = cursor.node();
        if node.kind() == "string" {
            let start = node.start_position().row;
            let end = node.end_position().row;
            if end > start {
                rows.push((start, end));
            }
        } else if cursor.goto_first_child() {
            continue;
        }

        while !cursor.goto_next_sibling() {
            if !cursor.goto_parent() {
                return rows;
            }
        }
    }
}

pub fn node_text(node: &Node, content: &str) -> String {
    content
        .get(node.start_byte()..node.end_byte())
        .unwrap_or_default()
        .to_string()
}

/// Count of leading indentation columns, with tabs expanded to four spaces.
pub fn indent_width(line: &str) -> usize {
    let mut width = 0;
    for c in line.chars() {
        match c {
            ' ' => width += 1,
            '\t' => width += 4,
            _ => break,
        }
    }
    width
}

/// Replace leading tabs with four spaces each.
pub fn expand_leading_tabs(line: &str) -> String {
    let body = line.trim_start_matches([' ', '\t']);
    let indent = &line[..line.len() - body.len()];
    if !indent.contains('\t') {
        return line.to_string();
    }
    format!("{}{}", " ".repeat(indent_width(indent)), body)
}
