//! Skeleton model: the incomplete class agents are asked to fill in
//!
//! A skeleton is parsed once per task. Method bodies are classified into a
//! small closed set of stub shapes so the target set is explicit.

use crate::error::ConfigurationError;
use crate::python::{self, node_text, unwrap_decorated};
use serde::Serialize;
use tree_sitter::Node;

/// Shapes a body can take and still count as "not implemented yet".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StubShape {
    /// No statements at all (only recoverable from an error-tolerant parse)
    Empty,
    Pass,
    Ellipsis,
    Docstring,
    RaiseNotImplemented,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "shape")]
pub enum MethodBody {
    Stub(StubShape),
    Implemented,
}

impl MethodBody {
    pub fn is_stub(&self) -> bool {
        matches!(self, MethodBody::Stub(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkeletonMethod {
    pub name: String,
    /// Declared parameters, `self`/`cls` included
    pub param_count: usize,
    /// 0-based row of the `def` line
    pub line: usize,
    pub indent: usize,
    pub has_docstring: bool,
    pub body: MethodBody,
}

#[derive(Debug, Clone)]
pub struct Skeleton {
    class_name: String,
    class_line: usize,
    methods: Vec<SkeletonMethod>,
}

impl Skeleton {
    pub fn parse(source: &str, class_name: &str) -> Result<Self, ConfigurationError> {
        if source.trim().is_empty() {
            return Err(ConfigurationError::EmptySkeleton);
        }
        let tree = python::parse(source)
            .ok_or_else(|| ConfigurationError::ClassNotFound(class_name.to_string()))?;
        let class_node = find_class(tree.root_node(), source, class_name)
            .ok_or_else(|| ConfigurationError::ClassNotFound(class_name.to_string()))?;

        let mut methods = Vec::new();
        if let Some(body) = class_node.child_by_field_name("body") {
            let mut cursor = body.walk();
            for child in body.named_children(&mut cursor) {
                let Some(function) = unwrap_decorated(child) else {
                    continue;
                };
                let Some(name_node) = function.child_by_field_name("name") else {
                    continue;
                };
                let (body, has_docstring) = classify_body(&function, source);
                methods.push(SkeletonMethod {
                    name: node_text(&name_node, source),
                    param_count: count_parameters(&function),
                    line: function.start_position().row,
                    indent: function.start_position().column,
                    has_docstring,
                    body,
                });
            }
        }

        Ok(Self {
            class_name: class_name.to_string(),
            class_line: class_node.start_position().row,
            methods,
        })
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn class_line(&self) -> usize {
        self.class_line
    }

    pub fn methods(&self) -> &[SkeletonMethod] {
        &self.methods
    }

    pub fn method(&self, name: &str) -> Option<&SkeletonMethod> {
        self.methods.iter().find(|m| m.name == name)
    }

    /// Stub methods in source order.
    pub fn target_methods(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for method in self.methods.iter().filter(|m| m.body.is_stub()) {
            if !names.contains(&method.name) {
                names.push(method.name.clone());
            }
        }
        names
    }

    /// Check an explicit target list against the class.
    ///
    /// An empty list means "every stub". Duplicates are dropped, order kept.
    pub fn resolve_targets(&self, names: &[String]) -> Result<Vec<String>, ConfigurationError> {
        let resolved = if names.is_empty() {
            self.target_methods()
        } else {
            let mut resolved: Vec<String> = Vec::with_capacity(names.len());
            for name in names {
                if self.method(name).is_none() {
                    return Err(ConfigurationError::UnknownTarget {
                        method: name.clone(),
                        class_name: self.class_name.clone(),
                    });
                }
                if !resolved.contains(name) {
                    resolved.push(name.clone());
                }
            }
            resolved
        };

        if resolved.is_empty() {
            return Err(ConfigurationError::NoTargets(self.class_name.clone()));
        }
        Ok(resolved)
    }
}

fn find_class<'t>(root: Node<'t>, content: &str, class_name: &str) -> Option<Node<'t>> {
    let mut cursor = root.walk();

    loop {
        let node = cursor.node();
        if node.kind() == "class_definition" {
            let matches = node
                .child_by_field_name("name")
                .map(|n| node_text(&n, content) == class_name)
                .unwrap_or(false);
            if matches {
                return Some(node);
            }
        }

        if cursor.goto_first_child() {
            continue;
        }

        while !cursor.goto_next_sibling() {
            if !cursor.goto_parent() {
                return None;
            }
        }
    }
}

fn count_parameters(function: &Node) -> usize {
    let Some(params) = function.child_by_field_name("parameters") else {
        return 0;
    };
    let mut cursor = params.walk();
    params
        .named_children(&mut cursor)
        .filter(|p| {
            !matches!(
                p.kind(),
                "comment" | "keyword_separator" | "positional_separator"
            )
        })
        .count()
}

/// Classify a function body, returning the shape and whether it opens with a docstring.
fn classify_body(function: &Node, content: &str) -> (MethodBody, bool) {
    let Some(block) = function.child_by_field_name("body") else {
        return (MethodBody::Stub(StubShape::Empty), false);
    };
    let mut cursor = block.walk();
    let statements: Vec<Node> = block
        .named_children(&mut cursor)
        .filter(|n| n.kind() != "comment")
        .collect();

    let has_docstring = statements.first().map(is_docstring).unwrap_or(false);
    let rest = if has_docstring {
        &statements[1..]
    } else {
        &statements[..]
    };

    let body = match rest {
        [] if has_docstring => MethodBody::Stub(StubShape::Docstring),
        [] => MethodBody::Stub(StubShape::Empty),
        stmts if stmts.iter().all(|s| s.kind() == "pass_statement") => {
            MethodBody::Stub(StubShape::Pass)
        }
        [single] if is_ellipsis(single) => MethodBody::Stub(StubShape::Ellipsis),
        [single] if raises_not_implemented(single, content) => {
            MethodBody::Stub(StubShape::RaiseNotImplemented)
        }
        _ => MethodBody::Implemented,
    };
    (body, has_docstring)
}

fn is_docstring(node: &Node) -> bool {
    node.kind() == "expression_statement"
        && node.named_child_count() == 1
        && node
            .named_child(0)
            .map(|c| matches!(c.kind(), "string" | "concatenated_string"))
            .unwrap_or(false)
}

fn is_ellipsis(node: &Node) -> bool {
    node.kind() == "expression_statement"
        && node.named_child_count() == 1
        && node
            .named_child(0)
            .map(|c| c.kind() == "ellipsis")
            .unwrap_or(false)
}

fn raises_not_implemented(node: &Node, content: &str) -> bool {
    if node.kind() != "raise_statement" {
        return false;
    }
    let Some(raised) = node.named_child(0) else {
        return false;
    };
    let target = match raised.kind() {
        "call" => raised.child_by_field_name("function"),
        _ => Some(raised),
    };
    target
        .map(|t| t.kind() == "identifier" && node_text(&t, content) == "NotImplementedError")
        .unwrap_or(false)
}
