//! Static test-to-method attribution
//!
//! Maps every test in a suite to the target methods it calls, so credit can
//! be assigned per method (and from there per agent). Test ids use the same
//! `"<test> (<Class>)"` format the sandbox reports.

use crate::python::{node_text, parse, unwrap_decorated};
use std::collections::{BTreeMap, BTreeSet};
use tree_sitter::Node;

const CONSTRUCTOR: &str = "__init__";

/// Map each test id to the target methods it exercises.
///
/// Tests that call no target still appear, with an empty set. Malformed
/// sources yield whatever tree-sitter's error-tolerant tree still exposes.
pub fn attribute_tests_to_methods<S: AsRef<str>>(
    test_source: &str,
    targets: &[S],
    class_name: &str,
) -> BTreeMap<String, BTreeSet<String>> {
    let targets: BTreeSet<&str> = targets.iter().map(|t| t.as_ref()).collect();
    let Some(tree) = parse(test_source) else {
        return BTreeMap::new();
    };

    let mut attribution = BTreeMap::new();
    for (id, function) in test_functions(tree.root_node(), test_source) {
        let mut called = BTreeSet::new();
        collect_target_calls(function, test_source, &targets, class_name, &mut called);
        attribution
            .entry(id)
            .or_insert_with(BTreeSet::new)
            .extend(called);
    }
    attribution
}

/// Test ids found statically in `test_source`, in source order.
pub fn discover_tests(test_source: &str) -> Vec<String> {
    let Some(tree) = parse(test_source) else {
        return Vec::new();
    };
    let mut seen = BTreeSet::new();
    test_functions(tree.root_node(), test_source)
        .into_iter()
        .map(|(id, _)| id)
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

/// Inverse view: target method -> tests attributed to it.
pub fn tests_by_method(
    attribution: &BTreeMap<String, BTreeSet<String>>,
) -> BTreeMap<String, BTreeSet<String>> {
    let mut by_method: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for (test, methods) in attribution {
        for method in methods {
            by_method
                .entry(method.clone())
                .or_default()
                .insert(test.clone());
        }
    }
    by_method
}

fn test_functions<'t>(root: Node<'t>, source: &str) -> Vec<(String, Node<'t>)> {
    let mut found = Vec::new();
    let mut cursor = root.walk();
    for item in root.named_children(&mut cursor) {
        let item = match item.kind() {
            "decorated_definition" => match item.child_by_field_name("definition") {
                Some(def) => def,
                None => continue,
            },
            _ => item,
        };

        match item.kind() {
            "function_definition" => {
                if let Some(name) = test_name(item, source) {
                    found.push((name, item));
                }
            }
            "class_definition" => {
                let Some(class_name) = item
                    .child_by_field_name("name")
                    .map(|n| node_text(&n, source))
                else {
                    continue;
                };
                if !is_test_class(item, &class_name, source) {
                    continue;
                }
                let Some(body) = item.child_by_field_name("body") else {
                    continue;
                };
                let mut body_cursor = body.walk();
                for member in body.named_children(&mut body_cursor) {
                    let Some(method) = unwrap_decorated(member) else {
                        continue;
                    };
                    if let Some(name) = test_name(method, source) {
                        found.push((format!("{} ({})", name, class_name), method));
                    }
                }
            }
            _ => {}
        }
    }
    found
}

fn test_name(function: Node, source: &str) -> Option<String> {
    function
        .child_by_field_name("name")
        .map(|n| node_text(&n, source))
        .filter(|name| name.starts_with("test"))
}

fn is_test_class(class: Node, name: &str, source: &str) -> bool {
    let inherits_test_case = class
        .child_by_field_name("superclasses")
        .map(|bases| node_text(&bases, source).contains("TestCase"))
        .unwrap_or(false);
    let lowered = name.to_lowercase();
    inherits_test_case || lowered.starts_with("test") || lowered.ends_with("test")
}

fn collect_target_calls(
    node: Node,
    source: &str,
    targets: &BTreeSet<&str>,
    class_name: &str,
    called: &mut BTreeSet<String>,
) {
    if node.kind() == "call" {
        if let Some(function) = node.child_by_field_name("function") {
            match function.kind() {
                "attribute" => {
                    if let Some(attr) = function.child_by_field_name("attribute") {
                        let attr = node_text(&attr, source);
                        if targets.contains(attr.as_str()) {
                            called.insert(attr);
                        }
                    }
                }
                "identifier" => {
                    if node_text(&function, source) == class_name && targets.contains(CONSTRUCTOR) {
                        called.insert(CONSTRUCTOR.to_string());
                    }
                }
                _ => {}
            }
        }
    }

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        collect_target_calls(child, source, targets, class_name, called);
    }
}
