//! Deferred step-result references inside plan arguments.
//!
//! A string argument of the form `$result[i]` or `$result[i].a.b` is replaced
//! by the result of step `i` (optionally navigated by the dotted path) once
//! that step has completed successfully. References to steps with no result
//! are passed through as the literal string.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

fn reference_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\$result\[(\d+)\](?:\.(.+))?$").expect("valid step reference regex")
    })
}

/// Parses a reference string into the step index and optional dotted path.
pub fn parse_reference(text: &str) -> Option<(usize, Option<&str>)> {
    let caps = reference_pattern().captures(text)?;
    let idx = caps.get(1)?.as_str().parse().ok()?;
    let path = caps.get(2).map(|m| m.as_str());
    Some((idx, path))
}

/// Walks `path` through objects by key and arrays by numeric index.
/// A segment that does not exist yields `Null`.
pub fn navigate(value: &Value, path: &str) -> Value {
    let mut current = value;
    for segment in path.split('.') {
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        match next {
            Some(v) => current = v,
            None => return Value::Null,
        }
    }
    current.clone()
}

pub fn resolve_args(args: &Map<String, Value>, completed: &HashMap<usize, Value>) -> Map<String, Value> {
    args.iter()
        .map(|(k, v)| (k.clone(), resolve_value(v, completed)))
        .collect()
}

pub fn resolve_value(value: &Value, completed: &HashMap<usize, Value>) -> Value {
    match value {
        Value::String(text) => {
            let Some((idx, path)) = parse_reference(text) else {
                return value.clone();
            };
            match completed.get(&idx) {
                Some(result) => match path {
                    Some(path) => navigate(result, path),
                    None => result.clone(),
                },
                None => {
                    tracing::warn!(
                        "unresolved step reference {} passed through as a literal",
                        text
                    );
                    value.clone()
                }
            }
        }
        Value::Object(map) => Value::Object(resolve_args(map, completed)),
        Value::Array(items) => Value::Array(
            items.iter().map(|item| resolve_value(item, completed)).collect(),
        ),
        other => other.clone(),
    }
}
