//! Step references inside planned arguments.
//!
//! A planned step may use the result of an earlier step with a placeholder of
//! the form `{{step.N}}` or `{{step.N.field}}`, where `N` is the zero-based
//! index of the earlier step. Placeholders are resolved right before dispatch:
//!
//! - a string that is exactly one placeholder is replaced by the referenced
//!   JSON value (so `"{{step.0.paths}}"` becomes an array)
//! - a placeholder embedded in a longer string is replaced by text; arrays of
//!   strings become single-quoted shell words joined by spaces

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;
use crate::chain::{ReasoningStep, StepOutcome};

fn reference_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{\s*step\.(\d+)(?:\.([A-Za-z_][A-Za-z0-9_]*))?\s*\}\}")
            .expect("step reference pattern is valid")
    })
}

/// A parsed `{{step.N.field}}` placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReference {
    pub index: usize,
    pub field: Option<String>,
}

fn from_captures(caps: &regex::Captures<'_>) -> Option<StepReference> {
    let index = caps.get(1)?.as_str().parse().ok()?;
    Some(StepReference {
        index,
        field: caps.get(2).map(|m| m.as_str().to_string()),
    })
}

/// Parse a string that consists of exactly one placeholder.
pub fn parse_whole(s: &str) -> Option<StepReference> {
    let trimmed = s.trim();
    let caps = reference_pattern().captures(trimmed)?;
    let whole = caps.get(0)?;
    if whole.start() != 0 || whole.end() != trimmed.len() {
        return None;
    }
    from_captures(&caps)
}

pub fn is_whole_reference(s: &str) -> bool {
    parse_whole(s).is_some()
}

/// Every placeholder found anywhere in a JSON value.
pub fn references(value: &Value) -> Vec<StepReference> {
    let mut found = Vec::new();
    collect(value, &mut found);
    found
}

fn collect(value: &Value, found: &mut Vec<StepReference>) {
    match value {
        Value::String(s) => found.extend(
            reference_pattern()
                .captures_iter(s)
                .filter_map(|c| from_captures(&c)),
        ),
        Value::Array(items) => items.iter().for_each(|v| collect(v, found)),
        Value::Object(map) => map.values().for_each(|v| collect(v, found)),
        _ => {}
    }
}

/// Resolve every placeholder in `arguments` against the executed steps.
///
/// Fails with a human-readable reason when a placeholder names a step that
/// has not run, did not succeed, or lacks the requested field.
pub fn resolve(arguments: &Map<String, Value>, history: &[ReasoningStep]) -> Result<Map<String, Value>, String> {
    arguments
        .iter()
        .map(|(k, v)| Ok((k.clone(), resolve_value(v, history)?)))
        .collect()
}

fn resolve_value(value: &Value, history: &[ReasoningStep]) -> Result<Value, String> {
    match value {
        Value::String(s) => {
            if let Some(reference) = parse_whole(s) {
                return lookup(&reference, history).cloned();
            }
            resolve_embedded(s, history).map(Value::String)
        }
        Value::Array(items) => items
            .iter()
            .map(|v| resolve_value(v, history))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => resolve(map, history).map(Value::Object),
        other => Ok(other.clone()),
    }
}

fn resolve_embedded(s: &str, history: &[ReasoningStep]) -> Result<String, String> {
    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for caps in reference_pattern().captures_iter(s) {
        let Some(whole) = caps.get(0) else { continue };
        let reference = from_captures(&caps)
            .ok_or_else(|| format!("malformed step reference '{}'", whole.as_str()))?;
        out.push_str(&s[last..whole.start()]);
        out.push_str(&render(lookup(&reference, history)?));
        last = whole.end();
    }
    out.push_str(&s[last..]);
    Ok(out)
}

fn lookup<'a>(reference: &StepReference, history: &'a [ReasoningStep]) -> Result<&'a Value, String> {
    let step = history
        .iter()
        .find(|s| s.index == reference.index)
        .ok_or_else(|| format!("step {} has not run", reference.index))?;

    let output = match &step.outcome {
        Some(StepOutcome::Success { output }) => output,
        _ => return Err(format!("step {} did not succeed", reference.index)),
    };

    match &reference.field {
        None => Ok(output),
        Some(field) => output
            .get(field)
            .ok_or_else(|| format!("step {} result has no field '{field}'", reference.index)),
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(|v| match v {
                Value::String(s) => shell_quote(s),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(" "),
        other => other.to_string(),
    }
}

/// Quote a word for POSIX `sh`.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
