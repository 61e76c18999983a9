//! Instance context handling: result merging, size limits, template resolution.
//!
//! The instance context is a single JSON object that flows through the run.
//! Action results are merged into it after each completed attempt, and
//! string values in action configuration may reference it through
//! `{{ path.to.key }}` placeholders.

use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum serialized size of a single action result (1 MB).
pub const MAX_RESULT_SIZE: usize = 1_048_576;

/// Maximum serialized size of an instance context (10 MB).
pub const MAX_CONTEXT_SIZE: usize = 10_485_760;

/// Errors raised while merging a result into the context.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("result of step '{step_id}' is {size} bytes, limit is {max}")]
    ResultTooLarge { step_id: String, size: usize, max: usize },

    #[error("context would grow to {size} bytes, limit is {max}")]
    ContextTooLarge { size: usize, max: usize },
}

// ---------------------------------------------------------------------------
// Merging
// ---------------------------------------------------------------------------

/// Normalize an initial context: `null` becomes `{}`, any other non-object
/// value is wrapped as `{"input": value}`.
pub fn normalize_context(initial: Value) -> Value {
    match initial {
        Value::Object(_) => initial,
        Value::Null => Value::Object(Map::new()),
        other => {
            let mut map = Map::new();
            map.insert("input".to_string(), other);
            Value::Object(map)
        }
    }
}

/// Merge a step result into the context.
///
/// Object results are merged key by key into the top level (later steps
/// overwrite earlier keys). Any other non-null result is stored under the
/// step ID. `null` leaves the context untouched.
pub fn merge_result(context: &mut Value, step_id: &str, result: &Value) -> Result<(), ContextError> {
    let size = serialized_size(result);
    if size > MAX_RESULT_SIZE {
        return Err(ContextError::ResultTooLarge {
            step_id: step_id.to_string(),
            size,
            max: MAX_RESULT_SIZE,
        });
    }

    let mut merged = normalize_context(context.clone());
    if let Value::Object(target) = &mut merged {
        match result {
            Value::Null => {}
            Value::Object(fields) => {
                for (key, value) in fields {
                    target.insert(key.clone(), value.clone());
                }
            }
            other => {
                target.insert(step_id.to_string(), other.clone());
            }
        }
    }

    let total = serialized_size(&merged);
    if total > MAX_CONTEXT_SIZE {
        return Err(ContextError::ContextTooLarge {
            size: total,
            max: MAX_CONTEXT_SIZE,
        });
    }

    *context = merged;
    Ok(())
}

fn serialized_size(value: &Value) -> usize {
    serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

/// Look up a dotted path (`a.b.0.c`) in a JSON value. Numeric segments index
/// into arrays.
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(value, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

/// Resolve `{{ path }}` placeholders in every string of `configuration`.
///
/// A string consisting of a single placeholder is replaced by the typed
/// value (so `"{{ amount }}"` yields a number). Placeholders embedded in
/// longer strings are interpolated as text. Unknown paths resolve to `null`
/// or the empty string respectively.
pub fn resolve_templates(configuration: &Value, context: &Value) -> Value {
    match configuration {
        Value::String(s) => resolve_string(s, context),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| resolve_templates(item, context))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_templates(v, context)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Whether a string contains at least one `{{ ... }}` placeholder.
pub fn is_template(s: &str) -> bool {
    s.find("{{").is_some_and(|start| s[start..].contains("}}"))
}

fn resolve_string(s: &str, context: &Value) -> Value {
    let trimmed = s.trim();
    if let Some(inner) = trimmed
        .strip_prefix("{{")
        .and_then(|rest| rest.strip_suffix("}}"))
    {
        if !inner.contains("{{") && !inner.contains("}}") {
            return lookup_path(context, inner.trim())
                .cloned()
                .unwrap_or(Value::Null);
        }
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start + 2..].find("}}") else {
            break;
        };
        out.push_str(&rest[..start]);
        let path = rest[start + 2..start + 2 + len].trim();
        if let Some(value) = lookup_path(context, path) {
            out.push_str(&value_to_string(value));
        }
        rest = &rest[start + 2 + len + 2..];
    }
    out.push_str(rest);
    Value::String(out)
}

/// Convert a JSON value to a display string. Strings are returned without
/// surrounding quotes.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
