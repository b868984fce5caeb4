//! Instance context helpers: field lookup, output merging, template resolution.
//!
//! The instance context is a flat-at-the-top JSON object that accumulates step
//! outputs. Condition fields and notification templates address it with dotted
//! paths (`order.total`), descending into nested objects and array indices.

use serde_json::{Map, Value};

/// Look up a dotted path in the context.
///
/// A key that literally contains dots wins over descending, so
/// `{"a.b": 1}` resolves `a.b` to `1`.
pub fn lookup_field<'a>(context: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    if let Some(value) = context.get(path) {
        return Some(value);
    }

    let mut segments = path.split('.');
    let mut current = context.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Merge a step's output into the context.
///
/// Object outputs are merged key by key (later steps overwrite earlier keys).
/// `null` adds nothing. Any other value is stored under the step id.
pub fn merge_output(context: &mut Map<String, Value>, step_id: &str, output: &Value) {
    match output {
        Value::Object(fields) => {
            for (key, value) in fields {
                context.insert(key.clone(), value.clone());
            }
        }
        Value::Null => {}
        other => {
            context.insert(step_id.to_string(), other.clone());
        }
    }
}

/// Resolve `{{ field }}` placeholders against the context.
///
/// Whitespace inside the braces is optional. Unknown references are left
/// as-is (not an error).
pub fn resolve_template(template: &str, context: &Map<String, Value>) -> String {
    let mut result = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start..].find("}}") else {
            break;
        };
        let end = start + len + 2;
        let expr = rest[start + 2..end - 2].trim();

        result.push_str(&rest[..start]);
        match lookup_field(context, expr) {
            Some(value) if !expr.is_empty() => result.push_str(&value_to_string(value)),
            _ => result.push_str(&rest[start..end]),
        }
        rest = &rest[end..];
    }

    result.push_str(rest);
    result
}

/// Convert a JSON value to a display string for template resolution.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        // For objects/arrays, return compact JSON
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
