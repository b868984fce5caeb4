//! Branch selection for condition steps.
//!
//! `ConditionEvaluator` is a pure function over the instance context: no
//! state, no I/O. Non-default conditions are tried in ascending sequence
//! order and the first match wins; the default condition is the fallback.

use serde_json::{Map, Value};
use stepwise_types::workflow::{Condition, ConditionOperator};
use thiserror::Error;

use super::context::{lookup_field, value_to_string};

/// Errors from branch selection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConditionError {
    /// No condition matched and no default exists. A definition defect.
    #[error("no matching branch and no default condition")]
    NoMatchingBranch,
}

/// Stateless condition evaluator.
///
/// Same pattern as the retry policy -- all logic lives in associated
/// functions.
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    /// Select the condition whose branch is taken.
    ///
    /// The caller reads `next_step` from the result; `None` there means the
    /// branch ends the instance.
    pub fn select<'a>(
        context: &Map<String, Value>,
        conditions: &'a [Condition],
    ) -> Result<&'a Condition, ConditionError> {
        let mut ordered: Vec<&Condition> = conditions.iter().filter(|c| !c.is_default).collect();
        ordered.sort_by_key(|c| c.sequence);

        if let Some(hit) = ordered.into_iter().find(|c| Self::matches(context, c)) {
            return Ok(hit);
        }

        conditions
            .iter()
            .filter(|c| c.is_default)
            .min_by_key(|c| c.sequence)
            .ok_or(ConditionError::NoMatchingBranch)
    }

    /// Whether `context[field] <operator> value` holds.
    ///
    /// A missing field compares as `null`.
    pub fn matches(context: &Map<String, Value>, condition: &Condition) -> bool {
        let actual = lookup_field(context, &condition.field).unwrap_or(&Value::Null);
        let expected = &condition.value;

        match condition.operator {
            ConditionOperator::Eq => loosely_equal(actual, expected),
            ConditionOperator::Ne => !loosely_equal(actual, expected),
            ConditionOperator::Gt => compare(actual, expected).is_some_and(|o| o.is_gt()),
            ConditionOperator::Gte => compare(actual, expected).is_some_and(|o| o.is_ge()),
            ConditionOperator::Lt => compare(actual, expected).is_some_and(|o| o.is_lt()),
            ConditionOperator::Lte => compare(actual, expected).is_some_and(|o| o.is_le()),
            ConditionOperator::Contains => contains(actual, expected),
            ConditionOperator::In => contains_member(expected, actual),
        }
    }
}

// ---------------------------------------------------------------------------
// Comparison helpers
// ---------------------------------------------------------------------------

/// Numeric view of a value. Numeric strings count ("42", " 3.5 ").
fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Equality with numeric and string coercion.
///
/// `1250` equals `"1250"` and `1250.0`; `true` equals `"true"`. Arrays and
/// objects compare structurally.
fn loosely_equal(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        return x == y;
    }
    match (a, b) {
        (Value::String(s), other) | (other, Value::String(s)) if is_scalar(other) => {
            *s == value_to_string(other)
        }
        _ => false,
    }
}

fn is_scalar(value: &Value) -> bool {
    matches!(value, Value::Bool(_) | Value::Number(_) | Value::Null)
}

/// Ordering for `>`/`<` operators: numeric when both sides are numeric,
/// lexicographic when both are strings, otherwise incomparable.
fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        return x.partial_cmp(&y);
    }
    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// `contains`: substring for strings, membership for arrays.
fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::String(s) => s.contains(&value_to_string(needle)),
        Value::Array(items) => items.iter().any(|item| loosely_equal(item, needle)),
        Value::Object(map) => needle.as_str().is_some_and(|key| map.contains_key(key)),
        _ => false,
    }
}

/// `in`: the field value is a member of the comparison list.
///
/// The list is an array, or a comma-separated string (`"EU, UK"`).
fn contains_member(list: &Value, member: &Value) -> bool {
    match list {
        Value::Array(items) => items.iter().any(|item| loosely_equal(item, member)),
        Value::String(s) => {
            let member = value_to_string(member);
            s.split(',').any(|part| part.trim() == member)
        }
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
