//! Step Conditions
//!
//! A step may carry a condition evaluated when it becomes ready. A false
//! condition records the step as skipped without calling its executor.
//!
//! ```yaml
//! condition:
//!   all:
//!     - { left: { path: classify.label }, operator: "==", right: urgent }
//!     - not: { left: { path: classify.score }, operator: "<", right: 0.5 }
//! ```

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::selector;

/// Comparison operators.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    #[serde(rename = "==", alias = "equals")]
    Equals,
    #[serde(rename = "!=", alias = "not_equals")]
    NotEquals,
    #[serde(rename = ">", alias = "greater_than")]
    GreaterThan,
    #[serde(rename = ">=", alias = "greater_than_or_equal")]
    GreaterOrEqual,
    #[serde(rename = "<", alias = "less_than")]
    LessThan,
    #[serde(rename = "<=", alias = "less_than_or_equal")]
    LessOrEqual,
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = "not_contains")]
    NotContains,
    #[serde(rename = "is_empty")]
    IsEmpty,
    #[serde(rename = "is_not_empty")]
    IsNotEmpty,
    #[serde(rename = "is_null")]
    IsNull,
    #[serde(rename = "is_not_null")]
    IsNotNull,
}

/// Either a reference into execution data or a literal value.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum Operand {
    Path { path: String },
    Literal(Value),
}

impl Default for Operand {
    fn default() -> Self {
        Self::Literal(Value::Null)
    }
}

impl Operand {
    fn resolve(&self, data: &Map<String, Value>, trigger: Option<&Value>) -> Value {
        match self {
            Self::Path { path } => selector::resolve(data, trigger, path)
                .cloned()
                .unwrap_or(Value::Null),
            Self::Literal(value) => value.clone(),
        }
    }
}

/// Boolean expression over execution data.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum Condition {
    All {
        all: Vec<Condition>,
    },
    Any {
        any: Vec<Condition>,
    },
    Not {
        not: Box<Condition>,
    },
    Compare {
        left: Operand,
        operator: Operator,
        #[serde(default)]
        right: Operand,
    },
}

impl Condition {
    /// Compares the value at `path` against a literal.
    pub fn compare(path: impl Into<String>, operator: Operator, right: Value) -> Self {
        Self::Compare {
            left: Operand::Path { path: path.into() },
            operator,
            right: Operand::Literal(right),
        }
    }

    /// Evaluates against `step_io_data`, with `trigger` as path fallback.
    pub fn evaluate(&self, data: &Map<String, Value>, trigger: Option<&Value>) -> bool {
        match self {
            Self::All { all } => all.iter().all(|c| c.evaluate(data, trigger)),
            Self::Any { any } => any.iter().any(|c| c.evaluate(data, trigger)),
            Self::Not { not } => !not.evaluate(data, trigger),
            Self::Compare {
                left,
                operator,
                right,
            } => {
                let left = left.resolve(data, trigger);
                let right = right.resolve(data, trigger);
                apply(*operator, &left, &right)
            }
        }
    }
}

fn apply(operator: Operator, left: &Value, right: &Value) -> bool {
    match operator {
        Operator::Equals => loosely_equal(left, right),
        Operator::NotEquals => !loosely_equal(left, right),
        Operator::GreaterThan => order(left, right) == Some(Ordering::Greater),
        Operator::GreaterOrEqual => matches!(
            order(left, right),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        Operator::LessThan => order(left, right) == Some(Ordering::Less),
        Operator::LessOrEqual => {
            matches!(order(left, right), Some(Ordering::Less | Ordering::Equal))
        }
        Operator::Contains => contains(left, right),
        Operator::NotContains => !contains(left, right),
        Operator::IsEmpty => is_empty(left),
        Operator::IsNotEmpty => !is_empty(left),
        Operator::IsNull => left.is_null(),
        Operator::IsNotNull => !left.is_null(),
    }
}

fn loosely_equal(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => left == right,
    }
}

fn order(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(_), Value::Number(_)) => left.as_f64()?.partial_cmp(&right.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match (haystack, needle) {
        (Value::String(s), Value::String(n)) => s.contains(n.as_str()),
        (Value::Array(items), _) => items.iter().any(|item| loosely_equal(item, needle)),
        (Value::Object(map), Value::String(key)) => map.contains_key(key),
        _ => false,
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}
