//! Trigger condition evaluation
//!
//! A trigger is a tree of conditions: `simple` leaves compare one sensor value
//! against a literal, `compound` nodes combine children with AND / OR.
//! `threshold` and `time` are accepted as aliases of `simple`; time conditions
//! key on the `clock.*` sensors the worker adds to every snapshot.
//!
//! Evaluation is pure and total. A missing sensor, a value that cannot be coerced
//! or a malformed range makes the leaf false; nothing here returns an error.

use crate::error::ConditionError;
use crate::sensors::SensorValues;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Deepest compound nesting accepted by [`Condition::validate`].
pub const MAX_DEPTH: usize = 8;

/// Comparison operator of a simple condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "<", alias = "lt")]
    Lt,
    #[serde(rename = "<=", alias = "lte")]
    Lte,
    #[serde(rename = ">", alias = "gt")]
    Gt,
    #[serde(rename = ">=", alias = "gte")]
    Gte,
    #[serde(rename = "==", alias = "eq")]
    Eq,
    #[serde(rename = "!=", alias = "ne")]
    Ne,
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = "between")]
    Between,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Lt => "<",
            Operator::Lte => "<=",
            Operator::Gt => ">",
            Operator::Gte => ">=",
            Operator::Eq => "==",
            Operator::Ne => "!=",
            Operator::Contains => "contains",
            Operator::Between => "between",
        }
    }

    fn is_ordering(&self) -> bool {
        matches!(self, Operator::Lt | Operator::Lte | Operator::Gt | Operator::Gte)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a compound node combines its children
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Logic {
    #[serde(rename = "AND", alias = "and")]
    And,
    #[serde(rename = "OR", alias = "or")]
    Or,
}

/// Trigger condition tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    #[serde(alias = "threshold", alias = "time")]
    Simple {
        sensor: String,
        operator: Operator,
        value: Value,
    },
    Compound {
        logic: Logic,
        #[serde(default)]
        children: Vec<Condition>,
    },
}

impl Condition {
    pub fn simple(sensor: impl Into<String>, operator: Operator, value: Value) -> Self {
        Condition::Simple {
            sensor: sensor.into(),
            operator,
            value,
        }
    }

    pub fn all(children: Vec<Condition>) -> Self {
        Condition::Compound {
            logic: Logic::And,
            children,
        }
    }

    pub fn any(children: Vec<Condition>) -> Self {
        Condition::Compound {
            logic: Logic::Or,
            children,
        }
    }

    /// Sensor keys referenced anywhere in the tree, in first-seen order
    pub fn sensors(&self) -> Vec<&str> {
        let mut keys = Vec::new();
        self.collect_sensors(&mut keys);
        keys
    }

    fn collect_sensors<'a>(&'a self, keys: &mut Vec<&'a str>) {
        match self {
            Condition::Simple { sensor, .. } => {
                if !keys.contains(&sensor.as_str()) {
                    keys.push(sensor.as_str());
                }
            }
            Condition::Compound { children, .. } => {
                for child in children {
                    child.collect_sensors(keys);
                }
            }
        }
    }

    /// Check the tree is well-typed enough to persist.
    pub fn validate(&self) -> Result<(), ConditionError> {
        self.validate_at(1)
    }

    fn validate_at(&self, depth: usize) -> Result<(), ConditionError> {
        if depth > MAX_DEPTH {
            return Err(ConditionError::TooDeep { max: MAX_DEPTH });
        }
        match self {
            Condition::Simple {
                sensor,
                operator,
                value,
            } => {
                if sensor.trim().is_empty() {
                    return Err(ConditionError::EmptySensor);
                }
                if operator.is_ordering() && as_number(value).is_none() {
                    return Err(ConditionError::NonNumericValue {
                        sensor: sensor.clone(),
                        operator: operator.to_string(),
                    });
                }
                if *operator == Operator::Between {
                    match range(value) {
                        Some((lo, hi)) if lo <= hi => {}
                        _ => {
                            return Err(ConditionError::InvalidRange {
                                sensor: sensor.clone(),
                            })
                        }
                    }
                }
                Ok(())
            }
            Condition::Compound { children, .. } => {
                for child in children {
                    child.validate_at(depth + 1)?;
                }
                Ok(())
            }
        }
    }
}

/// One leaf visited during evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionCheck {
    pub sensor: String,
    pub operator: Operator,
    pub expected: Value,
    pub actual: Option<Value>,
    pub passed: bool,
}

/// Outcome of evaluating a trigger, with the leaves that decided it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvaluation {
    pub matched: bool,
    pub checks: Vec<ConditionCheck>,
    /// Sensor keys that were referenced but absent from the snapshot
    pub missing: Vec<String>,
}

impl TriggerEvaluation {
    /// Short human-readable summary, used in execution log rows
    pub fn summary(&self) -> String {
        let parts: Vec<String> = self
            .checks
            .iter()
            .map(|c| {
                let actual = c
                    .actual
                    .as_ref()
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "missing".to_string());
                format!(
                    "{} {} {} (actual {}) => {}",
                    c.sensor, c.operator, c.expected, actual, c.passed
                )
            })
            .collect();
        parts.join("; ")
    }
}

/// Evaluate a trigger against a snapshot.
pub fn evaluate(condition: &Condition, values: &SensorValues) -> bool {
    let mut checks = Vec::new();
    walk(condition, values, &mut checks, false)
}

/// Evaluate and keep the diagnostic detail.
pub fn explain(condition: &Condition, values: &SensorValues) -> TriggerEvaluation {
    let mut checks = Vec::new();
    let matched = walk(condition, values, &mut checks, true);
    let mut missing: Vec<String> = Vec::new();
    for check in &checks {
        if check.actual.is_none() && !missing.contains(&check.sensor) {
            missing.push(check.sensor.clone());
        }
    }
    TriggerEvaluation {
        matched,
        checks,
        missing,
    }
}

fn walk(
    condition: &Condition,
    values: &SensorValues,
    checks: &mut Vec<ConditionCheck>,
    record: bool,
) -> bool {
    match condition {
        Condition::Simple {
            sensor,
            operator,
            value,
        } => {
            let actual = values.get(sensor);
            let passed = actual
                .map(|actual| compare(*operator, actual, value))
                .unwrap_or(false);
            if record {
                checks.push(ConditionCheck {
                    sensor: sensor.clone(),
                    operator: *operator,
                    expected: value.clone(),
                    actual: actual.cloned(),
                    passed,
                });
            }
            passed
        }
        // all()/any() short-circuit and give the identity element for empty lists
        Condition::Compound { logic, children } => match logic {
            Logic::And => children
                .iter()
                .all(|child| walk(child, values, checks, record)),
            Logic::Or => children
                .iter()
                .any(|child| walk(child, values, checks, record)),
        },
    }
}

fn compare(operator: Operator, actual: &Value, expected: &Value) -> bool {
    match operator {
        Operator::Lt => numeric(actual, expected, |a, b| a < b),
        Operator::Lte => numeric(actual, expected, |a, b| a <= b),
        Operator::Gt => numeric(actual, expected, |a, b| a > b),
        Operator::Gte => numeric(actual, expected, |a, b| a >= b),
        Operator::Eq => loose_eq(actual, expected),
        Operator::Ne => !loose_eq(actual, expected),
        Operator::Contains => contains(actual, expected),
        Operator::Between => match (as_number(actual), range(expected)) {
            (Some(x), Some((lo, hi))) => lo <= x && x <= hi,
            _ => false,
        },
    }
}

fn numeric(actual: &Value, expected: &Value, op: impl Fn(f64, f64) -> bool) -> bool {
    match (as_number(actual), as_number(expected)) {
        (Some(a), Some(b)) => op(a, b),
        _ => false,
    }
}

/// Coerce a JSON value to a finite number.
fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return None;
            }
            trimmed.parse::<f64>().ok().filter(|f| f.is_finite())
        }
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    if a.is_number() || b.is_number() {
        if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
            return x == y;
        }
    }
    a == b
}

fn contains(actual: &Value, expected: &Value) -> bool {
    match actual {
        Value::String(haystack) => expected
            .as_str()
            .map(|needle| haystack.contains(needle))
            .unwrap_or(false),
        Value::Array(items) => items.iter().any(|item| loose_eq(item, expected)),
        _ => false,
    }
}

fn range(value: &Value) -> Option<(f64, f64)> {
    match value.as_array() {
        Some(bounds) if bounds.len() == 2 => {
            Some((as_number(&bounds[0])?, as_number(&bounds[1])?))
        }
        _ => None,
    }
}
