//! Native query form
//!
//! The criteria language the storage engines evaluate: a small predicate
//! tree plus sort, skip, limit and projection. Engines scan a collection and
//! hand the records to [`NativeQuery::execute`], so every engine shares the
//! same matching and ordering semantics.

use crate::types::Object;
use serde_json::{Number, Value};
use std::cmp::Ordering;

/// Ordering comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Lte,
    Gt,
    Gte,
}

/// Engine-level predicate
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Matches every record
    True,
    /// Path equals value (or, for arrays, contains it)
    Eq { path: String, value: Value },
    Cmp { path: String, op: CmpOp, value: Value },
    /// Path is absent or null
    IsNull { path: String },
    /// Array at path contains every value
    Contains { path: String, values: Vec<Value> },
    Not(Box<Predicate>),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
}

impl Predicate {
    pub fn matches(&self, object: &Object) -> bool {
        match self {
            Predicate::True => true,
            Predicate::Eq { path, value } => match object.lookup(path) {
                Some(Value::Array(items)) if !value.is_array() => {
                    items.iter().any(|item| values_equal(item, value))
                }
                Some(actual) => values_equal(&actual, value),
                None => value.is_null(),
            },
            Predicate::Cmp { path, op, value } => object
                .lookup(path)
                .and_then(|actual| compare_values(&actual, value))
                .map_or(false, |ord| match op {
                    CmpOp::Lt => ord == Ordering::Less,
                    CmpOp::Lte => ord != Ordering::Greater,
                    CmpOp::Gt => ord == Ordering::Greater,
                    CmpOp::Gte => ord != Ordering::Less,
                }),
            Predicate::IsNull { path } => object.lookup(path).map_or(true, |v| v.is_null()),
            Predicate::Contains { path, values } => match object.lookup(path) {
                Some(Value::Array(items)) => values
                    .iter()
                    .all(|wanted| items.iter().any(|item| values_equal(item, wanted))),
                _ => false,
            },
            Predicate::Not(inner) => !inner.matches(object),
            Predicate::And(parts) => parts.iter().all(|p| p.matches(object)),
            Predicate::Or(parts) => parts.iter().any(|p| p.matches(object)),
        }
    }
}

/// Sort key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub path: String,
    pub descending: bool,
}

/// Query in the engine's native form
#[derive(Debug, Clone, PartialEq)]
pub struct NativeQuery {
    pub predicate: Predicate,
    pub sort: Vec<SortKey>,
    pub skip: usize,
    pub limit: Option<usize>,
    /// Attributes to keep; system fields are always kept
    pub projection: Option<Vec<String>>,
}

impl NativeQuery {
    pub fn all() -> Self {
        NativeQuery {
            predicate: Predicate::True,
            sort: Vec::new(),
            skip: 0,
            limit: None,
            projection: None,
        }
    }

    /// Filter, order, page and project a scanned collection.
    pub fn execute<I>(&self, records: I) -> Vec<Object>
    where
        I: IntoIterator<Item = Object>,
    {
        let mut matched: Vec<Object> = records
            .into_iter()
            .filter(|o| self.predicate.matches(o))
            .collect();

        // Creation order first, so explicit sort keys are stable on top of it
        matched.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        if !self.sort.is_empty() {
            matched.sort_by(|a, b| {
                self.sort
                    .iter()
                    .map(|key| {
                        let ord = total_order(a.lookup(&key.path).as_ref(), b.lookup(&key.path).as_ref());
                        if key.descending {
                            ord.reverse()
                        } else {
                            ord
                        }
                    })
                    .find(|ord| *ord != Ordering::Equal)
                    .unwrap_or(Ordering::Equal)
            });
        }

        let page = matched
            .into_iter()
            .skip(self.skip)
            .take(self.limit.unwrap_or(usize::MAX));

        match &self.projection {
            Some(keys) => page
                .map(|mut o| {
                    o.attributes.retain(|name, _| keys.iter().any(|k| k == name));
                    o
                })
                .collect(),
            None => page.collect(),
        }
    }
}

/// Equality with numeric coercion (`1 == 1.0`)
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => compare_numbers(x, y) == Some(Ordering::Equal),
        _ => a == b,
    }
}

fn as_integer(n: &Number) -> Option<i128> {
    n.as_i64().map(i128::from).or_else(|| n.as_u64().map(i128::from))
}

/// Integers compare exactly; floats only when one side is a float
fn compare_numbers(x: &Number, y: &Number) -> Option<Ordering> {
    match (as_integer(x), as_integer(y)) {
        (Some(x), Some(y)) => Some(x.cmp(&y)),
        _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
    }
}

/// Ordering between comparable values (numbers, strings, booleans)
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => compare_numbers(x, y),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn type_rank(value: Option<&Value>) -> u8 {
    match value {
        None | Some(Value::Null) => 0,
        Some(Value::Bool(_)) => 1,
        Some(Value::Number(_)) => 2,
        Some(Value::String(_)) => 3,
        Some(Value::Array(_)) => 4,
        Some(Value::Object(_)) => 5,
    }
}

/// Total order used for sorting: missing < bool < number < string < array < object
fn total_order(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => compare_values(x, y)
            .unwrap_or_else(|| type_rank(a).cmp(&type_rank(b))),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}
