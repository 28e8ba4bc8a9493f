//! Portable filter expressions
//!
//! Parses the JSON "where" clause into a tagged expression tree. The parser
//! is strict: unknown or unsupported operators are errors, never skipped.
//!
//! ```text
//! {"age": {"$gte": 18, "$lt": 65}, "name": "Ann"}
//! {"$or": [{"age": {"$lt": 18}}, {"age": {"$gte": 65}}]}
//! ```

use crate::error::{ParcelError, ParcelResult};
use crate::types::normalize_value;
use serde_json::{Map, Value};

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Lt,
    Lte,
    Gt,
    Gte,
    Ne,
}

/// Operators that exist in the portable language but are not served here
const UNSUPPORTED_OPERATORS: [&str; 7] = [
    "$select",
    "$dontSelect",
    "$regex",
    "$options",
    "$inQuery",
    "$notInQuery",
    "$relatedTo",
];

/// Filter expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Equals { path: String, value: Value },
    Compare { path: String, op: CompareOp, value: Value },
    In { path: String, values: Vec<Value> },
    NotIn { path: String, values: Vec<Value> },
    Exists { path: String, exists: bool },
    All { path: String, values: Vec<Value> },
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    /// Filter matching everything
    pub fn empty() -> Self {
        Filter::And(Vec::new())
    }

    /// Parse a where clause. `null` is the empty filter.
    pub fn parse(value: &Value) -> ParcelResult<Self> {
        match value {
            Value::Null => Ok(Filter::empty()),
            Value::Object(map) => parse_object(map),
            other => Err(ParcelError::InvalidQuery(format!(
                "where clause must be an object, got {other}"
            ))),
        }
    }

    /// Attribute paths referenced anywhere in the tree
    pub fn paths(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_paths(&mut out);
        out
    }

    fn collect_paths<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Filter::Equals { path, .. }
            | Filter::Compare { path, .. }
            | Filter::In { path, .. }
            | Filter::NotIn { path, .. }
            | Filter::Exists { path, .. }
            | Filter::All { path, .. } => out.push(path),
            Filter::And(parts) | Filter::Or(parts) => {
                for part in parts {
                    part.collect_paths(out);
                }
            }
        }
    }
}

fn parse_object(map: &Map<String, Value>) -> ParcelResult<Filter> {
    let mut clauses = Vec::with_capacity(map.len());

    for (key, value) in map {
        match key.as_str() {
            "$or" => clauses.push(Filter::Or(parse_branches(key, value)?)),
            "$and" => clauses.push(Filter::And(parse_branches(key, value)?)),
            op if op.starts_with('$') => return Err(operator_error(op)),
            path => clauses.extend(parse_constraint(path, value)?),
        }
    }

    Ok(match clauses.len() {
        1 => clauses.remove(0),
        _ => Filter::And(clauses),
    })
}

fn parse_branches(op: &str, value: &Value) -> ParcelResult<Vec<Filter>> {
    let branches = value
        .as_array()
        .ok_or_else(|| ParcelError::InvalidQuery(format!("{op} expects an array of filters")))?;
    if branches.is_empty() {
        return Err(ParcelError::InvalidQuery(format!("{op} expects at least one filter")));
    }
    branches
        .iter()
        .map(|branch| match branch {
            Value::Object(map) => parse_object(map),
            other => Err(ParcelError::InvalidQuery(format!(
                "{op} branch must be an object, got {other}"
            ))),
        })
        .collect()
}

/// Parse the constraint attached to one attribute path.
fn parse_constraint(path: &str, value: &Value) -> ParcelResult<Vec<Filter>> {
    let operators = match value {
        Value::Object(map) if is_operator_object(map)? => map,
        literal => {
            return Ok(vec![Filter::Equals {
                path: path.to_string(),
                value: normalize_value(literal.clone()),
            }])
        }
    };

    let mut filters = Vec::with_capacity(operators.len());
    for (op, operand) in operators {
        let path = path.to_string();
        let filter = match op.as_str() {
            "$lt" => compare(path, CompareOp::Lt, operand),
            "$lte" => compare(path, CompareOp::Lte, operand),
            "$gt" => compare(path, CompareOp::Gt, operand),
            "$gte" => compare(path, CompareOp::Gte, operand),
            "$ne" => compare(path, CompareOp::Ne, operand),
            "$in" => Filter::In {
                path,
                values: list_operand(op, operand)?,
            },
            "$nin" => Filter::NotIn {
                path,
                values: list_operand(op, operand)?,
            },
            "$all" => Filter::All {
                path,
                values: list_operand(op, operand)?,
            },
            "$exists" => Filter::Exists {
                path,
                exists: operand.as_bool().ok_or_else(|| {
                    ParcelError::InvalidQuery("$exists expects a boolean".into())
                })?,
            },
            other => return Err(operator_error(other)),
        };
        filters.push(filter);
    }
    Ok(filters)
}

/// An object is an operator object when all its keys are operators.
/// Typed literals (`__type`) and plain embedded objects are values.
fn is_operator_object(map: &Map<String, Value>) -> ParcelResult<bool> {
    if map.contains_key("__type") || map.is_empty() {
        return Ok(false);
    }
    let operator_keys = map.keys().filter(|k| k.starts_with('$')).count();
    match operator_keys {
        0 => Ok(false),
        n if n == map.len() => Ok(true),
        _ => Err(ParcelError::InvalidQuery(
            "cannot mix operators and attributes in one constraint".into(),
        )),
    }
}

fn compare(path: String, op: CompareOp, operand: &Value) -> Filter {
    Filter::Compare {
        path,
        op,
        value: normalize_value(operand.clone()),
    }
}

fn list_operand(op: &str, operand: &Value) -> ParcelResult<Vec<Value>> {
    match operand {
        Value::Array(items) => Ok(items.iter().cloned().map(normalize_value).collect()),
        other => Err(ParcelError::InvalidQuery(format!(
            "{op} expects an array, got {other}"
        ))),
    }
}

fn operator_error(op: &str) -> ParcelError {
    if UNSUPPORTED_OPERATORS.contains(&op) {
        ParcelError::UnsupportedOperator(op.to_string())
    } else {
        ParcelError::UnsupportedOperator(format!("{op} (unknown operator)"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_literal_equality() {
        let filter = Filter::parse(&json!({"name": "Ann"})).unwrap();
        assert_eq!(
            filter,
            Filter::Equals {
                path: "name".into(),
                value: json!("Ann")
            }
        );
    }

    #[test]
    fn test_range() {
        let filter = Filter::parse(&json!({"age": {"$gte": 18, "$lt": 65}})).unwrap();
        let Filter::And(parts) = filter else {
            panic!("expected conjunction");
        };
        assert_eq!(parts.len(), 2);
        assert!(parts.contains(&Filter::Compare {
            path: "age".into(),
            op: CompareOp::Gte,
            value: json!(18)
        }));
    }

    #[test]
    fn test_or_branches() {
        let filter = Filter::parse(&json!({
            "$or": [{"age": {"$lt": 18}}, {"age": {"$gte": 65}}]
        }))
        .unwrap();
        assert!(matches!(filter, Filter::Or(ref b) if b.len() == 2));
        assert_eq!(filter.paths(), vec!["age", "age"]);
    }

    #[test]
    fn test_unsupported_operators_are_rejected() {
        for op in ["$regex", "$select", "$dontSelect", "$inQuery", "$notInQuery"] {
            let err = Filter::parse(&json!({"name": { op: "x" }})).unwrap_err();
            assert!(matches!(err, ParcelError::UnsupportedOperator(_)), "{op}");
        }
        let err = Filter::parse(&json!({"$relatedTo": {"key": "likes"}})).unwrap_err();
        assert!(matches!(err, ParcelError::UnsupportedOperator(_)));
        let err = Filter::parse(&json!({"age": {"$near": 1}})).unwrap_err();
        assert!(matches!(err, ParcelError::UnsupportedOperator(_)));
    }

    #[test]
    fn test_malformed_operands() {
        assert!(matches!(
            Filter::parse(&json!({"tags": {"$in": "red"}})),
            Err(ParcelError::InvalidQuery(_))
        ));
        assert!(matches!(
            Filter::parse(&json!({"tags": {"$exists": "yes"}})),
            Err(ParcelError::InvalidQuery(_))
        ));
        assert!(matches!(
            Filter::parse(&json!({"$or": []})),
            Err(ParcelError::InvalidQuery(_))
        ));
        assert!(matches!(
            Filter::parse(&json!({"a": {"$gt": 1, "b": 2}})),
            Err(ParcelError::InvalidQuery(_))
        ));
        assert!(Filter::parse(&json!([1, 2])).is_err());
    }

    #[test]
    fn test_typed_literals() {
        let filter = Filter::parse(&json!({
            "owner": {"__type": "Pointer", "className": "_User", "objectId": "u1"}
        }))
        .unwrap();
        assert_eq!(
            filter,
            Filter::Equals {
                path: "owner".into(),
                value: json!("u1")
            }
        );
    }

    #[test]
    fn test_embedded_object_literal() {
        let filter = Filter::parse(&json!({"address": {"city": "Lyon"}})).unwrap();
        assert!(matches!(filter, Filter::Equals { .. }));
        assert_eq!(Filter::parse(&Value::Null).unwrap(), Filter::empty());
    }
}
