//! Query translation
//!
//! Turns a portable request (where clause plus sort/skip/limit/keys/include
//! options) into the engine's [`NativeQuery`].
//!
//! Lowering rules:
//! - `$ne` becomes `Not(Eq)`, `$in` a disjunction of equalities, `$nin` its
//!   negation
//! - `$exists: true` becomes `Not(IsNull)`, `$exists: false` `IsNull`
//! - `$all` becomes `Contains`

use crate::error::{ParcelError, ParcelResult};
use crate::query_filter::{CompareOp, Filter};
use crate::query_native::{CmpOp, NativeQuery, Predicate, SortKey};
use serde_json::{Map, Value};

/// Options of a query request, as received from the routing layer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOptions {
    /// Raw where clause
    pub filter: Value,
    /// Comma-separated sort keys (`-name` or `name desc` for descending)
    pub sort: Option<String>,
    pub skip: Option<usize>,
    pub limit: Option<usize>,
    /// Comma-separated attributes to return
    pub projection: Option<String>,
    /// Comma-separated pointer paths to resolve
    pub include: Option<String>,
    /// Also return the total number of matches
    pub count: bool,
}

impl QueryOptions {
    pub fn new() -> Self {
        QueryOptions::default()
    }

    pub fn filter(mut self, filter: Value) -> Self {
        self.filter = filter;
        self
    }

    pub fn sort(mut self, sort: impl Into<String>) -> Self {
        self.sort = Some(sort.into());
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn projection(mut self, keys: impl Into<String>) -> Self {
        self.projection = Some(keys.into());
        self
    }

    pub fn include(mut self, paths: impl Into<String>) -> Self {
        self.include = Some(paths.into());
        self
    }

    pub fn with_count(mut self) -> Self {
        self.count = true;
        self
    }

    /// Parse the raw option map (`where`, `order`, `skip`, `limit`, `keys`,
    /// `include`, `count`). `where` may be an object or a JSON string;
    /// numbers may be sent as strings.
    pub fn from_json(raw: &Value) -> ParcelResult<Self> {
        let map = match raw {
            Value::Null => return Ok(QueryOptions::default()),
            Value::Object(map) => map,
            other => {
                return Err(ParcelError::InvalidQuery(format!(
                    "query options must be an object, got {other}"
                )))
            }
        };

        let filter = match map.get("where") {
            Some(Value::String(text)) => serde_json::from_str(text)
                .map_err(|e| ParcelError::InvalidQuery(format!("where is not valid JSON: {e}")))?,
            Some(other) => other.clone(),
            None => Value::Null,
        };

        Ok(QueryOptions {
            filter,
            sort: string_option(map, &["order", "sort"])?,
            skip: count_option(map, "skip")?,
            limit: count_option(map, "limit")?,
            projection: string_option(map, &["keys", "projection"])?,
            include: string_option(map, &["include"])?,
            count: match map.get("count") {
                None | Some(Value::Null) => false,
                Some(Value::Bool(flag)) => *flag,
                Some(Value::Number(n)) => n.as_f64().is_some_and(|n| n != 0.0),
                Some(Value::String(s)) => !matches!(s.trim(), "" | "0" | "false"),
                Some(other) => {
                    return Err(ParcelError::InvalidQuery(format!("invalid count flag: {other}")))
                }
            },
        })
    }

    /// Parsed sort keys
    pub fn sort_keys(&self) -> ParcelResult<Vec<SortKey>> {
        parse_sort(self.sort.as_deref())
    }

    /// Include paths, each split into segments
    pub fn include_paths(&self) -> Vec<Vec<String>> {
        split_list(self.include.as_deref())
            .into_iter()
            .map(|path| path.split('.').map(str::to_string).collect())
            .collect()
    }
}

/// Translate a where clause plus options into a native query.
pub fn translate(filter: &Value, options: &QueryOptions) -> ParcelResult<NativeQuery> {
    let parsed = Filter::parse(filter)?;
    Ok(NativeQuery {
        predicate: lower(&parsed),
        sort: options.sort_keys()?,
        skip: options.skip.unwrap_or(0),
        limit: options.limit,
        projection: options
            .projection
            .as_deref()
            .map(|keys| split_list(Some(keys)).into_iter().map(str::to_string).collect()),
    })
}

/// Lower a filter tree into the engine's predicate language.
pub fn lower(filter: &Filter) -> Predicate {
    match filter {
        Filter::Equals { path, value } => Predicate::Eq {
            path: path.clone(),
            value: value.clone(),
        },
        Filter::Compare {
            path,
            op: CompareOp::Ne,
            value,
        } => Predicate::Not(Box::new(Predicate::Eq {
            path: path.clone(),
            value: value.clone(),
        })),
        Filter::Compare { path, op, value } => Predicate::Cmp {
            path: path.clone(),
            op: match op {
                CompareOp::Lt => CmpOp::Lt,
                CompareOp::Lte => CmpOp::Lte,
                CompareOp::Gt => CmpOp::Gt,
                // Ne is handled above
                CompareOp::Gte | CompareOp::Ne => CmpOp::Gte,
            },
            value: value.clone(),
        },
        Filter::In { path, values } => any_of(path, values),
        Filter::NotIn { path, values } => Predicate::Not(Box::new(any_of(path, values))),
        Filter::Exists { path, exists } => {
            let is_null = Predicate::IsNull { path: path.clone() };
            if *exists {
                Predicate::Not(Box::new(is_null))
            } else {
                is_null
            }
        }
        Filter::All { path, values } => Predicate::Contains {
            path: path.clone(),
            values: values.clone(),
        },
        Filter::And(parts) if parts.is_empty() => Predicate::True,
        Filter::And(parts) => Predicate::And(parts.iter().map(lower).collect()),
        Filter::Or(parts) => Predicate::Or(parts.iter().map(lower).collect()),
    }
}

fn any_of(path: &str, values: &[Value]) -> Predicate {
    Predicate::Or(
        values
            .iter()
            .map(|value| Predicate::Eq {
                path: path.to_string(),
                value: value.clone(),
            })
            .collect(),
    )
}

fn parse_sort(sort: Option<&str>) -> ParcelResult<Vec<SortKey>> {
    split_list(sort)
        .into_iter()
        .map(|item| {
            let mut words = item.split_whitespace();
            let field = words.next().unwrap_or_default();
            let direction = words.next().map(str::to_ascii_lowercase);
            if words.next().is_some() {
                return Err(ParcelError::InvalidQuery(format!("invalid sort key '{item}'")));
            }

            let (path, negated) = match field.strip_prefix('-') {
                Some(rest) => (rest, true),
                None => (field, false),
            };
            let descending = match direction.as_deref() {
                None | Some("asc") => negated,
                Some("desc") => !negated,
                Some(other) => {
                    return Err(ParcelError::InvalidQuery(format!(
                        "invalid sort direction '{other}'"
                    )))
                }
            };
            if path.is_empty() {
                return Err(ParcelError::InvalidQuery(format!("invalid sort key '{item}'")));
            }
            Ok(SortKey {
                path: path.to_string(),
                descending,
            })
        })
        .collect()
}

fn split_list(list: Option<&str>) -> Vec<&str> {
    list.map(|s| s.split(',').map(str::trim).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default()
}

fn string_option(map: &Map<String, Value>, names: &[&str]) -> ParcelResult<Option<String>> {
    for name in names {
        match map.get(*name) {
            None | Some(Value::Null) => continue,
            Some(Value::String(s)) => return Ok(Some(s.clone())),
            Some(Value::Array(items)) => {
                let parts: Option<Vec<&str>> = items.iter().map(Value::as_str).collect();
                return parts
                    .map(|p| Some(p.join(",")))
                    .ok_or_else(|| ParcelError::InvalidQuery(format!("invalid {name} option")));
            }
            Some(other) => {
                return Err(ParcelError::InvalidQuery(format!("invalid {name} option: {other}")))
            }
        }
    }
    Ok(None)
}

fn count_option(map: &Map<String, Value>, name: &str) -> ParcelResult<Option<usize>> {
    let invalid = || ParcelError::InvalidQuery(format!("{name} must be a non-negative integer"));
    match map.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n.as_u64().map(|n| Some(n as usize)).ok_or_else(invalid),
        Some(Value::String(s)) => s.trim().parse::<usize>().map(Some).map_err(|_| invalid()),
        Some(_) => Err(invalid()),
    }
}
