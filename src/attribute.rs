//! Attribute type resolution
//!
//! Class rows describe their attributes with portable descriptors (a tag
//! string, an options object, a reference object, an array or a nested
//! record). They are resolved once, when the class is loaded, into a closed
//! set of `AttributeType` variants.

use crate::error::{ParcelError, ParcelResult};
use chrono::DateTime;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Storage-level type of an attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeType {
    String,
    Email,
    Number,
    Boolean,
    Date,
    Json,
    /// Foreign key to one object, optionally restricted to a class
    Pointer(Option<String>),
    /// List of foreign keys into a class
    Relation(String),
    Array(Box<AttributeType>),
    Nested(BTreeMap<String, AttributeType>),
}

impl AttributeType {
    /// Check a JSON value against this type. `null` is always accepted.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (AttributeType::String, Value::String(_)) => true,
            (AttributeType::Email, Value::String(s)) => is_email(s),
            (AttributeType::Number, Value::Number(_)) => true,
            (AttributeType::Boolean, Value::Bool(_)) => true,
            (AttributeType::Date, Value::String(s)) => DateTime::parse_from_rfc3339(s).is_ok(),
            (AttributeType::Json, _) => true,
            (AttributeType::Pointer(_), Value::String(_)) => true,
            (AttributeType::Relation(_), Value::Array(items)) => items.iter().all(Value::is_string),
            (AttributeType::Array(inner), Value::Array(items)) => {
                items.iter().all(|item| inner.accepts(item))
            }
            (AttributeType::Nested(fields), Value::Object(map)) => fields
                .iter()
                .all(|(name, ty)| map.get(name).map_or(true, |v| ty.accepts(v))),
            _ => false,
        }
    }

    /// Type name for error messages
    pub fn name(&self) -> String {
        match self {
            AttributeType::String => "string".to_string(),
            AttributeType::Email => "email".to_string(),
            AttributeType::Number => "number".to_string(),
            AttributeType::Boolean => "boolean".to_string(),
            AttributeType::Date => "date".to_string(),
            AttributeType::Json => "json".to_string(),
            AttributeType::Pointer(Some(class)) => format!("pointer<{class}>"),
            AttributeType::Pointer(None) => "pointer".to_string(),
            AttributeType::Relation(class) => format!("relation<{class}>"),
            AttributeType::Array(inner) => format!("array<{}>", inner.name()),
            AttributeType::Nested(_) => "object".to_string(),
        }
    }

    /// Target class when values of this type reference other objects.
    pub fn target_class(&self) -> Option<&str> {
        match self {
            AttributeType::Pointer(target) => target.as_deref(),
            AttributeType::Relation(target) => Some(target),
            _ => None,
        }
    }
}

/// Resolve a descriptor into a type.
pub fn resolve(descriptor: &Value) -> ParcelResult<AttributeType> {
    match descriptor {
        Value::String(tag) => resolve_tag(tag, None),
        Value::Array(items) => match items.as_slice() {
            [] => Ok(AttributeType::Array(Box::new(AttributeType::Json))),
            [inner] => Ok(AttributeType::Array(Box::new(resolve(inner)?))),
            _ => Err(ParcelError::InvalidClass(
                "array descriptor takes exactly one element type".into(),
            )),
        },
        Value::Object(map) => resolve_object(map),
        other => Err(ParcelError::UnknownType(other.to_string())),
    }
}

fn resolve_object(map: &Map<String, Value>) -> ParcelResult<AttributeType> {
    if let Some(target) = map.get("model") {
        return Ok(AttributeType::Pointer(Some(class_ref(target)?)));
    }
    if let Some(target) = map.get("collection") {
        return Ok(AttributeType::Relation(class_ref(target)?));
    }
    match map.get("type") {
        Some(Value::String(tag)) => resolve_tag(tag, Some(map)),
        Some(other) => Err(ParcelError::UnknownType(other.to_string())),
        None => map
            .iter()
            .map(|(name, inner)| Ok((name.clone(), resolve(inner)?)))
            .collect::<ParcelResult<BTreeMap<_, _>>>()
            .map(AttributeType::Nested),
    }
}

fn resolve_tag(tag: &str, options: Option<&Map<String, Value>>) -> ParcelResult<AttributeType> {
    let ty = match tag.to_ascii_lowercase().as_str() {
        "string" | "text" => AttributeType::String,
        "email" => AttributeType::Email,
        "number" | "integer" | "float" => AttributeType::Number,
        "boolean" | "bool" => AttributeType::Boolean,
        "date" | "datetime" => AttributeType::Date,
        "json" | "mixed" | "object" => AttributeType::Json,
        "array" => {
            let inner = match options.and_then(|o| o.get("items")) {
                Some(items) => resolve(items)?,
                None => AttributeType::Json,
            };
            AttributeType::Array(Box::new(inner))
        }
        "pointer" => {
            let target = options
                .and_then(|o| o.get("targetClass"))
                .map(class_ref)
                .transpose()?;
            AttributeType::Pointer(target)
        }
        _ => return Err(ParcelError::UnknownType(tag.to_string())),
    };
    Ok(ty)
}

fn class_ref(value: &Value) -> ParcelResult<String> {
    match value.as_str() {
        Some(name) if !name.is_empty() => Ok(name.to_string()),
        _ => Err(ParcelError::InvalidClass(format!("invalid class reference: {value}"))),
    }
}

fn is_email(s: &str) -> bool {
    match s.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.') && !domain.starts_with('.'),
        None => false,
    }
}
