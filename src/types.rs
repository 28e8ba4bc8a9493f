//! Core type definitions for the object store

use crate::acl::Acl;
use chrono::{DateTime, SecondsFormat, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Meta-class whose rows describe every other class
pub const META_CLASS: &str = "__Class";

/// Built-in user class
pub const USER_CLASS: &str = "_User";

/// Built-in role class
pub const ROLE_CLASS: &str = "_Role";

/// Class names that cannot be created or removed by ordinary callers
pub const RESERVED_CLASSES: [&str; 3] = [META_CLASS, USER_CLASS, ROLE_CLASS];

/// Attribute names owned by the store itself
pub const SYSTEM_ATTRIBUTES: [&str; 6] = ["id", "objectId", "createdAt", "updatedAt", "acl", "ACL"];

const OBJECT_ID_LEN: usize = 10;

/// Attribute map of an object (JSON-compatible values)
pub type Attributes = Map<String, Value>;

/// Unique identifier for objects, assigned by the storage engine
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(String);

impl ObjectId {
    pub fn new(id: impl Into<String>) -> Self {
        ObjectId(id.into())
    }

    /// Random alphanumeric identifier
    pub fn generate() -> Self {
        let id: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(OBJECT_ID_LEN)
            .map(char::from)
            .collect();
        ObjectId(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectId {
    fn from(id: &str) -> Self {
        ObjectId(id.to_string())
    }
}

/// A stored instance of a class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object {
    pub id: ObjectId,
    pub class_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acl: Option<Acl>,
    pub attributes: Attributes,
}

impl Object {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).and_then(Value::as_str)
    }

    /// Resolve a dotted attribute path, including the system fields.
    pub fn lookup(&self, path: &str) -> Option<Value> {
        match path {
            "id" | "objectId" => return Some(Value::String(self.id.to_string())),
            "createdAt" => return Some(Value::String(format_timestamp(&self.created_at))),
            "updatedAt" => return Some(Value::String(format_timestamp(&self.updated_at))),
            _ => {}
        }

        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.attributes.get(first)?;
        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                _ => return None,
            };
        }
        Some(current.clone())
    }

    /// Apply a patch and refresh `updated_at`.
    ///
    /// `updated_at` never moves backwards, even if the wall clock does.
    pub fn apply(&mut self, patch: ObjectPatch) {
        for (key, value) in patch.set {
            self.attributes.insert(key, value);
        }
        for key in &patch.unset {
            self.attributes.remove(key);
        }
        if let Some(acl) = patch.acl {
            self.acl = Some(acl);
        }
        self.updated_at = Utc::now().max(self.updated_at);
    }

    /// Outward JSON representation, hiding the given attributes.
    pub fn to_public_json(&self, hidden: &[&str]) -> Value {
        let mut out = Map::new();
        out.insert("objectId".into(), Value::String(self.id.to_string()));
        out.insert("createdAt".into(), Value::String(format_timestamp(&self.created_at)));
        out.insert("updatedAt".into(), Value::String(format_timestamp(&self.updated_at)));
        if let Some(acl) = &self.acl {
            out.insert("acl".into(), serde_json::to_value(acl).unwrap_or(Value::Null));
        }
        for (key, value) in &self.attributes {
            if !hidden.contains(&key.as_str()) {
                out.insert(key.clone(), value.clone());
            }
        }
        Value::Object(out)
    }
}

/// Data for a new object; id and timestamps come from the engine
#[derive(Debug, Clone, Default)]
pub struct NewObject {
    pub class_name: String,
    pub attributes: Attributes,
    pub acl: Option<Acl>,
}

impl NewObject {
    /// Materialize with a fresh id and `created_at == updated_at`.
    pub fn into_object(self) -> Object {
        let now = Utc::now();
        Object {
            id: ObjectId::generate(),
            class_name: self.class_name,
            created_at: now,
            updated_at: now,
            acl: self.acl,
            attributes: self.attributes,
        }
    }
}

/// Changes applied by an update
#[derive(Debug, Clone, Default)]
pub struct ObjectPatch {
    pub set: Attributes,
    pub unset: Vec<String>,
    pub acl: Option<Acl>,
}

impl ObjectPatch {
    pub fn set(mut self, key: impl Into<String>, value: Value) -> Self {
        self.set.insert(key.into(), value);
        self
    }

    pub fn unset(mut self, key: impl Into<String>) -> Self {
        self.unset.push(key.into());
        self
    }
}

/// Canonical timestamp rendering (RFC 3339, milliseconds, `Z`)
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Storage collection backing a class
pub fn collection_name(class_name: &str) -> String {
    class_name.to_lowercase()
}

/// Rewrite typed literals into their stored form.
///
/// `{"__type": "Date", "iso": ..}` becomes the canonical timestamp string and
/// `{"__type": "Pointer", "objectId": ..}` becomes the bare id. Arrays and
/// nested objects are rewritten recursively.
pub fn normalize_value(value: Value) -> Value {
    match value {
        Value::Object(map) => match map.get("__type").and_then(Value::as_str) {
            Some("Date") => match map.get("iso").and_then(Value::as_str) {
                Some(iso) => match DateTime::parse_from_rfc3339(iso) {
                    Ok(ts) => Value::String(format_timestamp(&ts.with_timezone(&Utc))),
                    Err(_) => Value::String(iso.to_string()),
                },
                None => Value::Object(map),
            },
            Some("Pointer") => match map.get("objectId") {
                Some(Value::String(id)) => Value::String(id.clone()),
                _ => Value::Object(map),
            },
            _ => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, normalize_value(v)))
                    .collect(),
            ),
        },
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_value).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_object_id_generation() {
        let a = ObjectId::generate();
        let b = ObjectId::generate();
        assert_eq!(a.as_str().len(), OBJECT_ID_LEN);
        assert_ne!(a, b);
    }

    #[test]
    fn test_lookup_paths() {
        let mut attributes = Attributes::new();
        attributes.insert("address".into(), json!({"city": "Lyon", "geo": {"lat": 45}}));
        let obj = NewObject {
            class_name: "Place".into(),
            attributes,
            acl: None,
        }
        .into_object();

        assert_eq!(obj.lookup("address.city"), Some(json!("Lyon")));
        assert_eq!(obj.lookup("address.geo.lat"), Some(json!(45)));
        assert_eq!(obj.lookup("address.zip"), None);
        assert_eq!(obj.lookup("objectId"), Some(json!(obj.id.as_str())));
        assert_eq!(obj.created_at, obj.updated_at);
    }

    #[test]
    fn test_normalize_typed_literals() {
        let value = json!({
            "when": {"__type": "Date", "iso": "2024-03-01T10:00:00+02:00"},
            "owner": {"__type": "Pointer", "className": "_User", "objectId": "u1"},
            "list": [{"__type": "Pointer", "className": "_User", "objectId": "u2"}],
        });
        let normalized = normalize_value(value);
        assert_eq!(normalized["when"], json!("2024-03-01T08:00:00.000Z"));
        assert_eq!(normalized["owner"], json!("u1"));
        assert_eq!(normalized["list"], json!(["u2"]));
    }

    #[test]
    fn test_public_json_hides_attributes() {
        let mut attributes = Attributes::new();
        attributes.insert("username".into(), json!("alice"));
        attributes.insert("password".into(), json!("$argon2id$..."));
        let obj = NewObject {
            class_name: USER_CLASS.into(),
            attributes,
            acl: None,
        }
        .into_object();

        let public = obj.to_public_json(&["password"]);
        assert_eq!(public["username"], json!("alice"));
        assert!(public.get("password").is_none());
        assert_eq!(public["objectId"], json!(obj.id.as_str()));
    }

    #[test]
    fn test_patch_advances_updated_at() {
        let mut obj = NewObject::default().into_object();
        let before = obj.updated_at;
        obj.apply(ObjectPatch::default().set("score", json!(10)).unset("missing"));
        assert!(obj.updated_at >= before);
        assert_eq!(obj.get("score"), Some(&json!(10)));
    }
}
