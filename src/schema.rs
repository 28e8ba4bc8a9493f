//! Class definitions
//!
//! A class is defined by a row of the meta-class `__Class`:
//! `{name, attributes, acl?, strict?}`. Classes are schema-flexible by
//! default: declared attributes are type-checked, undeclared ones are
//! accepted unless the class is `strict`.

use crate::acl::Acl;
use crate::attribute::{self, AttributeType};
use crate::error::{ParcelError, ParcelResult};
use crate::types::{Attributes, META_CLASS, ROLE_CLASS, SYSTEM_ATTRIBUTES, USER_CLASS};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Resolved attribute declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeSpec {
    pub ty: AttributeType,
    pub required: bool,
    pub unique: bool,
    /// Never serialized outward
    pub protected: bool,
}

impl AttributeSpec {
    pub fn new(ty: AttributeType) -> Self {
        AttributeSpec {
            ty,
            required: false,
            unique: false,
            protected: false,
        }
    }

    /// Parse a descriptor, reading the flags of the options form.
    pub fn from_descriptor(descriptor: &Value) -> ParcelResult<Self> {
        let ty = attribute::resolve(descriptor)?;
        let flag = |name: &str| {
            descriptor
                .get(name)
                .and_then(Value::as_bool)
                .unwrap_or(false)
        };
        let is_options = descriptor.get("type").is_some()
            || descriptor.get("model").is_some()
            || descriptor.get("collection").is_some();

        Ok(if is_options {
            AttributeSpec {
                ty,
                required: flag("required"),
                unique: flag("unique"),
                protected: flag("protected"),
            }
        } else {
            AttributeSpec::new(ty)
        })
    }
}

/// Definition of a runtime class
#[derive(Debug, Clone, PartialEq)]
pub struct ClassDefinition {
    pub name: String,
    pub attributes: BTreeMap<String, AttributeSpec>,
    /// Class-level ACL (also governs the definition row itself)
    pub acl: Option<Acl>,
    /// Reject attributes that are not declared
    pub strict: bool,
    /// Attribute descriptors as persisted
    pub descriptor: Value,
}

impl ClassDefinition {
    /// Parse and validate a definition from its name and descriptors.
    pub fn parse(name: &str, descriptor: &Value) -> ParcelResult<Self> {
        if name.trim().is_empty() {
            return Err(ParcelError::InvalidClass("no name specified".into()));
        }

        let mut attributes = BTreeMap::new();
        match descriptor {
            Value::Null => {}
            Value::Object(map) => {
                for (attr_name, attr_descriptor) in map {
                    if SYSTEM_ATTRIBUTES.contains(&attr_name.as_str()) {
                        return Err(ParcelError::InvalidClass(format!(
                            "{name}: attribute '{attr_name}' is reserved"
                        )));
                    }
                    if attr_name.is_empty() || attr_name.starts_with('$') || attr_name.contains('.') {
                        return Err(ParcelError::InvalidClass(format!(
                            "{name}: invalid attribute name '{attr_name}'"
                        )));
                    }
                    attributes.insert(attr_name.clone(), AttributeSpec::from_descriptor(attr_descriptor)?);
                }
            }
            _ => {
                return Err(ParcelError::InvalidClass(format!(
                    "{name}: attributes must be an object"
                )))
            }
        }

        Ok(ClassDefinition {
            name: name.to_string(),
            attributes,
            acl: None,
            strict: false,
            descriptor: descriptor.clone(),
        })
    }

    /// Build a definition from the attributes of a `__Class` row.
    pub fn from_row(row: &Attributes, acl: Option<Acl>) -> ParcelResult<Self> {
        let name = row
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| ParcelError::InvalidClass("no name specified".into()))?;
        let descriptor = row.get("attributes").cloned().unwrap_or(Value::Null);

        let mut definition = ClassDefinition::parse(name, &descriptor)?;
        definition.acl = acl;
        definition.strict = row.get("strict").and_then(Value::as_bool).unwrap_or(false);
        Ok(definition)
    }

    pub fn with_acl(mut self, acl: Acl) -> Self {
        self.acl = Some(acl);
        self
    }

    pub fn get_attribute(&self, name: &str) -> Option<&AttributeSpec> {
        self.attributes.get(name)
    }

    pub fn protected_attributes(&self) -> Vec<&str> {
        self.attributes
            .iter()
            .filter(|(_, spec)| spec.protected)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn unique_attributes(&self) -> impl Iterator<Item = &str> {
        self.attributes
            .iter()
            .filter(|(_, spec)| spec.unique)
            .map(|(name, _)| name.as_str())
    }

    /// Validate the attributes of a new object
    pub fn validate_insert(&self, data: &Attributes) -> Result<(), ValidationError> {
        for (name, spec) in &self.attributes {
            if spec.required && data.get(name).map_or(true, Value::is_null) {
                return Err(ValidationError::FieldRequired(name.clone()));
            }
        }
        self.validate_values(data)
    }

    /// Validate the attributes written by an update
    pub fn validate_update(&self, set: &Attributes, unset: &[String]) -> Result<(), ValidationError> {
        for name in unset {
            if self.get_attribute(name).is_some_and(|spec| spec.required) {
                return Err(ValidationError::FieldRequired(name.clone()));
            }
        }
        for (name, value) in set {
            if value.is_null() && self.get_attribute(name).is_some_and(|spec| spec.required) {
                return Err(ValidationError::FieldRequired(name.clone()));
            }
        }
        self.validate_values(set)
    }

    fn validate_values(&self, data: &Attributes) -> Result<(), ValidationError> {
        for (name, value) in data {
            if SYSTEM_ATTRIBUTES.contains(&name.as_str()) {
                return Err(ValidationError::ReservedField(name.clone()));
            }
            match self.get_attribute(name) {
                Some(spec) if !spec.ty.accepts(value) => {
                    return Err(ValidationError::TypeMismatch {
                        field: name.clone(),
                        expected: spec.ty.name(),
                        got: value_type_name(value).to_string(),
                    })
                }
                Some(_) => {}
                None if self.strict => return Err(ValidationError::UnknownField(name.clone())),
                None => {}
            }
        }
        Ok(())
    }
}

/// Built-in meta-class definition
pub fn meta_class_definition() -> ClassDefinition {
    let descriptor = json!({
        "name": {"type": "string", "required": true, "unique": true},
        "attributes": "json",
        "strict": "boolean",
    });
    // The descriptor is static and known to resolve.
    ClassDefinition::parse(META_CLASS, &descriptor).unwrap_or_else(|_| ClassDefinition {
        name: META_CLASS.to_string(),
        attributes: BTreeMap::new(),
        acl: None,
        strict: false,
        descriptor,
    })
}

/// `__Class` rows for the built-in user and role classes
pub fn default_class_rows() -> Vec<Attributes> {
    let user = json!({
        "name": USER_CLASS,
        "attributes": {
            "username": {"type": "string", "required": true, "unique": true},
            "password": {"type": "string", "protected": true},
            "email": {"type": "email", "unique": true},
            "sessionToken": {"type": "string", "protected": true},
            "authData": {"type": "json", "protected": true},
            "roles": {"collection": ROLE_CLASS, "via": "users"},
        }
    });
    let role = json!({
        "name": ROLE_CLASS,
        "attributes": {
            "name": {"type": "string", "required": true, "unique": true},
            "roles": {"collection": ROLE_CLASS},
            "users": {"collection": USER_CLASS, "via": "roles"},
        }
    });

    [user, role]
        .into_iter()
        .filter_map(|row| match row {
            Value::Object(map) => Some(map),
            _ => None,
        })
        .collect()
}

/// Schema validation errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    FieldRequired(String),
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },
    ReservedField(String),
    UnknownField(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::FieldRequired(field) => write!(f, "attribute '{}' is required", field),
            ValidationError::TypeMismatch {
                field,
                expected,
                got,
            } => write!(
                f,
                "type mismatch for '{}': expected {}, got {}",
                field, expected, got
            ),
            ValidationError::ReservedField(field) => {
                write!(f, "attribute '{}' is managed by the store", field)
            }
            ValidationError::UnknownField(field) => {
                write!(f, "unknown attribute '{}' (class is strict)", field)
            }
        }
    }
}

impl From<ValidationError> for ParcelError {
    fn from(err: ValidationError) -> Self {
        ParcelError::Validation(err.to_string())
    }
}

fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
