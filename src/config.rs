//! Service configuration
//!
//! Parsed from JSON; every field has a default so an empty document is a
//! valid configuration.

use crate::acl::{class_default_acl, Acl};
use crate::error::{ParcelError, ParcelResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for the object service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Class-level ACL of the meta-class `__Class`
    pub meta_class_acl: Acl,
    /// Create the `_User` and `_Role` classes at startup
    pub bootstrap_default_classes: bool,
    /// Fixed delay before reporting a failed login (in milliseconds)
    pub login_failure_delay_ms: u64,
    pub password_hash: PasswordHashConfig,
    pub storage: StorageConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            meta_class_acl: class_default_acl(),
            bootstrap_default_classes: true,
            login_failure_delay_ms: 500,
            password_hash: PasswordHashConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn from_json_str(text: &str) -> ParcelResult<Self> {
        serde_json::from_str(text).map_err(|e| ParcelError::InvalidConfig(e.to_string()))
    }
}

/// Argon2 cost parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PasswordHashConfig {
    /// Memory cost in KiB
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for PasswordHashConfig {
    fn default() -> Self {
        PasswordHashConfig {
            memory_kib: 19456, // 19 MiB
            iterations: 2,
            parallelism: 1,
        }
    }
}

/// Storage engine selection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "engine", rename_all = "lowercase")]
pub enum StorageConfig {
    #[default]
    Memory,
    RocksDb { path: PathBuf },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::{Operation, PUBLIC};

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = ServiceConfig::from_json_str("{}").unwrap();
        assert_eq!(config, ServiceConfig::default());
        assert!(config.bootstrap_default_classes);
        assert_eq!(config.storage, StorageConfig::Memory);
        assert_eq!(config.meta_class_acl.get(PUBLIC, Operation::Create), Some(true));
    }

    #[test]
    fn test_partial_document() {
        let config = ServiceConfig::from_json_str(
            r#"{
                "login_failure_delay_ms": 0,
                "password_hash": {"iterations": 3},
                "storage": {"engine": "rocksdb", "path": "/var/lib/parcel"},
                "meta_class_acl": {"*": {"find": true, "get": true}}
            }"#,
        )
        .unwrap();

        assert_eq!(config.login_failure_delay_ms, 0);
        assert_eq!(config.password_hash.iterations, 3);
        assert_eq!(config.password_hash.memory_kib, 19456);
        assert_eq!(
            config.storage,
            StorageConfig::RocksDb {
                path: PathBuf::from("/var/lib/parcel")
            }
        );
        assert_eq!(config.meta_class_acl.get(PUBLIC, Operation::Create), None);
    }

    #[test]
    fn test_malformed_document() {
        let err = ServiceConfig::from_json_str("{\"storage\": 3}").unwrap_err();
        assert!(matches!(err, ParcelError::InvalidConfig(_)));
    }
}
