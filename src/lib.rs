//! Parcel - Dynamic Object Store Core
//!
//! Backend-as-a-service data layer: classes are created, altered and removed
//! at runtime, queried with a portable JSON language, and every object
//! carries its own access-control list.
//!
//! # Architecture
//!
//! - Attribute Layer: portable type descriptors resolved to a closed type set
//! - Schema Layer: class definitions stored as rows of the `__Class` meta-class
//! - Registry Layer: live set of loaded classes and the storage connection set
//! - Query Layer: strict filter parser lowered to the engine's native query
//! - Execution Layer: CRUD against loaded classes, keeping the registry in sync
//! - Access Layer: per-class and per-object ACLs, session tokens, accounts
//! - Storage Layer: in-memory engine, RocksDB engine behind the `rocksdb` feature

pub mod types;
pub mod error;
pub mod config;

// Schema modules
pub mod attribute;
pub mod schema;
pub mod registry;

// Storage modules
pub mod storage;
pub mod memory_storage;

// Query modules
pub mod query_filter;
pub mod query_native;
pub mod query_translator;

pub mod executor;

// Access control modules
pub mod acl;
pub mod session;
pub mod hasher;
pub mod auth;

pub mod service;

pub use types::{Attributes, NewObject, Object, ObjectId, ObjectPatch, META_CLASS, ROLE_CLASS, USER_CLASS};
pub use error::{ErrorKind, ParcelError, ParcelResult, StorageError, StorageResult};
pub use config::{PasswordHashConfig, ServiceConfig, StorageConfig};

// Schema exports
pub use attribute::AttributeType;
pub use schema::{AttributeSpec, ClassDefinition, ValidationError};
pub use registry::{ClassHandle, RegistrySnapshot, SchemaRegistry};

// Storage exports
pub use storage::StorageEngine;
pub use memory_storage::MemoryStorage;
#[cfg(feature = "rocksdb")]
pub use storage::RocksStorage;

// Query exports
pub use query_filter::{CompareOp, Filter};
pub use query_native::{CmpOp, NativeQuery, Predicate, SortKey};
pub use query_translator::{translate, QueryOptions};

pub use executor::{Executor, QueryResult};

// Access control exports
pub use acl::{Acl, AclSubject, Actor, Operation};
pub use session::{generate_session_token, SessionResolver};
pub use hasher::{Argon2Hasher, PasswordHasher};
pub use auth::{AccountService, AuthenticatedUser};

pub use service::{ObjectService, QueryResponse};
