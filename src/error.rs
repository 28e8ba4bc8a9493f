//! Error types for the object store
//!
//! Every failure is a structured `ParcelError` with a stable `ErrorKind`, so
//! the routing layer can map failures to status codes without matching on
//! message text. Engine failures arrive as `StorageError` and are wrapped.

use thiserror::Error;
use tracing::error;

/// Result type for object store operations.
pub type ParcelResult<T> = Result<T, ParcelError>;

/// Result type for storage engine calls.
pub type StorageResult<T> = Result<T, StorageError>;

/// Stable error classification exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ClassNotFound,
    NotFound,
    DuplicateClass,
    InvalidClass,
    UnknownType,
    UnsupportedOperator,
    InvalidQuery,
    Validation,
    DuplicateValue,
    Unauthorized,
    InvalidSession,
    InvalidCredentials,
    InvalidConfig,
    StorageError,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ClassNotFound => "class_not_found",
            ErrorKind::NotFound => "not_found",
            ErrorKind::DuplicateClass => "duplicate_class",
            ErrorKind::InvalidClass => "invalid_class",
            ErrorKind::UnknownType => "unknown_type",
            ErrorKind::UnsupportedOperator => "unsupported_operator",
            ErrorKind::InvalidQuery => "invalid_query",
            ErrorKind::Validation => "validation",
            ErrorKind::DuplicateValue => "duplicate_value",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::InvalidSession => "invalid_session",
            ErrorKind::InvalidCredentials => "invalid_credentials",
            ErrorKind::InvalidConfig => "invalid_config",
            ErrorKind::StorageError => "storage_error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the object store.
#[derive(Debug, Error)]
pub enum ParcelError {
    #[error("class not found: {0}")]
    ClassNotFound(String),

    #[error("object not found: {class_name}/{id}")]
    NotFound { class_name: String, id: String },

    #[error("class already loaded: {0}")]
    DuplicateClass(String),

    #[error("invalid class: {0}")]
    InvalidClass(String),

    #[error("unknown attribute type: {0}")]
    UnknownType(String),

    #[error("unsupported query operator: {0}")]
    UnsupportedOperator(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("duplicate value for unique attribute '{attribute}' in class {class_name}")]
    DuplicateValue { class_name: String, attribute: String },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("invalid session token")]
    InvalidSession,

    #[error("invalid login parameters")]
    InvalidCredentials,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Engine failure. The engine detail is logged when wrapped and kept as
    /// the error source, never in the message.
    #[error("storage operation failed")]
    Storage(#[source] StorageError),
}

impl ParcelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ParcelError::ClassNotFound(_) => ErrorKind::ClassNotFound,
            ParcelError::NotFound { .. } => ErrorKind::NotFound,
            ParcelError::DuplicateClass(_) => ErrorKind::DuplicateClass,
            ParcelError::InvalidClass(_) => ErrorKind::InvalidClass,
            ParcelError::UnknownType(_) => ErrorKind::UnknownType,
            ParcelError::UnsupportedOperator(_) => ErrorKind::UnsupportedOperator,
            ParcelError::InvalidQuery(_) => ErrorKind::InvalidQuery,
            ParcelError::Validation(_) => ErrorKind::Validation,
            ParcelError::DuplicateValue { .. } => ErrorKind::DuplicateValue,
            ParcelError::Unauthorized(_) => ErrorKind::Unauthorized,
            ParcelError::InvalidSession => ErrorKind::InvalidSession,
            ParcelError::InvalidCredentials => ErrorKind::InvalidCredentials,
            ParcelError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            ParcelError::Storage(_) => ErrorKind::StorageError,
        }
    }

    pub(crate) fn not_found(class_name: &str, id: impl ToString) -> Self {
        ParcelError::NotFound {
            class_name: class_name.to_string(),
            id: id.to_string(),
        }
    }
}

impl From<StorageError> for ParcelError {
    fn from(err: StorageError) -> Self {
        error!(error = %err, "storage engine failure");
        ParcelError::Storage(err)
    }
}

/// Errors raised by a storage engine.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The collection is not part of the current connection set.
    #[error("collection is not open: {0}")]
    CollectionClosed(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend-specific failure (RocksDB, ...).
    #[error("backend error: {0}")]
    Backend(String),

    /// A blocking storage task panicked or was cancelled.
    #[error("storage task failed: {0}")]
    Task(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_do_not_leak_engine_detail() {
        let err: ParcelError = StorageError::Backend("IO error: /var/db/LOCK".into()).into();
        assert_eq!(err.kind(), ErrorKind::StorageError);
        assert_eq!(err.to_string(), "storage operation failed");
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("backend error: IO error: /var/db/LOCK"));
    }

    #[test]
    fn kinds_have_stable_codes() {
        assert_eq!(ParcelError::InvalidSession.kind().as_str(), "invalid_session");
        assert_eq!(
            ParcelError::not_found("GameScore", "abc").to_string(),
            "object not found: GameScore/abc"
        );
    }
}
