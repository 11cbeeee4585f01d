//! Error types for record and relation operations
//!
//! Every failure raised by a relation is a [`RelationError`]. Errors are
//! `Clone` because a single fetch failure is handed to every caller that
//! was waiting on the same in-flight fetch.

use std::fmt::Debug;
use thiserror::Error;

/// Result type alias for relation operations
pub type RelationResult<T> = Result<T, RelationError>;

/// Error types for record and relation operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelationError {
    /// A write-once field or key received a second, differing value
    #[error("Property {field} is already initialized")]
    AlreadyInitialized { field: String },

    /// Data for one record was loaded into another record
    #[error("Record key mismatch for {record_type}: expected {expected}, found {actual}")]
    RecordKeyMismatch {
        record_type: String,
        expected: String,
        actual: String,
    },

    /// The relation was asked to resolve before its key was assigned
    #[error("Key attribute value not set: {key_attr}")]
    RelationKeyNotSet { key_attr: String },

    /// The fetch completed without producing the expected record
    #[error("Repository did not return a record for {key_attr} = {key}")]
    RelatedRecordNotFound { key_attr: String, key: String },

    /// The fetch function itself failed
    #[error("Backend error: {0}")]
    Backend(String),
}

impl RelationError {
    /// Create an `AlreadyInitialized` error for the named field
    pub fn already_initialized(field: impl Into<String>) -> Self {
        Self::AlreadyInitialized {
            field: field.into(),
        }
    }

    /// Create a `RecordKeyMismatch` error, rendering both keys with `Debug`
    pub fn key_mismatch<K: Debug>(record_type: impl Into<String>, expected: &K, actual: &K) -> Self {
        Self::RecordKeyMismatch {
            record_type: record_type.into(),
            expected: format!("{:?}", expected),
            actual: format!("{:?}", actual),
        }
    }

    /// Create a `RelationKeyNotSet` error for the named key attribute
    pub fn key_not_set(key_attr: impl Into<String>) -> Self {
        Self::RelationKeyNotSet {
            key_attr: key_attr.into(),
        }
    }

    /// Create a `RelatedRecordNotFound` error for the named key attribute
    pub fn not_found<K: Debug>(key_attr: impl Into<String>, key: &K) -> Self {
        Self::RelatedRecordNotFound {
            key_attr: key_attr.into(),
            key: format!("{:?}", key),
        }
    }

    /// Stable code for the error kind, suitable for translation by callers
    pub fn code(&self) -> &'static str {
        match self {
            Self::AlreadyInitialized { .. } => "record:reinitialized",
            Self::RecordKeyMismatch { .. } => "record:wrong-record",
            Self::RelationKeyNotSet { .. } => "record:relation",
            Self::RelatedRecordNotFound { .. } => "record:not-found",
            Self::Backend(_) => "record:backend",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::RelatedRecordNotFound { .. })
    }

    pub fn is_key_not_set(&self) -> bool {
        matches!(self, Self::RelationKeyNotSet { .. })
    }
}

// Convert from anyhow errors raised inside fetch functions
impl From<anyhow::Error> for RelationError {
    fn from(err: anyhow::Error) -> Self {
        RelationError::Backend(err.to_string())
    }
}
