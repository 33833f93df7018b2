//! Error types for case database operations.
//!
//! This module provides the error hierarchy using `thiserror` for every
//! engine operation: opening and migrating a case, statements issued through
//! either backend, repository lookups, and blackboard writes.

use crate::schema::SchemaVersion;
use thiserror::Error;

/// Result type alias for case database operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for case database operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The stored schema cannot be handled by this engine. Never retried.
    #[error("unsupported case database schema {found}; this engine supports {oldest} through {supported}")]
    UnsupportedSchema {
        /// Version found in the store.
        found: SchemaVersion,
        /// Oldest version this engine can upgrade.
        oldest: SchemaVersion,
        /// Newest version this engine understands.
        supported: SchemaVersion,
    },

    /// Storage-related errors (statement execution, connections).
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A constraint or uniqueness violation. Never retried.
    #[error("integrity violation in {operation}: {message}")]
    Integrity {
        /// Statement or operation that failed.
        operation: String,
        /// Message reported by the backend.
        message: String,
    },

    /// An entity that was expected to exist is missing.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of entity that was looked up.
        entity: &'static str,
        /// Identifier that was looked up.
        id: i64,
    },

    /// The migration chain failed and was rolled back.
    #[error("schema upgrade from {from} failed: {source}")]
    Migration {
        /// Version the store was at before the upgrade attempt.
        from: SchemaVersion,
        /// Underlying failure.
        source: Box<Error>,
    },

    /// The embedded case is held open by another process.
    #[error("case database is already open elsewhere: {path}")]
    CaseInUse {
        /// Path of the case file.
        path: String,
    },

    /// No case database exists at the given location.
    #[error("case database not found: {location}")]
    CaseNotFound {
        /// Path or server database name.
        location: String,
    },

    /// A case database already exists at the given location.
    #[error("case database already exists: {location}")]
    CaseExists {
        /// Path or server database name.
        location: String,
    },

    /// A caller passed an argument the engine cannot accept.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the problem.
        message: String,
    },

    /// Invalid state errors.
    #[error("invalid state: {message}")]
    InvalidState {
        /// Description of the invalid state.
        message: String,
    },

    /// Configuration errors.
    #[error("configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    /// I/O errors (backups, lock files, image reads).
    #[error("I/O error: {path}: {reason}")]
    Io {
        /// Path involved in the failed operation.
        path: String,
        /// Reason for failure.
        reason: String,
    },
}

impl Error {
    /// Returns true when the error is the fatal unsupported-schema condition.
    pub const fn is_unsupported_schema(&self) -> bool {
        matches!(self, Self::UnsupportedSchema { .. })
    }

    /// Returns true for constraint and uniqueness violations.
    pub const fn is_integrity(&self) -> bool {
        matches!(self, Self::Integrity { .. })
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub(crate) fn io(path: impl AsRef<std::path::Path>, err: &std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().display().to_string(),
            reason: err.to_string(),
        }
    }
}

/// Storage-specific errors for statement execution and connections.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Database error that is neither transient nor an integrity violation.
    #[error("database error: {0}")]
    Database(String),

    /// Transient failures persisted past the retry budget.
    #[error("{operation} failed after {attempts} attempts: {message}")]
    RetriesExhausted {
        /// Operation that was retried.
        operation: String,
        /// Number of attempts made.
        attempts: u32,
        /// Last transient error message.
        message: String,
    },

    /// A transient condition (busy store, lost connection) that may be retried.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The location does not hold a case database.
    #[error("not a case database: {0}")]
    NotACaseDatabase(String),

    /// A stored discriminator has no matching variant.
    #[error("unknown {kind} code {code}")]
    UnknownCode {
        /// Enumeration name.
        kind: &'static str,
        /// Stored value.
        code: i64,
    },

    /// A column held a value of an unexpected type.
    #[error("column {index}: expected {expected}, found {found}")]
    TypeMismatch {
        /// Column index.
        index: usize,
        /// Expected type.
        expected: &'static str,
        /// Found value kind.
        found: &'static str,
    },

    /// Transaction error.
    #[error("transaction error: {0}")]
    Transaction(String),

    /// Operation needs a collaborator or backend capability that is absent.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::Config {
            message: err.to_string(),
        }
    }
}
