//! Error types for JotDB core.

use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in JotDB core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage engine error.
    #[error("storage error: {0}")]
    Storage(#[from] jotdb_storage::StorageError),

    /// Codec error.
    #[error("codec error: {0}")]
    Codec(#[from] jotdb_codec::CodecError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization error.
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Write attempted against a database opened read-only.
    #[error("database is read-only")]
    ReadOnly,

    /// Table opened without a schema and none was supplied.
    #[error("table has no schema")]
    SchemaMissing,

    /// Another handle holds exclusive access to the same files.
    #[error("database locked: another handle has exclusive access")]
    DatabaseLocked,

    /// The database has been dropped or released.
    #[error("database is closed")]
    Closed,

    /// A query opted into empty-result errors and matched nothing.
    #[error("empty result: {message}")]
    EmptyResult {
        /// The message supplied by the query.
        message: String,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// The error of a failed batch, shared by every job that was part of it.
    ///
    /// Write errors surface once per streaming pass; all jobs drained into
    /// that pass receive the same underlying error.
    #[error("{0}")]
    Batch(Arc<CoreError>),
}

impl CoreError {
    /// Creates an empty result error.
    pub fn empty_result(message: impl Into<String>) -> Self {
        Self::EmptyResult {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Whether this error (or the batch error it wraps) is `Closed`.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        match self {
            Self::Closed => true,
            Self::Batch(inner) => inner.is_closed(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_error_displays_inner() {
        let inner = Arc::new(CoreError::ReadOnly);
        let err = CoreError::Batch(inner);
        assert_eq!(err.to_string(), "database is read-only");
    }

    #[test]
    fn closed_detection_sees_through_batches() {
        assert!(CoreError::Closed.is_closed());
        assert!(CoreError::Batch(Arc::new(CoreError::Closed)).is_closed());
        assert!(!CoreError::ReadOnly.is_closed());
    }
}
