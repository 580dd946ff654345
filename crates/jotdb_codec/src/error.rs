//! Error types for the codec crate.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur during encoding or decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The schema definition could not be parsed.
    #[error("invalid schema: {message}")]
    InvalidSchema {
        /// Description of the schema error.
        message: String,
    },

    /// A column type name was not recognized.
    #[error("unknown column type: {name}")]
    UnknownColumnType {
        /// The unrecognized type name.
        name: String,
    },

    /// A document that must be a JSON object was something else.
    #[error("document is not a JSON object")]
    NotAnObject,

    /// A value could not be encoded under its declared column type.
    #[error("value not representable as {column}:{type_name}")]
    NotRepresentable {
        /// The column name.
        column: String,
        /// The declared column type.
        type_name: &'static str,
    },
}

impl CodecError {
    /// Creates an invalid schema error.
    pub fn invalid_schema(message: impl Into<String>) -> Self {
        Self::InvalidSchema {
            message: message.into(),
        }
    }

    /// Creates an unknown column type error.
    pub fn unknown_column_type(name: impl Into<String>) -> Self {
        Self::UnknownColumnType { name: name.into() }
    }

    /// Creates a not-representable error.
    pub fn not_representable(column: impl Into<String>, type_name: &'static str) -> Self {
        Self::NotRepresentable {
            column: column.into(),
            type_name,
        }
    }
}
