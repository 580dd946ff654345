//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// An in-place write fell outside the original file region.
    ///
    /// In-place writes may only overwrite bytes that existed when the
    /// session was opened; everything past the original end of file must go
    /// through the append path.
    #[error("write out of bounds: position {position}, len {len}, original size {size}")]
    WriteOutOfBounds {
        /// The requested write position.
        position: u64,
        /// The requested write length.
        len: usize,
        /// The file size when the session was opened.
        size: u64,
    },
}
