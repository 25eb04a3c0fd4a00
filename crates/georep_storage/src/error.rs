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

    /// A row could not be serialized or deserialized.
    #[error("serialization error in table {table}: {message}")]
    Serialization {
        /// Table the row belongs to.
        table: String,
        /// Description of the failure.
        message: String,
    },

    /// The table file is corrupted.
    #[error("table corrupted: {0}")]
    Corrupted(String),
}

impl StorageError {
    /// Creates a serialization error for the given table.
    pub fn serialization(table: impl Into<String>, message: impl ToString) -> Self {
        Self::Serialization {
            table: table.into(),
            message: message.to_string(),
        }
    }
}
