//! Error types for the replication engine.

use georep_core::CoreError;
use georep_protocol::ProtocolError;
use georep_storage::StorageError;
use std::io;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that reach the caller of an engine entry point.
///
/// Transfer and checksum failures are recorded on rows and do not appear
/// here; see [`TransferError`] and [`ChecksumError`].
#[derive(Error, Debug)]
pub enum EngineError {
    /// The state machines or the shared store failed.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// An event could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The operation is only valid on the other site role.
    #[error("{operation} is not available on a {role} site")]
    WrongRole {
        /// Operation attempted.
        operation: &'static str,
        /// Role of this site.
        role: String,
    },

    /// No replicator handles this resource kind.
    #[error("unknown resource kind: {0}")]
    UnknownKind(String),

    /// Site settings could not be loaded.
    #[error("configuration error: {0}")]
    Config(String),

    /// Local content could not be removed or maintained.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<StorageError> for EngineError {
    fn from(err: StorageError) -> Self {
        EngineError::Core(CoreError::Storage(err))
    }
}

/// A failed transfer from the primary.
#[derive(Error, Debug)]
pub enum TransferError {
    /// The primary does not have the resource's content.
    #[error("{0} is not on the primary")]
    MissingOnPrimary(String),

    /// The primary rejected the request's signature.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Local or remote I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The primary answered with an error.
    #[error("remote error: {0}")]
    Remote(String),
}

impl TransferError {
    /// Returns true if the failure should use the extended retry cap.
    pub fn is_missing_on_primary(&self) -> bool {
        matches!(self, TransferError::MissingOnPrimary(_))
    }
}

/// A failed checksum computation.
#[derive(Error, Debug)]
pub enum ChecksumError {
    /// The content is not stored locally.
    #[error("{0} is not checksummable")]
    NotChecksummable(String),

    /// The repository does not exist.
    #[error("repository does not exist: {0}")]
    NoRepository(String),

    /// Reading the content failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_on_primary_is_distinct() {
        assert!(TransferError::MissingOnPrimary("uploads/1".into()).is_missing_on_primary());
        assert!(!TransferError::Remote("500".into()).is_missing_on_primary());
    }

    #[test]
    fn storage_errors_convert_through_core() {
        let err: EngineError = StorageError::Corrupted("bad".into()).into();
        assert!(matches!(err, EngineError::Core(CoreError::Storage(_))));
    }

    #[test]
    fn messages() {
        let err = ChecksumError::NoRepository("repos/a.git".into());
        assert_eq!(err.to_string(), "repository does not exist: repos/a.git");
        let err = EngineError::WrongRole {
            operation: "sync",
            role: "primary".into(),
        };
        assert_eq!(err.to_string(), "sync is not available on a primary site");
    }
}
