//! Error types for the replication core.

use georep_storage::StorageError;
use std::fmt;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Maximum stored length of a failure message, in characters.
pub const MAX_FAILURE_LENGTH: usize = 255;

/// Errors raised by the replication core.
///
/// Transfer and checksum failures are not errors at this level: they are
/// recorded on the affected rows. Only failures of the shared store itself,
/// and misuse of the state machines, surface here.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The shared store failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// An event is not valid in the current state.
    #[error("invalid {machine} transition: {event} from {state}")]
    InvalidTransition {
        /// Which state machine rejected the event.
        machine: &'static str,
        /// Current state.
        state: String,
        /// Rejected event.
        event: String,
    },

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl CoreError {
    /// Creates an invalid transition error.
    pub fn invalid_transition(
        machine: &'static str,
        state: impl fmt::Debug,
        event: impl fmt::Debug,
    ) -> Self {
        Self::InvalidTransition {
            machine,
            state: format!("{state:?}"),
            event: format!("{event:?}"),
        }
    }
}

/// Classification of a recorded failure, used in logs and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// The transfer from the primary raised.
    TransferFailure,
    /// The checksum routine raised.
    ChecksumComputeFailure,
    /// The computed checksum differs from the primary's.
    ChecksumMismatch,
    /// A sync stayed in `started` past its timeout.
    SyncTimeout,
    /// A verification stayed in `verification_started` past its timeout.
    VerificationTimeout,
}

impl FailureKind {
    /// Returns a stable name for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::TransferFailure => "transfer_failure",
            FailureKind::ChecksumComputeFailure => "checksum_compute_failure",
            FailureKind::ChecksumMismatch => "checksum_mismatch",
            FailureKind::SyncTimeout => "sync_timeout",
            FailureKind::VerificationTimeout => "verification_timeout",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds a failure message, appending the error text if present, and
/// truncates it to [`MAX_FAILURE_LENGTH`] characters.
pub fn failure_message(message: &str, error: Option<&dyn fmt::Display>) -> String {
    match error {
        Some(error) => truncate_failure(&format!("{message}: {error}")),
        None => truncate_failure(message),
    }
}

/// Truncates a failure message to [`MAX_FAILURE_LENGTH`] characters.
pub fn truncate_failure(message: &str) -> String {
    match message.char_indices().nth(MAX_FAILURE_LENGTH) {
        Some((idx, _)) => message[..idx].to_string(),
        None => message.to_string(),
    }
}
