//! Protocol error types.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while encoding or decoding events.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// CBOR encoding failed.
    #[error("encode error: {0}")]
    Encode(String),

    /// CBOR decoding failed.
    #[error("decode error: {0}")]
    Decode(String),

    /// The decoded value does not have the expected structure.
    #[error("invalid event structure: {0}")]
    InvalidStructure(String),

    /// An event type code is not known.
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    /// The publisher could not record an event.
    #[error("publish failed: {0}")]
    Publish(String),
}

impl ProtocolError {
    /// Creates an invalid structure error.
    pub fn invalid_structure(message: impl Into<String>) -> Self {
        Self::InvalidStructure(message.into())
    }
}
