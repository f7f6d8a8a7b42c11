//! Protocol error types.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while parsing addresses or (de)serialising frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds the maximum allowed size.
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: u64, max: u64 },

    /// Stream ended in the middle of a frame.
    #[error("incomplete message: expected {expected} bytes, got {received}")]
    IncompleteMessage { expected: usize, received: usize },

    /// Declared size is smaller than the frame header.
    #[error("empty message")]
    EmptyMessage,

    /// Type tag not known to this protocol version.
    #[error("unknown message type: {0}")]
    UnknownMessageType(u32),

    /// Frame body does not match the layout of its type.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Address could not be parsed or encoded.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// A field value cannot be put on the wire.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// IO error during read/write.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    pub(crate) fn invalid_address(msg: impl Into<String>) -> Self {
        Self::InvalidAddress(msg.into())
    }

    pub(crate) fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}
