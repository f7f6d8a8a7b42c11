//! Errors returned to applications driving a conference.

use std::collections::TryReserveError;
use std::io;

use meshconf_protocol::{MessageType, ProtocolError};
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, Error>;

/// Closed set of failures an application can observe.
///
/// Timeouts and hangups inside the listener and dispatch loops are handled
/// there and never reach the application as fatal errors.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Transport-level failure.
    #[error("connection error: {0}")]
    Connection(String),

    #[error("connection timeout")]
    ConnectionTimeout,

    /// The peer closed the connection.
    #[error("connection hang up")]
    ConnectionHangup,

    /// A multiplexed wait was given no connection to wait on.
    #[error("no valid connections")]
    NoValidConnections,

    #[error("already initialized")]
    AlreadyInitialized,

    /// Operation on a conference that has not been initialised.
    #[error("empty context")]
    EmptyContext,

    #[error("threading error: {0}")]
    Threading(String),

    #[error("unexpected message type: {0:?}")]
    UnexpectedMessageType(MessageType),

    #[error("invite rejected")]
    InviteRejected,

    #[error("invalid stream: {0}")]
    InvalidStream(String),

    #[error("memory error: {0}")]
    Memory(String),
}

impl Error {
    /// Fixed human-readable description of the error kind, without detail.
    pub fn description(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "invalid argument",
            Self::InvalidAddress(_) => "invalid address",
            Self::Connection(_) => "connection error",
            Self::ConnectionTimeout => "connection timeout",
            Self::ConnectionHangup => "connection hang up",
            Self::NoValidConnections => "no valid connections",
            Self::AlreadyInitialized => "already init",
            Self::EmptyContext => "empty context",
            Self::Threading(_) => "threading error",
            Self::UnexpectedMessageType(_) => "unexpected message type",
            Self::InviteRejected => "invite rejected",
            Self::InvalidStream(_) => "invalid stream",
            Self::Memory(_) => "memory error",
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    pub fn invalid_stream(message: impl Into<String>) -> Self {
        Self::InvalidStream(message.into())
    }

    /// Whether the loops should treat this as "nothing happened, try again".
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ConnectionTimeout)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::ConnectionTimeout,
            _ => Self::Connection(e.to_string()),
        }
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::InvalidAddress(msg) => Self::InvalidAddress(msg),
            ProtocolError::InvalidArgument(msg) => Self::InvalidArgument(msg),
            ProtocolError::Io(io) => io.into(),
            other => Self::Connection(other.to_string()),
        }
    }
}

impl From<TryReserveError> for Error {
    fn from(e: TryReserveError) -> Self {
        Self::Memory(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptions() {
        insta::assert_snapshot!(Error::ConnectionHangup.description(), @"connection hang up");
        insta::assert_snapshot!(Error::InviteRejected.description(), @"invite rejected");
        insta::assert_snapshot!(
            Error::connection("reset by peer").description(),
            @"connection error"
        );
    }

    #[test]
    fn display_adds_detail() {
        insta::assert_snapshot!(
            Error::connection("reset by peer"),
            @"connection error: reset by peer"
        );
        insta::assert_snapshot!(
            Error::UnexpectedMessageType(MessageType::Text),
            @"unexpected message type: Text"
        );
    }

    #[test]
    fn io_timeouts_map_to_connection_timeout() {
        let timeout: Error = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert!(timeout.is_timeout());
        let timeout: Error = io::Error::from(io::ErrorKind::TimedOut).into();
        assert!(timeout.is_timeout());
        let reset: Error = io::Error::from(io::ErrorKind::ConnectionReset).into();
        assert!(matches!(reset, Error::Connection(_)));
    }

    #[test]
    fn protocol_errors_map_by_kind() {
        let err: Error = ProtocolError::InvalidAddress("x".into()).into();
        assert!(matches!(err, Error::InvalidAddress(_)));
        let err: Error = ProtocolError::InvalidArgument("x".into()).into();
        assert!(matches!(err, Error::InvalidArgument(_)));
        let err: Error = ProtocolError::UnknownMessageType(7).into();
        assert!(matches!(err, Error::Connection(_)));
        let err: Error = ProtocolError::Io(io::ErrorKind::TimedOut.into()).into();
        assert!(err.is_timeout());
    }
}
