//! Error types for the TorChat engine.
//!
//! Lower layers (codec, connection) return typed errors; the engine decides
//! whether an error is scoped to a connection, a peer or a file transfer.
//! Nothing here is allowed to take the whole process down.

use thiserror::Error;

/// Core error type for TorChat operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Socket-level failure (reset, refused, broken pipe).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// SOCKS5 negotiation with the Tor proxy failed.
    #[error("socks5 error: {0}")]
    Socks(String),

    /// Line framing failed; the connection is unusable.
    #[error("framing error: {0}")]
    Framing(String),

    /// Wire protocol violation.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The connection was closed locally or by the remote side.
    #[error("connection closed")]
    Closed,

    /// Operation deadline expired.
    #[error("operation timed out")]
    Timeout,

    /// Peer has no usable connection, or is not ready for the request.
    #[error("peer not connected: {0}")]
    NotConnected(String),

    /// Unknown peer or transfer.
    #[error("not found: {0}")]
    NotFound(String),

    /// File transfer failure. The string is the human-readable reason.
    #[error("file transfer failed: {0}")]
    Transfer(String),

    /// Caller supplied an invalid value.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Engine lifecycle error (already running, shut down).
    #[error("engine error: {0}")]
    Engine(String),
}

/// Result type alias using TorChat's Error.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this error leaves the connection it happened on unusable.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Socks(_) | Error::Framing(_) | Error::Closed | Error::Timeout
        )
    }

    /// Whether the error is a benign protocol violation that is logged and dropped.
    pub fn should_silent_drop(&self) -> bool {
        matches!(self, Error::Protocol(_))
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout
    }
}
