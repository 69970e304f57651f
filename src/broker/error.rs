//! Broker Session Errors

use thiserror::Error;

/// Frame-level decode errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// Remaining-length varint ran past its 4-byte bound; the reassembly
    /// buffer has been discarded.
    #[error("remaining length exceeds 4 bytes")]
    LengthOverflow,

    /// A length-prefixed string ran past the packet body.
    #[error("truncated string field")]
    BadString,

    /// Structurally invalid packet body.
    #[error("malformed {0} packet")]
    BadPacket(&'static str),
}

/// Errors for a single broker session.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("invalid broker url: {0}")]
    Url(String),

    #[error("web-socket transport: {0}")]
    Transport(String),

    #[error("connect timed out")]
    ConnectTimeout,

    #[error("broker refused connection (return code {0})")]
    ConnectRejected(u8),

    #[error("connection closed")]
    Closed,

    #[error(transparent)]
    Frame(#[from] FrameError),
}

impl From<tokio_tungstenite::tungstenite::Error> for BrokerError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
