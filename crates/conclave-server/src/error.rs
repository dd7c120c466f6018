//! Server error types.

use thiserror::Error;

use crate::backend::BackendError;

/// Top-level server error.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Configuration problem (bad address, unreadable certificate, ...).
    #[error("configuration error: {0}")]
    Config(String),

    /// Socket-level failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Framing violation on the wire.
    #[error("protocol error: {0}")]
    Protocol(#[from] conclave_proto::ProtocolError),

    /// Database failure. Session-fatal.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// The peer closed the connection.
    #[error("connection closed by peer")]
    PeerClosed,

    /// Transport-level failure with context.
    #[error("transport error: {0}")]
    Transport(String),
}

impl ServerError {
    /// True if this error means the wire connection is gone.
    #[must_use]
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, Self::Io(_) | Self::PeerClosed | Self::Transport(_))
    }
}
