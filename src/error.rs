//! Error types for the framing engine.

use std::io;

use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the codec, arena, handshake, and connection engine.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from the underlying socket.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// RFC 6455 violation by the peer.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    /// The HTTP upgrade could not be completed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(&'static str),

    /// A frame reservation exceeded the arena's remaining capacity.
    #[error("arena overflow: requested {requested} byte(s) with {remaining} remaining")]
    ArenaOverflow { requested: usize, remaining: usize },

    /// An operation was attempted in a connection state that does not allow it.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

impl Error {
    /// True when the error is an end-of-stream condition rather than a fault.
    pub fn is_eof(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }
}
