//! Transport layer - sockets and readiness polling
//!
//! The [`Manager`] owns every socket of one controller: the tunnel link, the
//! forwarded connections and, for the originator, the listening socket.
//! It runs one `mio` poll cycle per tick and moves bytes between the sockets
//! and the connection ring buffers.

mod manager;

pub use manager::{bind_listener, Manager};

use std::io;
use thiserror::Error;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Bind failed: {0}")]
    Bind(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Address resolution failed: {0}")]
    Resolve(String),

    #[error("Buffer size {0} is too large for the tunnel")]
    BufferTooLarge(usize),

    #[error("Connection table full")]
    TableFull,

    #[error("Tunnel connection already registered")]
    TunnelExists,
}

/// Errors that end one direction of a stream rather than the session
pub(crate) fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}
