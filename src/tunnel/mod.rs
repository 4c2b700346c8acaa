//! Tunnel layer - framing logical connections over one link
//!
//! Provides:
//! - Ring buffers with vectored socket I/O
//! - Data and command frame encoding/decoding
//! - Per-connection half-close state
//! - The protocol pump (mux/demux)

mod connection;
mod frame;
mod pump;
mod queue;
mod ring;

pub use connection::{ConnFlags, Connection};
pub use frame::{decode_data, encode_command, encode_data, Decoded};
pub use pump::{Pump, SlotTable};
pub use queue::CommandQueue;
pub use ring::{RingBuffer, Span};

use thiserror::Error;

/// Tunnel layer errors. All of them end the session.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Tunnel connection lost")]
    TunnelLost,

    #[error("Connection ID stack overflow (releasing {0})")]
    IdStackOverflow(u8),

    #[error("Connection ID stack underflow")]
    IdStackUnderflow,

    #[error("Connection ID {0} released twice")]
    DuplicateId(u8),

    #[error("Connection ID {0} is held by two connections")]
    IdCollision(u8),

    #[error("Protocol error: {0}")]
    Protocol(#[from] crate::protocol::ProtocolError),
}

/// Connection table size, tunnel included
pub const MAX_CONNECTIONS: usize = 256;

/// Commands that may wait for room in the tunnel
pub const COMMAND_QUEUE_CAPACITY: usize = 512;

/// Tunnel buffers are this many times larger than connection buffers
pub const TUNNEL_BUFFER_MULTIPLIER: usize = 10;
