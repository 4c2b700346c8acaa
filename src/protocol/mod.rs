//! Protocol definitions and constants
//!
//! Wire format on the tunnel stream:
//! ```text
//! Data frame:     +-----+----+------------------+-----+
//!                 | END | id | escaped payload  | END |
//!                 +-----+----+------------------+-----+
//!
//! Command frame:  +-----+----+------+-----+-----+
//!                 | END | 0  | kind | arg | END |
//!                 +-----+----+------+-----+-----+
//! ```
//!
//! Payload bytes equal to `END` or `ESC` are preceded by a literal `ESC`.
//! The kind and argument of a command frame are never escaped; a command
//! frame is recognised by its fixed length, not by scanning for `END`.

use thiserror::Error;

/// Protocol errors. All of them are fatal to the tunnel session.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Wrong frame start byte: {0:#04x}")]
    BadFrameStart(u8),

    #[error("Frame for unknown connection: {0}")]
    UnknownConnection(u8),
}

/// Frame start/end marker
pub const END: u8 = 0x7E;

/// Escape marker
pub const ESC: u8 = 0x7F;

/// Connection ID reserved for the tunnel itself; frames carrying it are commands
pub const CONTROL_ID: u8 = 0;

/// Size of a data frame header (`END` + id)
pub const DATA_HEADER_LEN: usize = 2;

/// Size of a command frame
pub const COMMAND_FRAME_LEN: usize = 5;

/// Bytes that must be buffered before a frame header is inspected
pub const MIN_FRAME_PROBE: usize = 4;

/// Number of IDs in the protocol space, tunnel included
pub const ID_SPACE: usize = 256;

/// Highest logical connection ID
pub const MAX_LOGICAL_ID: u8 = 255;

/// Control command kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandKind {
    /// Open a connection to the target under the given ID
    New = 1,
    /// Both directions of the connection are finished
    Close = 2,
    /// The sender stopped reading from its socket (no more data will follow)
    CloseInbound = 3,
    /// The sender can no longer write to its socket
    CloseOutbound = 4,
    /// The peer opened its side of a `New` connection
    Ack = 5,
}

impl CommandKind {
    /// Decode a command kind byte. Returns `None` for the no-op sentinel and
    /// for values outside the known set.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::New),
            2 => Some(Self::Close),
            3 => Some(Self::CloseInbound),
            4 => Some(Self::CloseOutbound),
            5 => Some(Self::Ack),
            _ => None,
        }
    }
}

/// A control command: kind plus an 8-bit connection ID argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub kind: CommandKind,
    pub id: u8,
}

impl Command {
    pub fn new(kind: CommandKind, id: u8) -> Self {
        Self { kind, id }
    }

    /// Encode into a complete command frame
    pub fn to_frame(self) -> [u8; COMMAND_FRAME_LEN] {
        [END, CONTROL_ID, self.kind as u8, self.id, END]
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({})", self.kind, self.id)
    }
}
