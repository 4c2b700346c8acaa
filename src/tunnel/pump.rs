//! Protocol pump: multiplexes logical connections over the tunnel buffers
//!
//! The pump never touches sockets. It moves bytes between the per-connection
//! ring buffers and the tunnel ring buffers (connection at index 0):
//! - `mux` frames queued commands, then inbound data of every eligible
//!   connection, into the tunnel outbound buffer
//! - `demux` splits the tunnel inbound buffer back into connection outbound
//!   buffers and hands command frames to the caller one at a time

use super::frame::{self, Decoded};
use super::{CommandQueue, Connection, RingBuffer};
use crate::protocol::{
    Command, CommandKind, ProtocolError, COMMAND_FRAME_LEN, CONTROL_ID, DATA_HEADER_LEN, END,
    ID_SPACE, MAX_LOGICAL_ID, MIN_FRAME_PROBE,
};
use tracing::{error, trace, warn};

/// Live connections indexed by logical ID.
///
/// Each slot holds the position of the connection in the manager's list.
/// Rebuilt every tick, since the list is compacted by the manager.
#[derive(Debug, Clone)]
pub struct SlotTable {
    slots: [Option<usize>; ID_SPACE],
}

impl SlotTable {
    pub fn new() -> Self {
        Self {
            slots: [None; ID_SPACE],
        }
    }

    /// Index every connection that holds an ID and is not being deleted.
    ///
    /// Returns the offending ID if two connections claim the same one.
    pub fn build(conns: &[Connection]) -> Result<Self, u8> {
        let mut table = Self::new();
        for (idx, conn) in conns.iter().enumerate() {
            let id = match conn.id() {
                Some(id) if !conn.state.contains(super::ConnFlags::DELETE) => id,
                _ => continue,
            };
            if table.slots[usize::from(id)].replace(idx).is_some() {
                return Err(id);
            }
        }
        Ok(table)
    }

    pub fn get(&self, id: u8) -> Option<usize> {
        self.slots[usize::from(id)]
    }

    pub fn remove(&mut self, id: u8) -> Option<usize> {
        self.slots[usize::from(id)].take()
    }
}

impl Default for SlotTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Logical connection behind `id`, from the slice that follows the tunnel
fn logical_mut<'a>(
    table: &SlotTable,
    rest: &'a mut [Connection],
    id: u8,
) -> Option<&'a mut Connection> {
    let idx = table.get(id)?.checked_sub(1)?;
    rest.get_mut(idx)
}

fn next_id(id: u8) -> u8 {
    if id == MAX_LOGICAL_ID {
        1
    } else {
        id + 1
    }
}

/// Framing state shared by both directions
#[derive(Debug)]
pub struct Pump {
    queue: CommandQueue,
    /// Data frame being decoded across ticks
    decoding: Option<u8>,
    /// First connection considered by the next `mux`
    cursor: u8,
    /// IDs closed locally; late data frames for them are dropped
    retired: [bool; ID_SPACE],
}

impl Pump {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            queue: CommandQueue::new(queue_capacity),
            decoding: None,
            cursor: 1,
            retired: [false; ID_SPACE],
        }
    }

    /// Queue a command for the peer. Returns `false` if the queue is full.
    pub fn send_command(&mut self, cmd: Command) -> bool {
        let queued = self.queue.enqueue(cmd);
        if queued {
            trace!("Queued {}", cmd);
        }
        queued
    }

    pub fn pending_commands(&self) -> usize {
        self.queue.len()
    }

    /// Drop late data addressed to `id` instead of failing the session
    pub fn retire(&mut self, id: u8) {
        self.retired[usize::from(id)] = true;
    }

    /// `id` refers to a fresh connection again
    pub fn revive(&mut self, id: u8) {
        self.retired[usize::from(id)] = false;
    }

    /// Decode tunnel input until it runs out, a destination fills up, or a
    /// command frame is reached. The command is consumed and returned; the
    /// caller handles it and calls `demux` again.
    ///
    /// Command frames are left in place while the command queue is full, so
    /// any reply the caller enqueues always fits.
    pub fn demux(
        &mut self,
        conns: &mut [Connection],
        table: &SlotTable,
    ) -> Result<Option<Command>, ProtocolError> {
        let (tunnel, rest) = match conns.split_first_mut() {
            Some(split) => split,
            None => return Ok(None),
        };
        let src = &mut tunnel.inbound_buf;

        loop {
            if let Some(id) = self.decoding {
                let dst = logical_mut(table, rest, id)
                    .filter(|conn| conn.accepts_data())
                    .map(|conn| &mut conn.outbound_buf);
                if dst.is_none() {
                    trace!("Discarding data for connection {}", id);
                }
                match frame::decode_data(src, dst) {
                    Decoded::Complete => self.decoding = None,
                    Decoded::Partial => return Ok(None),
                }
            }

            if src.len() < MIN_FRAME_PROBE {
                return Ok(None);
            }
            let mut header = [0u8; 3];
            src.peek(&mut header);
            if header[0] != END {
                error!("Tunnel stream out of sync: frame starts with {:#04x}", header[0]);
                return Err(ProtocolError::BadFrameStart(header[0]));
            }

            let id = header[1];
            if id == CONTROL_ID {
                if src.len() < COMMAND_FRAME_LEN || self.queue.is_full() {
                    return Ok(None);
                }
                let mut frame = [0u8; COMMAND_FRAME_LEN];
                src.peek(&mut frame);
                src.advance_read(COMMAND_FRAME_LEN);
                match CommandKind::from_u8(frame[2]) {
                    Some(kind) => return Ok(Some(Command::new(kind, frame[3]))),
                    None => warn!("Ignoring unknown command kind {}", frame[2]),
                }
            } else {
                if table.get(id).is_none() && !self.retired[usize::from(id)] {
                    error!("Data frame for connection {} that was never opened", id);
                    return Err(ProtocolError::UnknownConnection(id));
                }
                src.advance_read(DATA_HEADER_LEN);
                self.decoding = Some(id);
            }
        }
    }

    /// Frame queued commands, then connection data, into the tunnel.
    ///
    /// Connections are visited round robin starting at the cursor. The first
    /// connection that cannot be fully drained ends the pass; the cursor then
    /// moves past it if it got any bytes out, otherwise it stays on it.
    /// Returns the number of payload bytes framed.
    pub fn mux(&mut self, conns: &mut [Connection], table: &SlotTable) -> usize {
        let (tunnel, rest) = match conns.split_first_mut() {
            Some(split) => split,
            None => return 0,
        };
        let dst: &mut RingBuffer = &mut tunnel.outbound_buf;

        while let Some(cmd) = self.queue.front() {
            if !frame::encode_command(dst, cmd) {
                return 0;
            }
            self.queue.dequeue();
            trace!("Sent {}", cmd);
        }

        let mut total = 0;
        let mut id = self.cursor;
        for _ in 0..MAX_LOGICAL_ID {
            let current = id;
            id = next_id(id);

            let conn = match logical_mut(table, rest, current) {
                Some(conn) if conn.can_mux() => conn,
                _ => continue,
            };
            let sent = frame::encode_data(&mut conn.inbound_buf, dst, current);
            total += sent;
            if !conn.inbound_buf.is_empty() {
                self.cursor = if sent == 0 { current } else { next_id(current) };
                break;
            }
        }
        if total > 0 {
            trace!("Framed {} bytes", total);
        }
        total
    }
}
