//! Bounded queue of pending control commands

use crate::protocol::Command;

/// Fixed-capacity circular queue of commands waiting to be framed.
///
/// Producers never block: `enqueue` refuses the command when the queue is
/// full and the caller retries on a later tick.
#[derive(Debug)]
pub struct CommandQueue {
    slots: Box<[Option<Command>]>,
    offset: usize,
    len: usize,
}

impl CommandQueue {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "command queue capacity must be non-zero");
        Self {
            slots: vec![None; capacity].into_boxed_slice(),
            offset: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    /// Append a command. Returns `false` if the queue is full.
    pub fn enqueue(&mut self, cmd: Command) -> bool {
        if self.is_full() {
            return false;
        }
        let idx = (self.offset + self.len) % self.capacity();
        self.slots[idx] = Some(cmd);
        self.len += 1;
        true
    }

    /// Oldest command, left in place
    pub fn front(&self) -> Option<Command> {
        if self.is_empty() {
            None
        } else {
            self.slots[self.offset]
        }
    }

    /// Remove the oldest command. `None` is the no-op result on an empty queue.
    pub fn dequeue(&mut self) -> Option<Command> {
        if self.is_empty() {
            return None;
        }
        let cmd = self.slots[self.offset].take();
        self.offset = (self.offset + 1) % self.capacity();
        self.len -= 1;
        cmd
    }
}
