//! Free logical connection IDs (originator side)

use crate::protocol::{ID_SPACE, MAX_LOGICAL_ID};
use crate::tunnel::TunnelError;
use tracing::error;

/// Stack of unused IDs 1..=255.
///
/// Seeded so that the first pop yields 1. An ID is either on the stack or
/// held by exactly one connection; releasing an ID twice is a fault.
#[derive(Debug)]
pub struct FreeIds {
    stack: Vec<u8>,
    free: [bool; ID_SPACE],
}

impl FreeIds {
    pub fn new() -> Self {
        let mut free = [true; ID_SPACE];
        free[0] = false;
        Self {
            stack: (1..=MAX_LOGICAL_ID).rev().collect(),
            free,
        }
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    pub fn is_free(&self, id: u8) -> bool {
        self.free[usize::from(id)]
    }

    /// Take the most recently released ID
    pub fn pop(&mut self) -> Result<u8, TunnelError> {
        let id = match self.stack.pop() {
            Some(id) => id,
            None => {
                error!("No free connection IDs left");
                return Err(TunnelError::IdStackUnderflow);
            }
        };
        self.free[usize::from(id)] = false;
        Ok(id)
    }

    /// Return an ID once its connection is gone
    pub fn release(&mut self, id: u8) -> Result<(), TunnelError> {
        if self.is_free(id) {
            error!("Connection ID {} released twice", id);
            return Err(TunnelError::DuplicateId(id));
        }
        if id == 0 || self.stack.len() >= usize::from(MAX_LOGICAL_ID) {
            error!("Connection ID {} does not fit the free ID stack", id);
            return Err(TunnelError::IdStackOverflow(id));
        }
        self.free[usize::from(id)] = true;
        self.stack.push(id);
        Ok(())
    }
}

impl Default for FreeIds {
    fn default() -> Self {
        Self::new()
    }
}
