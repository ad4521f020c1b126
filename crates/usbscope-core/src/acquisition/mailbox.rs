//! Single-occupant hand-off slot between the loop and the consumer
//!
//! Last write wins. Publishing over an unclaimed buffer recycles the old one
//! back to the pool, so a slow consumer drops frames instead of growing a
//! queue.

use super::pool::PooledBuffer;
use parking_lot::Mutex;

/// Holds at most one published buffer
#[derive(Debug, Default)]
pub struct Mailbox {
    slot: Mutex<Option<PooledBuffer>>,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place `buffer` in the slot
    ///
    /// Returns `true` if an unclaimed occupant was recycled.
    pub fn publish(&self, buffer: PooledBuffer) -> bool {
        let previous = self.slot.lock().replace(buffer);
        // Released outside the lock
        match previous {
            Some(old) => {
                tracing::debug!(index = old.index(), "Unclaimed frame recycled");
                drop(old);
                true
            }
            None => false,
        }
    }

    /// Remove and return the occupant, leaving the slot empty
    pub fn take(&self) -> Option<PooledBuffer> {
        self.slot.lock().take()
    }

    pub fn is_empty(&self) -> bool {
        self.slot.lock().is_none()
    }
}
