//! Scoped extra ownership of a pooled buffer
//!
//! A consumer that needs a buffer for longer than the moment it took it from
//! the mailbox (file export, a filename prompt) wraps it in a
//! [`ScopedBuffer`]. The guard holds its own reference, so the acquisition
//! loop cannot recycle the buffer underneath it, and releases that reference
//! on every exit path, including unwinding.

use super::buffer::SampleBuffer;
use super::pool::PooledBuffer;
use parking_lot::RwLockReadGuard;

/// Guard owning one extra reference to a buffer, or nothing
#[derive(Debug)]
pub struct ScopedBuffer {
    buffer: Option<PooledBuffer>,
}

impl ScopedBuffer {
    /// Take an extra reference on `buffer` (if any)
    pub fn acquire(buffer: Option<&PooledBuffer>) -> Self {
        Self {
            buffer: buffer.cloned(),
        }
    }

    /// True if the guard wraps a buffer
    pub fn is_some(&self) -> bool {
        self.buffer.is_some()
    }

    /// The wrapped handle
    pub fn handle(&self) -> Option<&PooledBuffer> {
        self.buffer.as_ref()
    }

    /// Shared access to the wrapped buffer's contents
    pub fn read(&self) -> Option<RwLockReadGuard<'_, SampleBuffer>> {
        self.buffer.as_ref().map(|b| b.read())
    }
}

/// Run `f` while holding an extra reference on `buffer`
///
/// The reference is released when `f` returns or unwinds. `f` receives
/// `None` when there is no buffer.
pub fn with_scoped_buffer<R>(
    buffer: Option<&PooledBuffer>,
    f: impl FnOnce(Option<&SampleBuffer>) -> R,
) -> R {
    let guard = ScopedBuffer::acquire(buffer);
    let contents = guard.read();
    f(contents.as_deref())
}
