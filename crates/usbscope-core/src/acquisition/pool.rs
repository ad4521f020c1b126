//! Fixed-size pool of sample buffers with reference counting
//!
//! The pool owns every [`SampleBuffer`] for the lifetime of the process.
//! Buffers are addressed by index; a [`PooledBuffer`] handle holds exactly one
//! reference. Cloning a handle adds a reference, dropping or
//! [`release`](PooledBuffer::release)-ing it removes one. When the count
//! reaches zero the buffer re-enters the available set and one blocked
//! [`acquire`](BufferPool::acquire) is woken.
//!
//! One lock guards the available set and all refcounts, so
//! `available + in_flight == size` holds whenever the lock is free.

use super::buffer::SampleBuffer;
use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by the buffer pool
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Contract violation: buffer {index} released with refcount already 0")]
    ContractViolation { index: usize },

    #[error("Buffer pool shut down")]
    Shutdown,
}

#[derive(Debug)]
struct PoolState {
    available: VecDeque<usize>,
    refcounts: Vec<usize>,
    shutdown: bool,
}

struct PoolInner {
    buffers: Vec<RwLock<SampleBuffer>>,
    state: Mutex<PoolState>,
    buffer_returned: Condvar,
}

impl PoolInner {
    /// Drop one reference; returns `true` if the buffer went back to the pool
    fn release(&self, index: usize) -> Result<bool, PoolError> {
        let mut state = self.state.lock();
        let count = &mut state.refcounts[index];
        if *count == 0 {
            tracing::error!(index, "Buffer released with zero refcount");
            return Err(PoolError::ContractViolation { index });
        }
        *count -= 1;
        if *count > 0 {
            return Ok(false);
        }
        state.available.push_back(index);
        drop(state);
        self.buffer_returned.notify_one();
        Ok(true)
    }

    fn add_ref(&self, index: usize) {
        self.state.lock().refcounts[index] += 1;
    }
}

/// Fixed-size pool of pre-allocated [`SampleBuffer`]s
///
/// Cheap to clone; all clones share the same buffers.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Create a pool of `size` buffers of `capacity` samples x `channels`
    ///
    /// # Panics
    /// Panics if `size` is 0.
    pub fn new(size: usize, capacity: usize, channels: usize) -> Self {
        assert!(size > 0, "pool size must be greater than 0");

        let buffers = (0..size)
            .map(|_| RwLock::new(SampleBuffer::new(capacity, channels)))
            .collect();

        Self {
            inner: Arc::new(PoolInner {
                buffers,
                state: Mutex::new(PoolState {
                    available: (0..size).collect(),
                    refcounts: vec![0; size],
                    shutdown: false,
                }),
                buffer_returned: Condvar::new(),
            }),
        }
    }

    /// Total number of buffers
    pub fn size(&self) -> usize {
        self.inner.buffers.len()
    }

    /// Number of buffers currently available
    pub fn available(&self) -> usize {
        self.inner.state.lock().available.len()
    }

    /// Number of buffers currently held by at least one reference
    pub fn in_flight(&self) -> usize {
        self.size() - self.available()
    }

    /// Current refcount of buffer `index`
    pub fn refcount(&self, index: usize) -> usize {
        self.inner.state.lock().refcounts[index]
    }

    /// Take a free buffer, blocking until one is returned
    ///
    /// Exhaustion is backpressure, not an error; this only fails once the
    /// pool has been shut down.
    pub fn acquire(&self) -> Result<PooledBuffer, PoolError> {
        let mut state = self.inner.state.lock();
        loop {
            if state.shutdown {
                return Err(PoolError::Shutdown);
            }
            if let Some(index) = state.available.pop_front() {
                state.refcounts[index] += 1;
                return Ok(self.handle(index));
            }
            tracing::debug!("Buffer pool exhausted, waiting for a release");
            self.inner.buffer_returned.wait(&mut state);
        }
    }

    /// Wake every blocked acquirer and make further acquires fail
    pub fn shutdown(&self) {
        self.inner.state.lock().shutdown = true;
        self.inner.buffer_returned.notify_all();
    }

    /// Drop one reference of buffer `index` without a handle
    ///
    /// Only for reference counts taken through [`PooledBuffer::leak`];
    /// releasing a buffer whose count is already zero is reported as
    /// [`PoolError::ContractViolation`].
    pub fn release_index(&self, index: usize) -> Result<bool, PoolError> {
        self.inner.release(index)
    }

    fn handle(&self, index: usize) -> PooledBuffer {
        PooledBuffer {
            inner: Arc::clone(&self.inner),
            index,
            released: false,
        }
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("BufferPool")
            .field("size", &self.inner.buffers.len())
            .field("available", &state.available.len())
            .field("refcounts", &state.refcounts)
            .finish()
    }
}

/// One counted reference to a pooled [`SampleBuffer`]
///
/// `Clone` adds a reference; drop releases it.
pub struct PooledBuffer {
    inner: Arc<PoolInner>,
    index: usize,
    released: bool,
}

impl PooledBuffer {
    /// Index of the buffer inside its pool
    pub fn index(&self) -> usize {
        self.index
    }

    /// Shared access to the buffer contents
    pub fn read(&self) -> RwLockReadGuard<'_, SampleBuffer> {
        self.inner.buffers[self.index].read()
    }

    /// Exclusive access to the buffer contents
    ///
    /// Only the acquisition loop writes, and only while it holds the sole
    /// reference.
    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, SampleBuffer> {
        self.inner.buffers[self.index].write()
    }

    /// Release this reference explicitly, reporting contract violations
    pub fn release(mut self) -> Result<bool, PoolError> {
        self.released = true;
        self.inner.release(self.index)
    }

    /// Give up the handle without releasing its reference
    ///
    /// The caller becomes responsible for a matching
    /// [`BufferPool::release_index`].
    pub fn leak(mut self) -> usize {
        self.released = true;
        self.index
    }
}

impl Clone for PooledBuffer {
    fn clone(&self) -> Self {
        self.inner.add_ref(self.index);
        Self {
            inner: Arc::clone(&self.inner),
            index: self.index,
            released: false,
        }
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.inner.release(self.index) {
            // A second panic while unwinding would abort the process
            if !std::thread::panicking() {
                debug_assert!(false, "{}", e);
            }
        }
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("index", &self.index)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn assert_conserved(pool: &BufferPool) {
        assert_eq!(pool.available() + pool.in_flight(), pool.size());
    }

    #[test]
    fn test_acquire_sets_refcount_to_one() {
        let pool = BufferPool::new(3, 8, 2);
        let buf = pool.acquire().unwrap();
        assert_eq!(pool.refcount(buf.index()), 1);
        assert_eq!(pool.available(), 2);
        assert_conserved(&pool);
        drop(buf);
        assert_eq!(pool.available(), 3);
    }

    #[test]
    fn test_buffer_returns_only_at_zero() {
        let pool = BufferPool::new(3, 8, 2);
        let a = pool.acquire().unwrap();
        let b = a.clone();
        assert_eq!(pool.refcount(a.index()), 2);

        assert!(!a.release().unwrap());
        assert_eq!(pool.available(), 2);
        assert!(b.release().unwrap());
        assert_eq!(pool.available(), 3);
        assert_conserved(&pool);
    }

    #[test]
    fn test_release_at_zero_is_contract_violation() {
        let pool = BufferPool::new(2, 4, 1);
        let index = pool.acquire().unwrap().leak();
        assert_eq!(pool.release_index(index), Ok(true));
        assert_eq!(
            pool.release_index(index),
            Err(PoolError::ContractViolation { index })
        );
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_each_buffer_reenters_once() {
        let pool = BufferPool::new(3, 4, 1);
        let handles: Vec<_> = (0..3).map(|_| pool.acquire().unwrap()).collect();
        let clones: Vec<_> = handles.iter().cloned().collect();
        drop(handles);
        assert_eq!(pool.available(), 0);
        drop(clones);
        assert_eq!(pool.available(), 3);

        let mut indices: Vec<_> = (0..3).map(|_| pool.acquire().unwrap().leak()).collect();
        indices.sort();
        indices.dedup();
        assert_eq!(indices.len(), 3);
    }

    #[test]
    fn test_acquire_blocks_until_release() {
        let pool = BufferPool::new(1, 4, 1);
        let held = pool.acquire().unwrap();
        let got = Arc::new(AtomicBool::new(false));

        let waiter = {
            let pool = pool.clone();
            let got = Arc::clone(&got);
            std::thread::spawn(move || {
                let buf = pool.acquire().unwrap();
                got.store(true, Ordering::SeqCst);
                buf.index()
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        assert!(!got.load(Ordering::SeqCst));
        let index = held.index();
        drop(held);
        assert_eq!(waiter.join().unwrap(), index);
        assert!(got.load(Ordering::SeqCst));
    }

    #[test]
    fn test_shutdown_unblocks_acquirer() {
        let pool = BufferPool::new(1, 4, 1);
        let _held = pool.acquire().unwrap();
        let waiter = {
            let pool = pool.clone();
            std::thread::spawn(move || pool.acquire().map(|b| b.index()))
        };
        std::thread::sleep(Duration::from_millis(20));
        pool.shutdown();
        assert_eq!(waiter.join().unwrap(), Err(PoolError::Shutdown));
    }

    #[test]
    fn test_over_release_while_unwinding_does_not_abort() {
        let pool = BufferPool::new(1, 4, 1);
        let handle = pool.acquire().unwrap();
        assert_eq!(pool.release_index(handle.index()), Ok(true));

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _handle = handle;
            panic!("consumer failed while holding a buffer");
        }));
        assert!(result.is_err());
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.refcount(0), 0);
    }

    #[test]
    fn test_concurrent_churn_conserves_buffers() {
        let pool = BufferPool::new(3, 16, 2);
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let a = pool.acquire().unwrap();
                        let b = a.clone();
                        drop(a);
                        drop(b);
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(pool.available(), 3);
        assert!((0..3).all(|i| pool.refcount(i) == 0));
    }
}
