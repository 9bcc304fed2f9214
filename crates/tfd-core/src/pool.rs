//! Byte-accounted memory pool with RAII leases.
//!
//! Models the shared-memory region message buffers are drawn from. The pool
//! tracks bytes, not slabs: `allocate` blocks while the region is exhausted
//! (pipeline backpressure) and `stop()` wakes every waiter with `None` so
//! teardown can proceed. Dropping a lease returns its bytes; dropping a
//! finished STF therefore bulk-releases everything it carried.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tracing::warn;

struct PoolState {
    used: u64,
    stopped: bool,
}

/// Shared region accounting for message buffers.
pub struct MemoryPool {
    capacity: u64,
    state: Mutex<PoolState>,
    space: Condvar,
    allocations: AtomicU64,
    exhaustion_waits: AtomicU64,
}

impl MemoryPool {
    pub fn new(capacity: u64) -> Arc<Self> {
        assert!(capacity > 0, "pool capacity must be greater than 0");
        Arc::new(Self {
            capacity,
            state: Mutex::new(PoolState {
                used: 0,
                stopped: false,
            }),
            space: Condvar::new(),
            allocations: AtomicU64::new(0),
            exhaustion_waits: AtomicU64::new(0),
        })
    }

    /// Reserve `size` bytes, blocking while the region is exhausted.
    ///
    /// Returns `None` once the pool is stopped, or immediately for requests
    /// larger than the whole region (those could never succeed).
    pub fn allocate(self: &Arc<Self>, size: u64) -> Option<PoolLease> {
        if size > self.capacity {
            warn!(size, capacity = self.capacity, "allocation exceeds pool region");
            return None;
        }
        let mut state = self.state.lock();
        while !state.stopped && state.used + size > self.capacity {
            self.exhaustion_waits.fetch_add(1, Ordering::Relaxed);
            warn!(
                requested = size,
                used = state.used,
                capacity = self.capacity,
                "memory pool exhausted, waiting for buffers to be released"
            );
            self.space.wait(&mut state);
        }
        if state.stopped {
            return None;
        }
        state.used += size;
        self.allocations.fetch_add(1, Ordering::Relaxed);
        Some(PoolLease {
            size,
            pool: Arc::clone(self),
        })
    }

    /// Reserve without blocking; `None` when exhausted or stopped.
    pub fn try_allocate(self: &Arc<Self>, size: u64) -> Option<PoolLease> {
        let mut state = self.state.lock();
        if state.stopped || state.used + size > self.capacity {
            return None;
        }
        state.used += size;
        self.allocations.fetch_add(1, Ordering::Relaxed);
        Some(PoolLease {
            size,
            pool: Arc::clone(self),
        })
    }

    /// Unblock all pending allocations; they return `None`.
    pub fn stop(&self) {
        self.state.lock().stopped = true;
        self.space.notify_all();
    }

    fn release(&self, size: u64) {
        let mut state = self.state.lock();
        debug_assert!(state.used >= size);
        state.used = state.used.saturating_sub(size);
        drop(state);
        self.space.notify_all();
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn used(&self) -> u64 {
        self.state.lock().used
    }

    /// Total successful allocations (telemetry).
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Times an allocation had to wait on exhaustion (telemetry).
    pub fn exhaustion_waits(&self) -> u64 {
        self.exhaustion_waits.load(Ordering::Relaxed)
    }
}

/// RAII reservation of pool bytes; returns them on drop.
pub struct PoolLease {
    size: u64,
    pool: Arc<MemoryPool>,
}

impl PoolLease {
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        self.pool.release(self.size);
    }
}

impl std::fmt::Debug for PoolLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolLease").field("size", &self.size).finish()
    }
}

/// One transport message part: payload bytes plus their pool reservation.
///
/// Stages move these; payload bytes are never copied. Messages from
/// non-pooled sources (tests, replay) simply carry no lease.
#[derive(Debug)]
pub struct PooledMessage {
    pub data: Bytes,
    _lease: Option<PoolLease>,
}

impl PooledMessage {
    pub fn new(data: Bytes, lease: Option<PoolLease>) -> Self {
        Self {
            data,
            _lease: lease,
        }
    }

    pub fn unpooled(data: Bytes) -> Self {
        Self {
            data,
            _lease: None,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_allocate_and_release() {
        let pool = MemoryPool::new(100);
        let lease = pool.allocate(60).unwrap();
        assert_eq!(pool.used(), 60);
        drop(lease);
        assert_eq!(pool.used(), 0);
    }

    #[test]
    fn test_try_allocate_exhausted() {
        let pool = MemoryPool::new(100);
        let _held = pool.allocate(80).unwrap();
        assert!(pool.try_allocate(40).is_none());
        assert!(pool.try_allocate(20).is_some());
    }

    #[test]
    fn test_oversized_request_fails_fast() {
        let pool = MemoryPool::new(100);
        assert!(pool.allocate(101).is_none());
    }

    #[test]
    fn test_blocked_allocation_resumes_on_release() {
        let pool = MemoryPool::new(100);
        let held = pool.allocate(100).unwrap();

        let pool2 = Arc::clone(&pool);
        let waiter = thread::spawn(move || pool2.allocate(50).is_some());
        thread::sleep(Duration::from_millis(20));
        drop(held);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_stop_unblocks_waiters() {
        let pool = MemoryPool::new(100);
        let _held = pool.allocate(100).unwrap();

        let pool2 = Arc::clone(&pool);
        let waiter = thread::spawn(move || pool2.allocate(1).is_none());
        thread::sleep(Duration::from_millis(20));
        pool.stop();
        assert!(waiter.join().unwrap());
        assert_eq!(pool.exhaustion_waits(), 1);
    }

    #[test]
    fn test_pooled_message_releases_on_drop() {
        let pool = MemoryPool::new(100);
        let lease = pool.allocate(10).unwrap();
        let msg = PooledMessage::new(Bytes::from_static(b"0123456789"), Some(lease));
        assert_eq!(pool.used(), 10);
        drop(msg);
        assert_eq!(pool.used(), 0);
    }
}
