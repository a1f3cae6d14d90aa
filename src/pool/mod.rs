//! Buffer Pool (C1): fixed-capacity pebble arena plus the bounded, closable
//! queue primitive that `PvMonitor` (C3) reuses for its `pvQueue` and
//! `bufferFreelist`.
//!
//! Ownership moves as an integer index between components (§5, "Ownership via
//! indices") — nobody holds a long-lived pointer into another component's
//! arena.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::Mutex;

/// Bounded queue with an explicit closed state and a peekable head.
///
/// Logically single-producer/single-consumer (every caller in this crate
/// has exactly one producer thread and one consumer thread per instance),
/// but the matcher's matching algorithm needs to *peek* the head PV datagram
/// without popping it (§4.4, step 2) — `crossbeam_queue::ArrayQueue` has no
/// peek, so this wraps a capacity-bounded `VecDeque` behind a short-held
/// `parking_lot::Mutex` rather than a hand-rolled lock-free ring. Contention
/// is a non-issue: each side touches the lock once per event/update, not in
/// a spin loop.
pub struct BoundedQueue<T> {
    inner: Mutex<VecDeque<T>>,
    capacity: usize,
    closed: AtomicBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    /// Queue is at capacity; caller should count this as a drop, not retry.
    Full,
    /// Queue has been shut down.
    Closed,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            closed: AtomicBool::new(false),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Startup: (re)opens the queue for pushes. Idempotent.
    pub fn startup(&self) {
        self.closed.store(false, Ordering::Release);
    }

    /// Shutdown: closes the queue. Blocked-in-spirit pops (callers polling
    /// `pop`) observe `None` forever after the queue drains; pushes fail with
    /// `PushError::Closed`.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.inner.lock().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Non-blocking push; never retries, never blocks the caller's thread.
    pub fn push(&self, value: T) -> Result<(), PushError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PushError::Closed);
        }
        let mut guard = self.inner.lock();
        if guard.len() >= self.capacity {
            return Err(PushError::Full);
        }
        guard.push_back(value);
        Ok(())
    }

    /// Pops the head element, if any.
    pub fn pop(&self) -> Option<T> {
        self.inner.lock().pop_front()
    }

    /// Peeks the head element without removing it.
    pub fn peek_cloned(&self) -> Option<T>
    where
        T: Clone,
    {
        self.inner.lock().front().cloned()
    }

    /// Runs `f` against the head element without removing it.
    pub fn peek_with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.inner.lock().front().map(f)
    }
}

/// Upper bound on a single L1Accept payload, and the pebble count (power of
/// two, bounds in-flight events).
pub struct BufferPool {
    nbuffers: u32,
    buffer_size: usize,
    slots: Vec<Mutex<Vec<u8>>>,
    freelist: BoundedQueue<u32>,
    next_counter: AtomicU32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationExhausted;

impl BufferPool {
    /// `nbuffers` must be a power of two.
    pub fn new(nbuffers: u32, buffer_size: usize) -> Self {
        assert!(nbuffers.is_power_of_two(), "nbuffers must be a power of two");
        let freelist = BoundedQueue::new(nbuffers as usize);
        freelist.startup();
        for i in 0..nbuffers {
            freelist.push(i).expect("freelist sized to nbuffers");
        }
        let slots = (0..nbuffers).map(|_| Mutex::new(vec![0u8; buffer_size])).collect();
        Self {
            nbuffers,
            buffer_size,
            slots,
            freelist,
            next_counter: AtomicU32::new(0),
        }
    }

    pub fn nbuffers(&self) -> u32 {
        self.nbuffers
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Never blocks: signals exhaustion instead of waiting for a free buffer.
    pub fn allocate(&self) -> Result<u32, AllocationExhausted> {
        self.freelist.pop().ok_or(AllocationExhausted)
    }

    /// Idempotent-per-index only if called exactly once per prior `allocate`;
    /// calling it without a matching prior allocation is undefined (no
    /// double-free detection, same as the pointer API this mirrors).
    pub fn free(&self, index: u32) {
        let _ = self.freelist.push(index);
    }

    /// Runs `f` with exclusive access to the pebble's backing bytes.
    pub fn with_buffer<R>(&self, index: u32, f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
        let mut guard = self.slots[index as usize].lock();
        f(&mut guard)
    }

    /// Monotonically assigned (modulo N) event counter, standing in for the
    /// driver's event counter used to derive `pgpIndex` in the real DMA path.
    pub fn next_event_counter(&self) -> u32 {
        self.next_counter.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_free_roundtrip() {
        let pool = BufferPool::new(4, 64);
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert_ne!(a, b);
        pool.free(a);
        let c = pool.allocate().unwrap();
        assert_eq!(c, a);
        let _ = b;
    }

    #[test]
    fn exhaustion_never_blocks() {
        let pool = BufferPool::new(2, 8);
        let _a = pool.allocate().unwrap();
        let _b = pool.allocate().unwrap();
        assert_eq!(pool.allocate(), Err(AllocationExhausted));
    }

    #[test]
    fn bounded_queue_peek_does_not_consume() {
        let q: BoundedQueue<u32> = BoundedQueue::new(2);
        q.startup();
        q.push(1).unwrap();
        assert_eq!(q.peek_cloned(), Some(1));
        assert_eq!(q.peek_cloned(), Some(1));
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn bounded_queue_full_is_non_blocking_drop() {
        let q: BoundedQueue<u32> = BoundedQueue::new(1);
        q.startup();
        q.push(1).unwrap();
        assert_eq!(q.push(2), Err(PushError::Full));
    }

    #[test]
    fn shutdown_closes_pushes() {
        let q: BoundedQueue<u32> = BoundedQueue::new(1);
        q.startup();
        q.shutdown();
        assert_eq!(q.push(1), Err(PushError::Closed));
        assert_eq!(q.pop(), None);
    }
}
