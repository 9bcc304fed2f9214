//! Inter-stage FIFO with blocking waits and a stop state.
//!
//! Every pipeline stage blocks in exactly one place: `pop_wait_for` on its
//! input queue. `stop()` wakes all waiters (producers and consumers) and
//! makes further waits return immediately, which is what makes the teardown
//! order in the device deterministic.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Outcome of a timed pop.
#[derive(Debug, PartialEq, Eq)]
pub enum PopResult<T> {
    /// An item was dequeued.
    Item(T),
    /// The wait elapsed without an item arriving.
    Timeout,
    /// The queue was stopped; no more items will be delivered.
    Stopped,
}

impl<T> PopResult<T> {
    /// Unwrap the item, if any.
    pub fn into_item(self) -> Option<T> {
        match self {
            PopResult::Item(item) => Some(item),
            _ => None,
        }
    }
}

struct State<T> {
    queue: VecDeque<T>,
    stopped: bool,
}

/// Multi-producer/multi-consumer FIFO with optional depth bound.
///
/// When a bound is set, `push` blocks producers while the queue is full
/// (pipeline backpressure). Unbounded queues never block producers; slow
/// consumers then show up as memory growth, a trade the configuration
/// surface exposes.
pub struct ConcurrentFifo<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    bound: Option<usize>,
}

impl<T> ConcurrentFifo<T> {
    /// Create an unbounded queue.
    pub fn new() -> Self {
        Self::with_bound(None)
    }

    /// Create a queue that holds at most `capacity` items.
    pub fn bounded(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be greater than 0");
        Self::with_bound(Some(capacity))
    }

    fn with_bound(bound: Option<usize>) -> Self {
        Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                stopped: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            bound,
        }
    }

    /// Enqueue an item, blocking while the queue is at capacity.
    ///
    /// Returns `false` if the queue is (or becomes) stopped; the item is
    /// dropped in that case.
    pub fn push(&self, item: T) -> bool {
        let mut state = self.state.lock();
        if let Some(bound) = self.bound {
            while !state.stopped && state.queue.len() >= bound {
                self.not_full.wait(&mut state);
            }
        }
        if state.stopped {
            return false;
        }
        state.queue.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        true
    }

    /// Dequeue an item, waiting at most `timeout`.
    pub fn pop_wait_for(&self, timeout: Duration) -> PopResult<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.queue.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return PopResult::Item(item);
            }
            if state.stopped {
                return PopResult::Stopped;
            }
            if self.not_empty.wait_for(&mut state, timeout).timed_out() {
                // One more look: an item may have landed right at the deadline.
                return match state.queue.pop_front() {
                    Some(item) => {
                        drop(state);
                        self.not_full.notify_one();
                        PopResult::Item(item)
                    }
                    None if state.stopped => PopResult::Stopped,
                    None => PopResult::Timeout,
                };
            }
        }
    }

    /// Dequeue an item, waiting indefinitely until one arrives or the queue
    /// is stopped.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.queue.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Some(item);
            }
            if state.stopped {
                return None;
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Stop the queue: all current and future waits return `Stopped`/`false`.
    ///
    /// Items already queued remain poppable until `clear` is called; a
    /// stopped queue still drains, it just never blocks.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.stopped = true;
        drop(state);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Re-arm a stopped queue (start of a new run).
    pub fn start(&self) {
        self.state.lock().stopped = false;
    }

    /// Remove and drop all queued items.
    pub fn clear(&self) {
        let drained: VecDeque<T> = {
            let mut state = self.state.lock();
            std::mem::take(&mut state.queue)
        };
        self.not_full.notify_all();
        drop(drained);
    }

    /// Number of items currently queued.
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// True when no items are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for ConcurrentFifo<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_fifo_order() {
        let q = ConcurrentFifo::new();
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.pop_wait_for(Duration::from_millis(10)), PopResult::Item(1));
        assert_eq!(q.pop_wait_for(Duration::from_millis(10)), PopResult::Item(2));
        assert_eq!(q.pop_wait_for(Duration::from_millis(10)), PopResult::Item(3));
    }

    #[test]
    fn test_pop_times_out_when_empty() {
        let q: ConcurrentFifo<u32> = ConcurrentFifo::new();
        let start = Instant::now();
        assert_eq!(q.pop_wait_for(Duration::from_millis(20)), PopResult::Timeout);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_stop_unblocks_waiting_consumer() {
        let q: Arc<ConcurrentFifo<u32>> = Arc::new(ConcurrentFifo::new());
        let q2 = Arc::clone(&q);
        let handle = thread::spawn(move || q2.pop_wait_for(Duration::from_secs(30)));
        thread::sleep(Duration::from_millis(20));
        q.stop();
        assert_eq!(handle.join().unwrap(), PopResult::Stopped);
    }

    #[test]
    fn test_stopped_queue_still_drains() {
        let q = ConcurrentFifo::new();
        q.push(7);
        q.stop();
        assert_eq!(q.pop_wait_for(Duration::from_millis(1)), PopResult::Item(7));
        assert_eq!(q.pop_wait_for(Duration::from_millis(1)), PopResult::Stopped);
    }

    #[test]
    fn test_push_after_stop_is_rejected() {
        let q = ConcurrentFifo::new();
        q.stop();
        assert!(!q.push(1));
        assert!(q.is_empty());
    }

    #[test]
    fn test_bounded_push_blocks_until_pop() {
        let q: Arc<ConcurrentFifo<u32>> = Arc::new(ConcurrentFifo::bounded(2));
        assert!(q.push(1));
        assert!(q.push(2));

        let q2 = Arc::clone(&q);
        let producer = thread::spawn(move || q2.push(3));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(q.len(), 2);

        assert_eq!(q.pop_wait_for(Duration::from_millis(100)), PopResult::Item(1));
        assert!(producer.join().unwrap());
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_stop_unblocks_blocked_producer() {
        let q: Arc<ConcurrentFifo<u32>> = Arc::new(ConcurrentFifo::bounded(1));
        assert!(q.push(1));
        let q2 = Arc::clone(&q);
        let producer = thread::spawn(move || q2.push(2));
        thread::sleep(Duration::from_millis(20));
        q.stop();
        assert!(!producer.join().unwrap());
    }

    #[test]
    fn test_clear_drops_items() {
        let q = ConcurrentFifo::new();
        q.push(1);
        q.push(2);
        q.clear();
        assert!(q.is_empty());
    }
}
