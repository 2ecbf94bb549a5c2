//! Priority Request Queue
//!
//! When every node is saturated, requests park here and are released
//! highest-priority-first, FIFO within a priority level. Nothing is ever
//! preempted: a request already being served keeps its node regardless of
//! what arrives later; the queue only orders waiting work.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;

/// A parked request waiting for capacity
struct Waiter {
    priority: u8,
    seq: u64,
    wake: oneshot::Sender<()>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then lower sequence (FIFO).
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Outcome of waiting on the queue
#[derive(Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Capacity became available; re-attempt selection
    Woken,
    /// The wait deadline passed
    TimedOut,
}

/// Priority queue for requests waiting on node capacity
pub struct RequestQueue {
    waiters: Mutex<BinaryHeap<Waiter>>,
    seq: AtomicU64,
    total_queued: AtomicU64,
    total_released: AtomicU64,
}

impl RequestQueue {
    /// Create an empty queue
    #[must_use]
    pub fn new() -> Self {
        Self {
            waiters: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
            total_queued: AtomicU64::new(0),
            total_released: AtomicU64::new(0),
        }
    }

    /// Current number of parked requests
    #[must_use]
    pub fn depth(&self) -> usize {
        self.waiters.lock().len()
    }

    /// Lifetime count of requests that queued
    #[must_use]
    pub fn total_queued(&self) -> u64 {
        self.total_queued.load(AtomicOrdering::Relaxed)
    }

    /// Lifetime count of wakeups delivered
    #[must_use]
    pub fn total_released(&self) -> u64 {
        self.total_released.load(AtomicOrdering::Relaxed)
    }

    /// Park until woken or the deadline passes
    ///
    /// Ties at the same priority wake in arrival order.
    pub async fn wait_turn(&self, priority: u8, deadline: Instant) -> WaitOutcome {
        let (tx, rx) = oneshot::channel();
        {
            let mut waiters = self.waiters.lock();
            let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
            waiters.push(Waiter {
                priority,
                seq,
                wake: tx,
            });
        }
        self.total_queued.fetch_add(1, AtomicOrdering::Relaxed);

        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, rx).await {
            Ok(Ok(())) => WaitOutcome::Woken,
            // Sender dropped (queue torn down) or timed out: the stale
            // waiter entry is skipped by wake_next when its channel is
            // closed.
            Ok(Err(_)) | Err(_) => WaitOutcome::TimedOut,
        }
    }

    /// Wake the highest-priority waiter, if any
    ///
    /// Waiters whose receiver is gone (timed out) are discarded in passing.
    pub fn wake_next(&self) {
        let mut waiters = self.waiters.lock();
        while let Some(waiter) = waiters.pop() {
            if waiter.wake.send(()).is_ok() {
                self.total_released.fetch_add(1, AtomicOrdering::Relaxed);
                return;
            }
        }
    }

    /// Convenience for deadline construction
    #[must_use]
    pub fn deadline_after(timeout: Duration) -> Instant {
        Instant::now() + timeout
    }
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_higher_priority_wakes_first() {
        let queue = std::sync::Arc::new(RequestQueue::new());
        let deadline = RequestQueue::deadline_after(Duration::from_secs(5));

        let q = queue.clone();
        let low = tokio::spawn(async move { q.wait_turn(2, deadline).await });
        // Make sure the low-priority waiter is parked first.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let q = queue.clone();
        let high = tokio::spawn(async move { q.wait_turn(9, deadline).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(queue.depth(), 2);

        // One wakeup: the high-priority waiter goes first despite arriving
        // second.
        queue.wake_next();
        let outcome = high.await.unwrap();
        assert_eq!(outcome, WaitOutcome::Woken);
        assert!(!low.is_finished());

        queue.wake_next();
        assert_eq!(low.await.unwrap(), WaitOutcome::Woken);
    }

    #[tokio::test]
    async fn test_fifo_within_equal_priority() {
        let queue = std::sync::Arc::new(RequestQueue::new());
        let deadline = RequestQueue::deadline_after(Duration::from_secs(5));

        let q = queue.clone();
        let first = tokio::spawn(async move { q.wait_turn(5, deadline).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let q = queue.clone();
        let second = tokio::spawn(async move { q.wait_turn(5, deadline).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        queue.wake_next();
        assert_eq!(first.await.unwrap(), WaitOutcome::Woken);
        assert!(!second.is_finished());

        queue.wake_next();
        assert_eq!(second.await.unwrap(), WaitOutcome::Woken);
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let queue = RequestQueue::new();
        let deadline = RequestQueue::deadline_after(Duration::from_millis(30));
        let outcome = queue.wait_turn(5, deadline).await;
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_wake_skips_timed_out_waiters() {
        let queue = std::sync::Arc::new(RequestQueue::new());

        // This waiter times out almost immediately but leaves its heap entry.
        let q = queue.clone();
        let stale = tokio::spawn(async move {
            q.wait_turn(9, RequestQueue::deadline_after(Duration::from_millis(10)))
                .await
        });
        stale.await.unwrap();

        let q = queue.clone();
        let live = tokio::spawn(async move {
            q.wait_turn(1, RequestQueue::deadline_after(Duration::from_secs(5)))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The wakeup must fall through the dead high-priority entry to the
        // live low-priority one.
        queue.wake_next();
        assert_eq!(live.await.unwrap(), WaitOutcome::Woken);
    }
}
