//! Bounded Fan-out Queue
//!
//! A consumer-facing queue fed by one shared upstream subscription. The
//! publishing side never blocks: when the buffer is full the configured
//! [`DropPolicy`] decides which value is lost. Receivers are cloneable and
//! compete for items, so one queue can be drained by several tasks.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

/// What to do when a value arrives at a full queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// Discard the incoming value.
    #[default]
    DropNewest,
    /// Discard the oldest buffered value to make room.
    DropOldest,
}

impl std::str::FromStr for DropPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "newest" | "drop_newest" => Ok(Self::DropNewest),
            "oldest" | "drop_oldest" => Ok(Self::DropOldest),
            other => Err(format!("unknown drop policy: {other}")),
        }
    }
}

/// Outcome of a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Buffered without loss.
    Queued,
    /// The incoming value was discarded.
    DroppedNewest,
    /// The oldest buffered value was discarded.
    DroppedOldest,
    /// The queue is closed.
    Closed,
}

/// Error returned by [`StreamReceiver::try_recv`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TryRecvError {
    /// Nothing buffered right now.
    #[error("queue is empty")]
    Empty,
    /// The queue is closed and drained.
    #[error("queue is closed")]
    Closed,
}

struct Shared<T> {
    buffer: Mutex<VecDeque<T>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

/// Publishing half, owned by the router.
pub struct QueueSender<T> {
    shared: Arc<Shared<T>>,
    policy: DropPolicy,
}

/// Consumer handle returned by `watch_*` calls.
pub struct StreamReceiver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for StreamReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> std::fmt::Debug for StreamReceiver<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamReceiver")
            .field("len", &self.len())
            .field("capacity", &self.shared.capacity)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Create a queue holding at most `capacity` values.
#[must_use]
pub fn bounded<T>(capacity: usize, policy: DropPolicy) -> (QueueSender<T>, StreamReceiver<T>) {
    let capacity = capacity.max(1);
    let shared = Arc::new(Shared {
        buffer: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        capacity,
        notify: Notify::new(),
        closed: AtomicBool::new(false),
        dropped: AtomicU64::new(0),
    });
    (
        QueueSender {
            shared: Arc::clone(&shared),
            policy,
        },
        StreamReceiver { shared },
    )
}

impl<T> QueueSender<T> {
    /// Push without blocking, applying the drop policy on overflow.
    pub fn push(&self, value: T) -> PushOutcome {
        if self.shared.closed.load(Ordering::Acquire) {
            return PushOutcome::Closed;
        }

        let outcome = {
            let mut buffer = self.shared.buffer.lock();
            if buffer.len() < self.shared.capacity {
                buffer.push_back(value);
                PushOutcome::Queued
            } else {
                match self.policy {
                    DropPolicy::DropNewest => PushOutcome::DroppedNewest,
                    DropPolicy::DropOldest => {
                        buffer.pop_front();
                        buffer.push_back(value);
                        PushOutcome::DroppedOldest
                    }
                }
            }
        };

        match outcome {
            PushOutcome::Queued => self.shared.notify.notify_one(),
            PushOutcome::DroppedOldest => {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                self.shared.notify.notify_one();
            }
            PushOutcome::DroppedNewest => {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            }
            PushOutcome::Closed => {}
        }
        outcome
    }

    /// A new consumer handle for this queue.
    #[must_use]
    pub fn subscribe(&self) -> StreamReceiver<T> {
        StreamReceiver {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Close the queue. Buffered values stay readable.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_waiters();
    }

    /// Whether the queue is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Overflow policy.
    #[must_use]
    pub const fn policy(&self) -> DropPolicy {
        self.policy
    }
}

impl<T> StreamReceiver<T> {
    /// Wait for the next value.
    ///
    /// Returns `None` once the queue is closed and every buffered value has
    /// been taken.
    pub async fn recv(&self) -> Option<T> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.shared.buffer.lock().pop_front() {
                return Some(value);
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    /// Take a value if one is buffered.
    ///
    /// # Errors
    ///
    /// Returns [`TryRecvError::Empty`] if nothing is buffered, or
    /// [`TryRecvError::Closed`] if the queue is closed and drained.
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        if let Some(value) = self.shared.buffer.lock().pop_front() {
            return Ok(value);
        }
        if self.shared.closed.load(Ordering::Acquire) {
            Err(TryRecvError::Closed)
        } else {
            Err(TryRecvError::Empty)
        }
    }

    /// Whether the queue is closed. Buffered values may remain.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Number of buffered values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.buffer.lock().len()
    }

    /// Whether nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of buffered values.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Values lost to the overflow policy so far.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn drop_newest_keeps_buffered_values() {
        let (tx, rx) = bounded(2, DropPolicy::DropNewest);
        assert_eq!(tx.push(1), PushOutcome::Queued);
        assert_eq!(tx.push(2), PushOutcome::Queued);
        assert_eq!(tx.push(3), PushOutcome::DroppedNewest);

        assert_eq!(rx.try_recv(), Ok(1));
        assert_eq!(rx.try_recv(), Ok(2));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(rx.dropped(), 1);
    }

    #[test]
    fn drop_oldest_makes_room() {
        let (tx, rx) = bounded(2, DropPolicy::DropOldest);
        tx.push(1);
        tx.push(2);
        assert_eq!(tx.push(3), PushOutcome::DroppedOldest);

        assert_eq!(rx.try_recv(), Ok(2));
        assert_eq!(rx.try_recv(), Ok(3));
    }

    #[test]
    fn close_drains_then_reports_closed() {
        let (tx, rx) = bounded(4, DropPolicy::default());
        tx.push("a");
        tx.close();
        assert_eq!(tx.push("b"), PushOutcome::Closed);
        assert!(rx.is_closed());
        assert_eq!(rx.try_recv(), Ok("a"));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Closed));
    }

    #[test]
    fn parse_drop_policy() {
        assert_eq!("oldest".parse::<DropPolicy>(), Ok(DropPolicy::DropOldest));
        assert_eq!("DROP_NEWEST".parse::<DropPolicy>(), Ok(DropPolicy::DropNewest));
        assert!("block".parse::<DropPolicy>().is_err());
    }

    #[tokio::test]
    async fn recv_wakes_on_push() {
        let (tx, rx) = bounded(4, DropPolicy::default());
        let reader = tokio::spawn(async move { rx.recv().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.push(42);

        let value = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .expect("reader should finish")
            .expect("reader task should not panic");
        assert_eq!(value, Some(42));
    }

    #[tokio::test]
    async fn recv_returns_none_after_close() {
        let (tx, rx) = bounded::<u32>(4, DropPolicy::default());
        let reader = tokio::spawn(async move { rx.recv().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.close();

        let value = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .expect("reader should finish")
            .expect("reader task should not panic");
        assert_eq!(value, None);
    }

    #[test]
    fn recv_is_pending_while_empty() {
        let (_tx, rx) = bounded::<u32>(4, DropPolicy::default());
        let mut fut = tokio_test::task::spawn(rx.recv());
        tokio_test::assert_pending!(fut.poll());
    }

    #[test]
    fn cloned_receivers_share_items() {
        let (tx, rx) = bounded(4, DropPolicy::default());
        let other = rx.clone();
        tx.push(1);
        tx.push(2);
        assert_eq!(other.try_recv(), Ok(1));
        assert_eq!(rx.try_recv(), Ok(2));
        assert!(tx.subscribe().is_empty());
    }
}
