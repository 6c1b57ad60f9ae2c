//! Output Router
//!
//! Owns the consumer-facing queues. Every queue is identified by the scope
//! that produced it (an endpoint client key) plus the stream kind, and is
//! shared by all watchers of that stream. Queues are created on first watch
//! and closed when the last watcher detaches.

mod queue;

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::debug;

pub use queue::{DropPolicy, PushOutcome, QueueSender, StreamReceiver, TryRecvError, bounded};

use crate::domain::orderbook::OrderBook;
use crate::domain::streaming::{
    AccountConfig, Balances, MarkPrices, MyTrade, Position, StreamKind, SymbolKline, Trade,
};
use crate::domain::subscription::WatcherRegistry;
use crate::infrastructure::config::RouterSettings;
use crate::infrastructure::metrics;

// =============================================================================
// Queue Variants
// =============================================================================

/// A queue of any stream kind, as stored by the router.
pub enum OutputQueue {
    /// Order book snapshots.
    OrderBook(QueueSender<OrderBook>),
    /// Public trades.
    Trade(QueueSender<Trade>),
    /// Candles.
    Kline(QueueSender<SymbolKline>),
    /// Mark price tables.
    MarkPrice(QueueSender<MarkPrices>),
    /// Balance snapshots.
    Balance(QueueSender<Balances>),
    /// Position rows.
    Position(QueueSender<Position>),
    /// Own fills.
    MyTrade(QueueSender<MyTrade>),
    /// Account setting changes.
    AccountConfig(QueueSender<AccountConfig>),
}

impl OutputQueue {
    fn close(&self) {
        match self {
            Self::OrderBook(q) => q.close(),
            Self::Trade(q) => q.close(),
            Self::Kline(q) => q.close(),
            Self::MarkPrice(q) => q.close(),
            Self::Balance(q) => q.close(),
            Self::Position(q) => q.close(),
            Self::MyTrade(q) => q.close(),
            Self::AccountConfig(q) => q.close(),
        }
    }
}

/// A payload type that can flow through a router queue.
pub trait StreamItem: Send + 'static + Sized {
    /// Stream kind carried by queues of this type.
    const KIND: StreamKind;

    /// Wrap a typed sender for storage.
    fn wrap(sender: QueueSender<Self>) -> OutputQueue;

    /// Borrow the typed sender back, if the kinds match.
    fn unwrap(queue: &OutputQueue) -> Option<&QueueSender<Self>>;
}

macro_rules! stream_item {
    ($ty:ty, $kind:ident, $variant:ident) => {
        impl StreamItem for $ty {
            const KIND: StreamKind = StreamKind::$kind;

            fn wrap(sender: QueueSender<Self>) -> OutputQueue {
                OutputQueue::$variant(sender)
            }

            fn unwrap(queue: &OutputQueue) -> Option<&QueueSender<Self>> {
                match queue {
                    OutputQueue::$variant(sender) => Some(sender),
                    _ => None,
                }
            }
        }
    };
}

stream_item!(OrderBook, OrderBook, OrderBook);
stream_item!(Trade, Trade, Trade);
stream_item!(SymbolKline, Kline, Kline);
stream_item!(MarkPrices, MarkPrice, MarkPrice);
stream_item!(Balances, Balance, Balance);
stream_item!(Position, Position, Position);
stream_item!(MyTrade, MyTrade, MyTrade);
stream_item!(AccountConfig, AccountConfig, AccountConfig);

// =============================================================================
// Router
// =============================================================================

fn queue_key(scope: &str, kind: StreamKind) -> String {
    format!("{scope}#{}", kind.as_str())
}

/// Registry of output queues and the watchers holding them open.
pub struct OutputRouter {
    settings: RouterSettings,
    queues: Mutex<HashMap<String, OutputQueue>>,
    holders: WatcherRegistry<String>,
}

impl std::fmt::Debug for OutputRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputRouter")
            .field("queues", &self.queues.lock().len())
            .field("holders", &self.holders.stats())
            .finish_non_exhaustive()
    }
}

impl OutputRouter {
    /// Create an empty router.
    #[must_use]
    pub fn new(settings: RouterSettings) -> Self {
        Self {
            settings,
            queues: Mutex::new(HashMap::new()),
            holders: WatcherRegistry::new(),
        }
    }

    /// Get or create the queue for `scope` and attach `watchers` to it.
    ///
    /// `capacity` overrides the configured capacity, but only when the queue
    /// is created by this call.
    pub fn attach<T: StreamItem>(
        &self,
        scope: &str,
        watchers: &[String],
        capacity: Option<usize>,
    ) -> StreamReceiver<T> {
        let key = queue_key(scope, T::KIND);
        let mut queues = self.queues.lock();

        for watcher in watchers {
            self.holders.register(key.clone(), watcher);
        }

        if let Some(sender) = queues.get(&key).and_then(T::unwrap) {
            return sender.subscribe();
        }

        let capacity = capacity
            .filter(|c| *c > 0)
            .unwrap_or_else(|| self.settings.capacity_for(T::KIND));
        let (sender, receiver) = bounded(capacity, self.settings.policy_for(T::KIND));
        debug!(queue = %key, capacity, "Created output queue");
        queues.insert(key, T::wrap(sender));
        receiver
    }

    /// Detach `watchers` from a queue, closing it when none remain.
    ///
    /// Returns `true` if the queue was closed.
    pub fn detach(&self, scope: &str, kind: StreamKind, watchers: &[String]) -> bool {
        let key = queue_key(scope, kind);
        let mut queues = self.queues.lock();

        for watcher in watchers {
            self.holders.unregister(&key, watcher);
        }
        if self.holders.is_active(&key) {
            return false;
        }

        queues.remove(&key).is_some_and(|queue| {
            queue.close();
            debug!(queue = %key, "Closed output queue");
            true
        })
    }

    /// Publish one value without blocking.
    ///
    /// Returns `true` if the value was buffered. Values for streams with no
    /// open queue are discarded.
    pub fn publish<T: StreamItem>(&self, scope: &str, value: T) -> bool {
        let key = queue_key(scope, T::KIND);
        let outcome = {
            let queues = self.queues.lock();
            let Some(sender) = queues.get(&key).and_then(T::unwrap) else {
                return false;
            };
            sender.push(value)
        };

        match outcome {
            PushOutcome::Queued => {
                metrics::record_published(T::KIND, 1);
                true
            }
            PushOutcome::DroppedOldest => {
                metrics::record_published(T::KIND, 1);
                metrics::record_dropped(T::KIND, 1);
                true
            }
            PushOutcome::DroppedNewest => {
                metrics::record_dropped(T::KIND, 1);
                false
            }
            PushOutcome::Closed => false,
        }
    }

    /// Whether a queue is open for `scope` and `kind`.
    #[must_use]
    pub fn is_open(&self, scope: &str, kind: StreamKind) -> bool {
        self.queues.lock().contains_key(&queue_key(scope, kind))
    }

    /// Close every queue produced by `scope`.
    pub fn close_scope(&self, scope: &str) -> usize {
        let prefix = format!("{scope}#");
        let mut queues = self.queues.lock();
        let doomed: Vec<String> = queues
            .keys()
            .filter(|key| key.starts_with(&prefix))
            .cloned()
            .collect();

        for key in &doomed {
            if let Some(queue) = queues.remove(key) {
                queue.close();
            }
            self.holders.remove_key(key);
        }
        doomed.len()
    }

    /// Close every queue.
    pub fn close_all(&self) {
        let mut queues = self.queues.lock();
        for (key, queue) in queues.drain() {
            queue.close();
            self.holders.remove_key(&key);
        }
    }

    /// Number of open queues.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queues.lock().len()
    }

    /// Whether no queue is open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
