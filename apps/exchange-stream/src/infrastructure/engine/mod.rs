//! Stream Engine
//!
//! One exchange instance: the endpoint clients, the watcher registries, the
//! output router, the local order books and mark-price tables, the auth
//! coordinator and the keepalive supervisor. Every map is owned by the
//! engine and guarded by its own lock.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐   watch_*()    ┌──────────────┐   subscribe   ┌──────────────┐
//! │    Callers      │ ─────────────► │ StreamEngine │ ────────────► │   WsClient   │
//! │ (StreamReceiver)│ ◄───────────── │   (router)   │               │ (connections)│
//! └─────────────────┘    publish     └──────────────┘               └──────────────┘
//!                                           ▲                              │
//!                                           │ InboundEvent                 │ units
//!                                    ┌──────────────┐                      │
//!                                    │  Dispatcher  │ ◄────────────────────┘
//!                                    └──────────────┘
//! ```
//!
//! The supervisor task consumes keepalive ticks and connection-closed
//! events; it pings, resubscribes silent keys and replaces dropped
//! connections.

mod dispatch;
mod supervisor;
mod watch;

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub use watch::WatchOptions;

use self::dispatch::Dispatcher;
use crate::application::ports::{EndpointScope, ExchangeProtocol, MarketCatalog};
use crate::domain::account::LeverageBook;
use crate::domain::orderbook::{OrderBook, OrderBookStore};
use crate::domain::streaming::{MarkPrices, MarketType, StreamKind, Symbol};
use crate::domain::subscription::{SubscriptionKey, SubscriptionStat, WatcherRegistry};
use crate::infrastructure::config::EngineConfig;
use crate::infrastructure::router::OutputRouter;
use crate::infrastructure::ws::{
    AuthCoordinator, ConnectionEvent, FrameHandler, KeepaliveTimer, WsClient, client_key, now_ms,
};

// =============================================================================
// Shared State
// =============================================================================

/// One endpoint client with the watchers relying on its keys.
struct ClientEntry {
    client: WsClient,
    market_type: MarketType,
    watchers: WatcherRegistry<SubscriptionKey>,
    leverages: Mutex<LeverageBook>,
    /// Serializes watch and unwatch calls on this endpoint.
    gate: tokio::sync::Mutex<()>,
}

/// Local state owned by a subscription key.
#[derive(Debug, Clone, PartialEq, Eq)]
struct LocalBinding {
    symbol: Symbol,
    kind: StreamKind,
}

type ScopedKey = (Arc<str>, SubscriptionKey);

struct Inner {
    protocol: Arc<dyn ExchangeProtocol>,
    markets: Arc<dyn MarketCatalog>,
    config: EngineConfig,
    clients: RwLock<HashMap<String, Arc<ClientEntry>>>,
    router: OutputRouter,
    books: OrderBookStore,
    mark_prices: RwLock<HashMap<MarketType, MarkPrices>>,
    local: Mutex<HashMap<ScopedKey, LocalBinding>>,
    auth: AuthCoordinator,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    handler: Arc<dyn FrameHandler>,
    cancel: CancellationToken,
}

impl Inner {
    fn client(&self, key: &str) -> Option<Arc<ClientEntry>> {
        self.clients.read().get(key).cloned()
    }

    fn entries(&self) -> Vec<Arc<ClientEntry>> {
        self.clients.read().values().cloned().collect()
    }

    /// Get or create the client for an endpoint.
    fn client_for(
        &self,
        scope: EndpointScope,
        url: &str,
        market_type: MarketType,
        account: &str,
    ) -> Arc<ClientEntry> {
        let key = client_key(scope, account, url);
        if let Some(entry) = self.client(&key) {
            return entry;
        }

        let mut clients = self.clients.write();
        Arc::clone(clients.entry(key).or_insert_with_key(|key| {
            info!(client = %key, %market_type, "Creating endpoint client");
            Arc::new(ClientEntry {
                client: WsClient::new(
                    url.to_string(),
                    scope,
                    scope.requires_login().then(|| account.to_string()),
                    Arc::clone(&self.protocol),
                    self.config.connection.clone(),
                    Arc::clone(&self.handler),
                    self.events.clone(),
                ),
                market_type,
                watchers: WatcherRegistry::new(),
                leverages: Mutex::new(LeverageBook::new()),
                gate: tokio::sync::Mutex::new(()),
            })
        }))
    }

    /// Record local state owned by `key`.
    fn bind_local(&self, client: &str, key: &SubscriptionKey, binding: LocalBinding) {
        self.local
            .lock()
            .insert((Arc::from(client), key.clone()), binding);
    }

    /// The key another watch already uses for a symbol's local state.
    fn local_key_of(&self, symbol: &str, kind: StreamKind) -> Option<SubscriptionKey> {
        self.local
            .lock()
            .iter()
            .find(|(_, b)| b.kind == kind && b.symbol == symbol)
            .map(|((_, key), _)| key.clone())
    }

    /// Drop the books and mark prices owned by keys that lost their watchers.
    fn evict(&self, client: &str, keys: &[SubscriptionKey]) {
        let evicted: Vec<LocalBinding> = {
            let mut local = self.local.lock();
            keys.iter()
                .filter_map(|key| local.remove(&(Arc::from(client), key.clone())))
                .collect()
        };
        for binding in evicted {
            self.evict_binding(&binding);
        }
    }

    /// Drop all local state of a client.
    fn evict_client(&self, client: &str) {
        let evicted: Vec<LocalBinding> = {
            let mut local = self.local.lock();
            let doomed: Vec<ScopedKey> = local
                .keys()
                .filter(|(owner, _)| owner.as_ref() == client)
                .cloned()
                .collect();
            doomed.iter().filter_map(|k| local.remove(k)).collect()
        };
        for binding in evicted {
            self.evict_binding(&binding);
        }
    }

    fn evict_binding(&self, binding: &LocalBinding) {
        match binding.kind {
            StreamKind::OrderBook => {
                self.books.remove(&binding.symbol);
                debug!(symbol = %binding.symbol, "Evicted order book");
            }
            StreamKind::MarkPrice => {
                for table in self.mark_prices.write().values_mut() {
                    table.remove(&binding.symbol);
                }
            }
            _ => {}
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Subscription statistics of one endpoint client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointStats {
    /// Client key (endpoint URL, prefixed by the account for private ones).
    pub client: String,
    /// Live connections.
    pub connections: usize,
    /// Per-key placement and activity.
    pub subscriptions: Vec<SubscriptionStat>,
    /// Keys silent beyond the protocol's tolerance.
    pub stale: Vec<SubscriptionKey>,
}

// =============================================================================
// Engine
// =============================================================================

/// Streaming engine for one exchange.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use exchange_stream::{EngineConfig, OkxProtocol, StaticMarketCatalog, StreamEngine, WatchOptions};
///
/// # async fn demo() -> Result<(), exchange_stream::StreamError> {
/// let markets = StaticMarketCatalog::spot(&["BTC/USDT".to_string()], "-");
/// let engine = StreamEngine::new(
///     Arc::new(OkxProtocol::new()),
///     Arc::new(markets),
///     EngineConfig::default(),
/// );
///
/// let books = engine
///     .watch_order_books(&["BTC/USDT"], &WatchOptions::default().with_depth(5))
///     .await?;
/// while let Some(book) = books.recv().await {
///     println!("{:?}", book.best_bid());
/// }
/// # Ok(())
/// # }
/// ```
pub struct StreamEngine {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for StreamEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamEngine")
            .field("exchange", &self.inner.protocol.name())
            .field("clients", &self.inner.clients.read().len())
            .field("router", &self.inner.router)
            .finish_non_exhaustive()
    }
}

impl StreamEngine {
    /// Create an engine and start its keepalive supervisor.
    ///
    /// No connection is opened until the first watch.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn new(
        protocol: Arc<dyn ExchangeProtocol>,
        markets: Arc<dyn MarketCatalog>,
        config: EngineConfig,
    ) -> Self {
        let (events, event_rx) = mpsc::unbounded_channel();
        let (keepalive_tx, keepalive_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| Inner {
            router: OutputRouter::new(config.router.clone()),
            books: OrderBookStore::new(config.order_book.default_depth),
            auth: AuthCoordinator::new(config.auth.login_timeout),
            handler: Arc::new(Dispatcher::new(weak.clone())),
            protocol,
            markets,
            config,
            clients: RwLock::new(HashMap::new()),
            mark_prices: RwLock::new(HashMap::new()),
            local: Mutex::new(HashMap::new()),
            events,
            cancel: cancel.clone(),
        });

        tokio::spawn(
            KeepaliveTimer::new(inner.config.keepalive.clone(), keepalive_tx, cancel.clone()).run(),
        );
        tokio::spawn(supervisor::run(
            Arc::downgrade(&inner),
            keepalive_rx,
            event_rx,
            cancel,
        ));

        info!(exchange = inner.protocol.name(), "Stream engine started");
        Self { inner }
    }

    /// Exchange name.
    #[must_use]
    pub fn exchange(&self) -> &'static str {
        self.inner.protocol.name()
    }

    /// Copy of a symbol's local order book.
    #[must_use]
    pub fn order_book(&self, symbol: &str) -> Option<OrderBook> {
        self.inner.books.snapshot(symbol)
    }

    /// Run a depth query against a symbol's book under its lock.
    pub fn with_order_book<R>(&self, symbol: &str, query: impl FnOnce(&OrderBook) -> R) -> Option<R> {
        self.inner.books.with_book(symbol, query)
    }

    /// Latest mark price of a symbol.
    #[must_use]
    pub fn mark_price(&self, symbol: &str) -> Option<Decimal> {
        self.inner
            .mark_prices
            .read()
            .values()
            .find_map(|table| table.get(symbol).copied())
    }

    /// Subscription statistics per endpoint client, sorted by client key.
    #[must_use]
    pub fn subscription_stats(&self) -> Vec<EndpointStats> {
        let now = now_ms();
        let mut stats: Vec<EndpointStats> = self
            .inner
            .entries()
            .iter()
            .map(|entry| EndpointStats {
                client: entry.client.key().to_string(),
                connections: entry.client.connections().len(),
                subscriptions: entry.client.stats(now),
                stale: entry
                    .client
                    .stale_keys(now)
                    .into_iter()
                    .map(|(_, key)| key)
                    .collect(),
            })
            .collect();
        stats.sort_by(|a, b| a.client.cmp(&b.client));
        stats
    }

    /// Close every connection and output queue and stop the supervisor.
    pub fn close(&self) {
        self.inner.cancel.cancel();
        let entries: Vec<Arc<ClientEntry>> =
            self.inner.clients.write().drain().map(|(_, e)| e).collect();
        for entry in &entries {
            entry.client.close();
            self.inner.auth.forget(entry.client.key());
        }
        self.inner.router.close_all();
        self.inner.local.lock().clear();
        info!(exchange = self.inner.protocol.name(), clients = entries.len(), "Stream engine closed");
    }
}

impl Drop for StreamEngine {
    fn drop(&mut self) {
        if !self.inner.cancel.is_cancelled() {
            self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::{CatalogError, MockMarketCatalog};
    use crate::error::StreamError;
    use crate::infrastructure::exchange::OkxProtocol;

    fn engine(markets: MockMarketCatalog) -> StreamEngine {
        StreamEngine::new(
            Arc::new(OkxProtocol::with_base_url("ws://127.0.0.1:9")),
            Arc::new(markets),
            EngineConfig::default(),
        )
    }

    #[tokio::test]
    async fn catalog_load_failure_is_returned_before_dialing() {
        let mut markets = MockMarketCatalog::new();
        markets
            .expect_load_markets()
            .times(1)
            .returning(|| Err(CatalogError::LoadFailed("offline".into())));
        markets.expect_market().never();
        let engine = engine(markets);

        let err = engine
            .watch_trades(&["BTC/USDT"], &WatchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::Market(CatalogError::LoadFailed(_))));
        assert!(engine.subscription_stats().is_empty());
    }

    #[tokio::test]
    async fn unwatch_of_unknown_endpoint_is_a_noop() {
        let mut markets = MockMarketCatalog::new();
        markets.expect_market().returning(|symbol| {
            Ok(crate::application::ports::MarketInfo {
                symbol: symbol.to_string(),
                wire_id: symbol.replace('/', "-"),
                market_type: MarketType::Spot,
                base: "BTC".into(),
                quote: "USDT".into(),
            })
        });
        let engine = engine(markets);

        engine
            .unwatch_trades(&["BTC/USDT"], &WatchOptions::default())
            .await
            .unwrap();
        assert!(engine.subscription_stats().is_empty());
        assert!(engine.order_book("BTC/USDT").is_none());
        assert!(engine.mark_price("BTC/USDT").is_none());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let engine = engine(MockMarketCatalog::new());
        engine.close();
        engine.close();
        assert!(engine.inner.cancel.is_cancelled());
    }
}
