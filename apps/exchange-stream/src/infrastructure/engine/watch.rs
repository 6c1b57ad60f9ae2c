//! Watch and unwatch operations.
//!
//! A watch resolves its symbols, binds them to subscription keys on a
//! single endpoint, attaches the caller to the shared output queue and
//! subscribes the keys that gained their first watcher. An unwatch mirrors
//! it: keys that lose their last watcher are unsubscribed and their local
//! state is evicted.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use super::{ClientEntry, Inner, LocalBinding, StreamEngine};
use crate::application::ports::{ChannelBinding, ChannelRequest};
use crate::domain::account::Credentials;
use crate::domain::streaming::{
    AccountConfig, Balances, MarkPrices, MarketType, MyTrade, Position, StreamKind, Symbol,
    SymbolKline, Trade,
};
use crate::domain::orderbook::OrderBook;
use crate::domain::subscription::SubscriptionKey;
use crate::error::StreamError;
use crate::infrastructure::metrics;
use crate::infrastructure::router::{StreamItem, StreamReceiver};
use crate::infrastructure::ws::{AuthError, ConnectionHandle};

// =============================================================================
// Options
// =============================================================================

/// Options recognized by watch and unwatch calls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchOptions {
    /// Queue capacity, used only when the call creates the queue.
    pub capacity: Option<usize>,
    /// Account of a private stream; the configured default otherwise.
    pub account: Option<String>,
    /// Caller name. Watchers of different callers are counted separately.
    pub watcher: Option<String>,
    /// Market type filter for position and own-trade streams.
    pub market_type: Option<MarketType>,
    /// Order book depth; the configured default otherwise.
    pub depth: Option<usize>,
}

impl WatchOptions {
    /// Set the order book depth.
    #[must_use]
    pub const fn with_depth(mut self, depth: usize) -> Self {
        self.depth = Some(depth);
        self
    }

    /// Set the queue capacity.
    #[must_use]
    pub const fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Set the account.
    #[must_use]
    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.account = Some(account.into());
        self
    }

    /// Set the caller name.
    #[must_use]
    pub fn with_watcher(mut self, watcher: impl Into<String>) -> Self {
        self.watcher = Some(watcher.into());
        self
    }

    /// Set the market type filter.
    #[must_use]
    pub const fn with_market_type(mut self, market_type: MarketType) -> Self {
        self.market_type = Some(market_type);
        self
    }

    fn watcher_name(&self, name: &str) -> String {
        match &self.watcher {
            Some(caller) => format!("{caller}:{name}"),
            None => name.to_string(),
        }
    }
}

// =============================================================================
// Interests
// =============================================================================

/// One unit of a watch call before binding.
struct Interest {
    request: ChannelRequest,
    /// Watcher name relying on the key.
    name: String,
    /// Symbol whose local state the key owns.
    local: Option<Symbol>,
    /// Key already bound for `local`, overriding the derived one.
    key: Option<SubscriptionKey>,
}

/// Interests bound to keys on one endpoint.
struct Plan {
    entry: Arc<ClientEntry>,
    pairs: Vec<(SubscriptionKey, String)>,
    locals: Vec<(SubscriptionKey, Symbol)>,
}

impl Plan {
    fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pairs.iter().map(|(_, n)| n.clone()).collect();
        names.sort();
        names.dedup();
        names
    }

    fn pairs(&self) -> impl Iterator<Item = (SubscriptionKey, &str)> {
        self.pairs.iter().map(|(k, n)| (k.clone(), n.as_str()))
    }
}

impl Inner {
    /// Bind interests to keys and find the endpoint serving all of them.
    fn plan(
        &self,
        interests: Vec<Interest>,
        options: &WatchOptions,
        create: bool,
    ) -> Result<Option<Plan>, StreamError> {
        if interests.is_empty() {
            return Err(StreamError::ParamRequired("symbols".into()));
        }

        let mut endpoint: Option<(ChannelBinding, String)> = None;
        let mut pairs = Vec::with_capacity(interests.len());
        let mut locals = Vec::new();
        for interest in interests {
            let binding = self.protocol.bind(&interest.request)?;
            let url = self.protocol.endpoint_url(binding.scope, binding.market_type)?;
            if let Some((first, first_url)) = &endpoint
                && (first.scope != binding.scope || *first_url != url)
            {
                return Err(StreamError::ParamInvalid(format!(
                    "{} and {} are served by different endpoints",
                    first.key, binding.key
                )));
            }
            if endpoint.is_none() {
                endpoint = Some((binding.clone(), url));
            }
            let key = interest.key.unwrap_or(binding.key);
            if let Some(symbol) = interest.local {
                locals.push((key.clone(), symbol));
            }
            pairs.push((key, interest.name));
        }

        let Some((binding, url)) = endpoint else {
            return Err(StreamError::ParamRequired("symbols".into()));
        };
        let account = options
            .account
            .as_deref()
            .unwrap_or(&self.config.default_account);
        let key = crate::infrastructure::ws::client_key(binding.scope, account, &url);

        let entry = if create {
            self.client_for(binding.scope, &url, binding.market_type, account)
        } else {
            match self.client(&key) {
                Some(entry) => entry,
                None => return Ok(None),
            }
        };
        Ok(Some(Plan {
            entry,
            pairs,
            locals,
        }))
    }

    /// Log a private client in, sharing any login already in flight.
    async fn ensure_login(&self, entry: &ClientEntry) -> Result<(), StreamError> {
        let credentials = self.credentials_for(entry)?;
        let conn = entry.client.primary().await?;
        self.login_on(entry, conn, credentials).await
    }

    /// Credentials of a private client's account.
    pub(super) fn credentials_for(&self, entry: &ClientEntry) -> Result<Credentials, AuthError> {
        let account = entry
            .client
            .account()
            .unwrap_or(&self.config.default_account);
        self.config
            .accounts
            .get(account)
            .cloned()
            .ok_or_else(|| AuthError::MissingCredentials(account.to_string()))
    }

    /// Log in on a specific connection of a private client.
    pub(super) async fn login_on(
        &self,
        entry: &ClientEntry,
        conn: ConnectionHandle,
        credentials: Credentials,
    ) -> Result<(), StreamError> {
        let protocol = Arc::clone(&self.protocol);
        let outcome = self
            .auth
            .ensure_login(entry.client.key(), move || async move {
                let frame = protocol
                    .login_frame(&credentials, Utc::now())
                    .map_err(|e| AuthError::Signing(e.to_string()))?;
                conn.write(frame, None)
                    .await
                    .map_err(|_| AuthError::SendFailed)
            })
            .await;

        if matches!(outcome, Err(AuthError::Timeout)) {
            metrics::record_login(self.protocol.name(), "timeout");
        }
        outcome.map_err(StreamError::from)
    }

    async fn watch<T: StreamItem>(
        &self,
        interests: Vec<Interest>,
        options: &WatchOptions,
    ) -> Result<StreamReceiver<T>, StreamError> {
        let Some(plan) = self.plan(interests, options, true)? else {
            return Err(StreamError::ParamRequired("symbols".into()));
        };
        let entry = &plan.entry;
        let client = entry.client.key().to_string();
        let kind = T::KIND;

        if entry.client.scope().requires_login() {
            self.ensure_login(entry).await?;
        }

        let _gate = entry.gate.lock().await;

        if kind == StreamKind::OrderBook {
            for (key, symbol) in &plan.locals {
                if let Some(existing) = self.local_key_of(symbol, StreamKind::OrderBook)
                    && existing != *key
                {
                    return Err(StreamError::ParamInvalid(format!(
                        "{symbol} is already watched through {existing}"
                    )));
                }
            }
        }

        let names = plan.names();
        let receiver = self.router.attach::<T>(&client, &names, options.capacity);
        let first = entry.watchers.register_many(plan.pairs());
        for (key, symbol) in &plan.locals {
            self.bind_local(
                &client,
                key,
                LocalBinding {
                    symbol: symbol.clone(),
                    kind,
                },
            );
        }

        if first.is_empty() {
            debug!(client = %client, stream = %kind, "Joined existing subscriptions");
            return Ok(receiver);
        }
        if let Err(e) = entry.client.subscribe(&first).await {
            warn!(client = %client, stream = %kind, error = %e, "Subscribe failed, rolling back");
            let last = entry.watchers.unregister_many(plan.pairs());
            self.router.detach(&client, kind, &names);
            self.evict(&client, &last);
            return Err(e.into());
        }
        debug!(client = %client, stream = %kind, keys = first.len(), "Subscribed");
        Ok(receiver)
    }

    async fn unwatch(
        &self,
        kind: StreamKind,
        interests: Vec<Interest>,
        options: &WatchOptions,
    ) -> Result<(), StreamError> {
        // Symbols with local state unwatch the key they were watched through,
        // whatever depth the options name.
        let interests = interests
            .into_iter()
            .map(|mut interest| {
                if let Some(symbol) = &interest.local {
                    interest.key = self.local_key_of(symbol, kind);
                }
                interest
            })
            .collect();
        let Some(plan) = self.plan(interests, options, false)? else {
            return Ok(());
        };
        let entry = &plan.entry;
        let client = entry.client.key().to_string();

        let _gate = entry.gate.lock().await;
        let last = entry.watchers.unregister_many(plan.pairs());
        self.router.detach(&client, kind, &plan.names());
        if last.is_empty() {
            return Ok(());
        }

        self.evict(&client, &last);
        entry.client.unsubscribe(&last).await?;
        debug!(client = %client, stream = %kind, keys = last.len(), "Unsubscribed");
        Ok(())
    }

    fn market_interests(
        &self,
        symbols: &[&str],
        options: &WatchOptions,
        keep_local: bool,
        request: impl Fn(crate::application::ports::MarketInfo) -> ChannelRequest,
    ) -> Result<Vec<Interest>, StreamError> {
        symbols
            .iter()
            .map(|symbol| {
                let market = self.markets.market(symbol)?;
                Ok(Interest {
                    request: request(market),
                    name: options.watcher_name(symbol),
                    local: keep_local.then(|| (*symbol).to_string()),
                    key: None,
                })
            })
            .collect()
    }

    fn kline_interests(
        &self,
        jobs: &[(&str, &str)],
        options: &WatchOptions,
    ) -> Result<Vec<Interest>, StreamError> {
        jobs.iter()
            .map(|(symbol, timeframe)| {
                let market = self.markets.market(symbol)?;
                Ok(Interest {
                    request: ChannelRequest::Kline {
                        market,
                        timeframe: (*timeframe).to_string(),
                    },
                    name: options.watcher_name(&format!("{symbol}@{timeframe}")),
                    local: None,
                    key: None,
                })
            })
            .collect()
    }

    fn account_interest(
        &self,
        kind: StreamKind,
        symbol: Option<&str>,
        options: &WatchOptions,
    ) -> Result<Vec<Interest>, StreamError> {
        let request = match kind {
            StreamKind::Balance => ChannelRequest::Balance,
            StreamKind::Position | StreamKind::AccountConfig => ChannelRequest::Positions {
                market_type: options.market_type,
            },
            _ => ChannelRequest::MyTrades {
                market: symbol.map(|s| self.markets.market(s)).transpose()?,
                market_type: options.market_type,
            },
        };
        let name = match (symbol, options.market_type) {
            (Some(symbol), _) => format!("{kind}:{symbol}"),
            (None, Some(market_type)) => format!("{kind}:{market_type}"),
            (None, None) => kind.to_string(),
        };
        Ok(vec![Interest {
            request,
            name: options.watcher_name(&name),
            local: None,
            key: None,
        }])
    }

    fn depth_for(&self, options: &WatchOptions) -> usize {
        options.depth.unwrap_or(self.config.order_book.default_depth)
    }
}

// =============================================================================
// Public Surface
// =============================================================================

impl StreamEngine {
    /// Watch the order books of `symbols`.
    ///
    /// The queue yields a copy of a symbol's book after every update,
    /// holding at most the requested depth per side.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::ParamRequired`] for an empty symbol list,
    /// [`StreamError::ParamInvalid`] for an unsupported depth, for symbols on
    /// different endpoints, or for a symbol already watched at a depth
    /// served by another channel, and connection errors from subscribing.
    pub async fn watch_order_books(
        &self,
        symbols: &[&str],
        options: &WatchOptions,
    ) -> Result<StreamReceiver<OrderBook>, StreamError> {
        self.inner.markets.load_markets().await?;
        let depth = self.inner.depth_for(options);
        let interests = self.inner.market_interests(symbols, options, true, |market| {
            ChannelRequest::OrderBook { market, depth }
        })?;
        let receiver = self.inner.watch(interests, options).await?;
        for symbol in symbols {
            self.inner.books.set_limit(symbol, depth);
        }
        Ok(receiver)
    }

    /// Stop watching the order books of `symbols`.
    ///
    /// # Errors
    ///
    /// Returns an error if a symbol is unknown or the unsubscribe frame
    /// cannot be sent.
    pub async fn unwatch_order_books(
        &self,
        symbols: &[&str],
        options: &WatchOptions,
    ) -> Result<(), StreamError> {
        let depth = self.inner.depth_for(options);
        let interests = self.inner.market_interests(symbols, options, true, |market| {
            ChannelRequest::OrderBook { market, depth }
        })?;
        self.inner
            .unwatch(StreamKind::OrderBook, interests, options)
            .await
    }

    /// Watch public trades of `symbols`.
    ///
    /// # Errors
    ///
    /// See [`StreamEngine::watch_order_books`].
    pub async fn watch_trades(
        &self,
        symbols: &[&str],
        options: &WatchOptions,
    ) -> Result<StreamReceiver<Trade>, StreamError> {
        self.inner.markets.load_markets().await?;
        let interests = self.inner.market_interests(symbols, options, false, |market| {
            ChannelRequest::Trades { market }
        })?;
        self.inner.watch(interests, options).await
    }

    /// Stop watching public trades of `symbols`.
    ///
    /// # Errors
    ///
    /// See [`StreamEngine::unwatch_order_books`].
    pub async fn unwatch_trades(
        &self,
        symbols: &[&str],
        options: &WatchOptions,
    ) -> Result<(), StreamError> {
        let interests = self.inner.market_interests(symbols, options, false, |market| {
            ChannelRequest::Trades { market }
        })?;
        self.inner.unwatch(StreamKind::Trade, interests, options).await
    }

    /// Watch candles for `(symbol, timeframe)` jobs.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::ParamInvalid`] for an unsupported timeframe;
    /// otherwise see [`StreamEngine::watch_order_books`].
    pub async fn watch_ohlcvs(
        &self,
        jobs: &[(&str, &str)],
        options: &WatchOptions,
    ) -> Result<StreamReceiver<SymbolKline>, StreamError> {
        self.inner.markets.load_markets().await?;
        let interests = self.inner.kline_interests(jobs, options)?;
        self.inner.watch(interests, options).await
    }

    /// Stop watching candles for `(symbol, timeframe)` jobs.
    ///
    /// # Errors
    ///
    /// See [`StreamEngine::unwatch_order_books`].
    pub async fn unwatch_ohlcvs(
        &self,
        jobs: &[(&str, &str)],
        options: &WatchOptions,
    ) -> Result<(), StreamError> {
        let interests = self.inner.kline_interests(jobs, options)?;
        self.inner.unwatch(StreamKind::Kline, interests, options).await
    }

    /// Watch mark prices of `symbols`.
    ///
    /// The queue yields the mark-price table of the endpoint's market type
    /// after every update.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::NotSupported`] for markets without a mark
    /// price; otherwise see [`StreamEngine::watch_order_books`].
    pub async fn watch_mark_prices(
        &self,
        symbols: &[&str],
        options: &WatchOptions,
    ) -> Result<StreamReceiver<MarkPrices>, StreamError> {
        self.inner.markets.load_markets().await?;
        let interests = self.inner.market_interests(symbols, options, true, |market| {
            ChannelRequest::MarkPrice { market }
        })?;
        self.inner.watch(interests, options).await
    }

    /// Stop watching mark prices of `symbols`.
    ///
    /// # Errors
    ///
    /// See [`StreamEngine::unwatch_order_books`].
    pub async fn unwatch_mark_prices(
        &self,
        symbols: &[&str],
        options: &WatchOptions,
    ) -> Result<(), StreamError> {
        let interests = self.inner.market_interests(symbols, options, true, |market| {
            ChannelRequest::MarkPrice { market }
        })?;
        self.inner
            .unwatch(StreamKind::MarkPrice, interests, options)
            .await
    }

    /// Watch account balances.
    ///
    /// Logs the account in first; concurrent callers share one login.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Unauthorized`] when the account has no
    /// credentials or the login is rejected, and [`StreamError::Timeout`]
    /// when no login result arrives in time.
    pub async fn watch_balance(
        &self,
        options: &WatchOptions,
    ) -> Result<StreamReceiver<Balances>, StreamError> {
        self.inner.markets.load_markets().await?;
        let interests = self
            .inner
            .account_interest(StreamKind::Balance, None, options)?;
        self.inner.watch(interests, options).await
    }

    /// Stop watching account balances.
    ///
    /// # Errors
    ///
    /// Returns an error if the unsubscribe frame cannot be sent.
    pub async fn unwatch_balance(&self, options: &WatchOptions) -> Result<(), StreamError> {
        let interests = self
            .inner
            .account_interest(StreamKind::Balance, None, options)?;
        self.inner
            .unwatch(StreamKind::Balance, interests, options)
            .await
    }

    /// Watch open positions, optionally of one market type.
    ///
    /// # Errors
    ///
    /// See [`StreamEngine::watch_balance`].
    pub async fn watch_positions(
        &self,
        options: &WatchOptions,
    ) -> Result<StreamReceiver<Position>, StreamError> {
        self.inner.markets.load_markets().await?;
        let interests = self
            .inner
            .account_interest(StreamKind::Position, None, options)?;
        self.inner.watch(interests, options).await
    }

    /// Stop watching open positions.
    ///
    /// # Errors
    ///
    /// See [`StreamEngine::unwatch_balance`].
    pub async fn unwatch_positions(&self, options: &WatchOptions) -> Result<(), StreamError> {
        let interests = self
            .inner
            .account_interest(StreamKind::Position, None, options)?;
        self.inner
            .unwatch(StreamKind::Position, interests, options)
            .await
    }

    /// Watch account-config changes, optionally of one market type.
    ///
    /// Rides the position channel: a row is emitted the first time a
    /// symbol's leverage is seen and whenever it changes.
    ///
    /// # Errors
    ///
    /// See [`StreamEngine::watch_balance`].
    pub async fn watch_account_config(
        &self,
        options: &WatchOptions,
    ) -> Result<StreamReceiver<AccountConfig>, StreamError> {
        self.inner.markets.load_markets().await?;
        let interests = self
            .inner
            .account_interest(StreamKind::AccountConfig, None, options)?;
        self.inner.watch(interests, options).await
    }

    /// Stop watching account-config changes.
    ///
    /// # Errors
    ///
    /// See [`StreamEngine::unwatch_balance`].
    pub async fn unwatch_account_config(&self, options: &WatchOptions) -> Result<(), StreamError> {
        let interests = self
            .inner
            .account_interest(StreamKind::AccountConfig, None, options)?;
        self.inner
            .unwatch(StreamKind::AccountConfig, interests, options)
            .await
    }

    /// Watch own fills, optionally of one symbol.
    ///
    /// # Errors
    ///
    /// See [`StreamEngine::watch_balance`].
    pub async fn watch_my_trades(
        &self,
        symbol: Option<&str>,
        options: &WatchOptions,
    ) -> Result<StreamReceiver<MyTrade>, StreamError> {
        self.inner.markets.load_markets().await?;
        let interests = self
            .inner
            .account_interest(StreamKind::MyTrade, symbol, options)?;
        self.inner.watch(interests, options).await
    }

    /// Stop watching own fills.
    ///
    /// # Errors
    ///
    /// See [`StreamEngine::unwatch_balance`].
    pub async fn unwatch_my_trades(
        &self,
        symbol: Option<&str>,
        options: &WatchOptions,
    ) -> Result<(), StreamError> {
        let interests = self
            .inner
            .account_interest(StreamKind::MyTrade, symbol, options)?;
        self.inner
            .unwatch(StreamKind::MyTrade, interests, options)
            .await
    }
}
