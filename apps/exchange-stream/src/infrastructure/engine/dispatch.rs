//! Inbound dispatch.
//!
//! Runs on the receive loop of every connection: decodes a unit with the
//! exchange protocol, updates local state and publishes rows to the output
//! queues. Only keys that still have watchers are published.

use std::sync::{Arc, Weak};

use serde_json::Value;
use tracing::{debug, trace, warn};

use super::{ClientEntry, Inner};
use crate::application::ports::{DecodeError, InboundEvent, LoginRejection};
use crate::domain::subscription::SubscriptionKey;
use crate::infrastructure::metrics;
use crate::infrastructure::ws::{AuthError, FrameHandler, FrameOrigin, PendingRestore};

/// Frame handler shared by every connection of an engine.
pub(super) struct Dispatcher {
    inner: Weak<Inner>,
}

impl Dispatcher {
    pub(super) const fn new(inner: Weak<Inner>) -> Self {
        Self { inner }
    }
}

impl FrameHandler for Dispatcher {
    fn on_unit(&self, origin: &FrameOrigin, unit: Value) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let exchange = inner.protocol.name();
        metrics::record_frame_received(exchange);

        let Some(entry) = inner.client(&origin.client_key) else {
            debug!(client = %origin.client_key, "Unit for a removed client");
            return;
        };

        match inner
            .protocol
            .decode(&unit, entry.market_type, inner.markets.as_ref())
        {
            Ok(events) => {
                for event in events {
                    inner.dispatch(&entry, origin, event);
                }
            }
            Err(DecodeError::UnknownChannel(channel)) => {
                debug!(client = %origin.client_key, %channel, "Ignoring unhandled channel");
            }
            Err(e) => {
                metrics::record_frame_malformed(exchange);
                warn!(
                    client = %origin.client_key,
                    conn_id = origin.conn_id,
                    error = %e,
                    "Dropping malformed unit"
                );
            }
        }
    }

    fn on_heartbeat(&self, origin: &FrameOrigin) {
        trace!(client = %origin.client_key, conn_id = origin.conn_id, "Heartbeat");
    }

    fn on_malformed(&self, _origin: &FrameOrigin) {
        if let Some(inner) = self.inner.upgrade() {
            metrics::record_frame_malformed(inner.protocol.name());
        }
    }
}

impl Inner {
    fn dispatch(&self, entry: &Arc<ClientEntry>, origin: &FrameOrigin, event: InboundEvent) {
        let scope = origin.client_key.as_ref();
        let active = |key: &SubscriptionKey| {
            entry.client.touch(key);
            entry.watchers.is_active(key)
        };

        match event {
            InboundEvent::Pong => {
                trace!(client = %scope, conn_id = origin.conn_id, "Pong");
            }
            InboundEvent::Login(result) => self.on_login(entry, origin, result),
            InboundEvent::Ack { key, subscribed } => {
                debug!(
                    client = %scope,
                    key = ?key.map(|k| k.to_string()),
                    subscribed,
                    "Acknowledged"
                );
            }
            InboundEvent::Error { code, message } => {
                warn!(client = %scope, %code, %message, "Exchange error");
            }
            InboundEvent::Book { key, update } => {
                if !active(&key) {
                    return;
                }
                match self.books.apply(&update) {
                    Ok(book) => {
                        self.router.publish(scope, book);
                    }
                    Err(e) => {
                        metrics::record_frame_malformed(self.protocol.name());
                        warn!(client = %scope, symbol = %update.symbol, error = %e, "Rejected book update");
                    }
                }
            }
            InboundEvent::Trades { key, trades } => {
                if active(&key) {
                    for trade in trades {
                        self.router.publish(scope, trade);
                    }
                }
            }
            InboundEvent::Klines { key, klines } => {
                if active(&key) {
                    for kline in klines {
                        self.router.publish(scope, kline);
                    }
                }
            }
            InboundEvent::MarkPrices {
                key,
                market_type,
                prices,
            } => {
                if !active(&key) {
                    return;
                }
                let table = {
                    let mut tables = self.mark_prices.write();
                    let table = tables.entry(market_type).or_default();
                    table.extend(prices);
                    table.clone()
                };
                self.router.publish(scope, table);
            }
            InboundEvent::Balance { key, balances } => {
                if active(&key) {
                    self.router.publish(scope, balances);
                }
            }
            InboundEvent::Positions { key, positions } => {
                if !active(&key) {
                    return;
                }
                let changes = entry.leverages.lock().apply(&positions);
                for position in positions {
                    self.router.publish(scope, position);
                }
                for config in changes {
                    debug!(
                        client = %scope,
                        symbol = %config.symbol,
                        leverage = config.leverage,
                        "Leverage changed"
                    );
                    self.router.publish(scope, config);
                }
            }
            InboundEvent::MyTrades { key, trades } => {
                if active(&key) {
                    for trade in trades {
                        self.router.publish(scope, trade);
                    }
                }
            }
        }
    }

    /// Route a login result to the waiters and restore parked keys.
    ///
    /// The hold is lifted before the waiters wake, so their subscriptions
    /// go out directly. The restored keys are the snapshot taken at the
    /// drop plus any keys parked since, on the connection that logged in.
    fn on_login(
        &self,
        entry: &Arc<ClientEntry>,
        origin: &FrameOrigin,
        result: Result<(), LoginRejection>,
    ) {
        let exchange = self.protocol.name();
        metrics::record_login(exchange, if result.is_ok() { "ok" } else { "rejected" });

        let parked = if result.is_ok() {
            entry.client.release_hold()
        } else {
            Vec::new()
        };
        let outcome = result.map_err(|rejection| AuthError::Rejected {
            code: rejection.code,
            message: rejection.message,
        });
        let mut keys = self
            .auth
            .complete(&origin.client_key, outcome)
            .map(|PendingRestore { keys, .. }| keys)
            .unwrap_or_default();
        for key in parked {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        if keys.is_empty() {
            return;
        }

        let entry = Arc::clone(entry);
        let client = Arc::clone(&origin.client_key);
        let conn_id = origin.conn_id;
        tokio::spawn(async move {
            match entry.client.resubscribe(conn_id, &keys, false).await {
                Ok(count) => {
                    metrics::record_resubscribe(
                        exchange,
                        "reconnect",
                        u64::try_from(count).unwrap_or(u64::MAX),
                    );
                    debug!(client = %client, conn_id, keys = count, "Restored private subscriptions");
                }
                Err(e) => {
                    warn!(client = %client, conn_id, error = %e, "Restoring private subscriptions failed");
                }
            }
        });
    }
}
