//! Endpoint Client
//!
//! All connections to one endpoint URL (for private endpoints: one URL and
//! one account). Places new subscriptions on connections, sends subscribe
//! and unsubscribe frames, and swaps in fresh connections after a drop.
//!
//! Placement: a connection carrying fewer than `min_subs_per_conn` keys takes
//! the next key; otherwise a new connection is dialed while below
//! `max_conns_per_endpoint`; otherwise a random connection is used. Private
//! endpoints always use a single connection.
//!
//! A private client whose connection dropped is put on [`Hold`] until the
//! replacement has logged in: nothing dials past the replacement, and keys
//! placed meanwhile are parked without a frame and handed back by
//! [`WsClient::release_hold`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::connection::{
    ConnectionError, ConnectionEvent, ConnectionHandle, FrameHandler, FrameOrigin, ReplyCallback,
};
use crate::application::ports::{EndpointScope, ExchangeProtocol};
use crate::domain::subscription::{ConnId, SubscriptionKey, SubscriptionRegistry, SubscriptionStat};
use crate::infrastructure::config::ConnectionSettings;
use crate::infrastructure::metrics;

/// Milliseconds since the epoch.
#[must_use]
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Key identifying an endpoint client.
#[must_use]
pub fn client_key(scope: EndpointScope, account: &str, url: &str) -> String {
    if scope.requires_login() {
        format!("{account}@{url}")
    } else {
        url.to_string()
    }
}

/// Subscription hold of a private client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Hold {
    /// Subscribe frames are sent as keys are placed.
    #[default]
    Open,
    /// The connection dropped and is being replaced.
    Reconnecting,
    /// The replacement is up and waits for its login.
    AwaitingLogin,
    /// The client was closed.
    Closed,
}

impl Hold {
    const fn parks(self) -> bool {
        matches!(self, Self::Reconnecting | Self::AwaitingLogin)
    }
}

/// Connections and subscriptions of one endpoint.
pub struct WsClient {
    key: Arc<str>,
    url: String,
    scope: EndpointScope,
    account: Option<String>,
    protocol: Arc<dyn ExchangeProtocol>,
    settings: ConnectionSettings,
    handler: Arc<dyn FrameHandler>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    conns: RwLock<BTreeMap<ConnId, ConnectionHandle>>,
    registry: SubscriptionRegistry,
    dial_lock: tokio::sync::Mutex<()>,
    next_conn_id: AtomicU64,
    hold: watch::Sender<Hold>,
    parked: Mutex<Vec<SubscriptionKey>>,
}

impl std::fmt::Debug for WsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsClient")
            .field("key", &self.key)
            .field("scope", &self.scope)
            .field("connections", &self.conns.read().len())
            .field("subscriptions", &self.registry.len())
            .field("hold", &*self.hold.borrow())
            .finish_non_exhaustive()
    }
}

impl WsClient {
    /// Create a client. No connection is dialed until first use.
    #[must_use]
    pub fn new(
        url: String,
        scope: EndpointScope,
        account: Option<String>,
        protocol: Arc<dyn ExchangeProtocol>,
        settings: ConnectionSettings,
        handler: Arc<dyn FrameHandler>,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        let key = client_key(scope, account.as_deref().unwrap_or_default(), &url);
        Self {
            key: Arc::from(key),
            url,
            scope,
            account,
            protocol,
            settings,
            handler,
            events,
            conns: RwLock::new(BTreeMap::new()),
            registry: SubscriptionRegistry::new(),
            dial_lock: tokio::sync::Mutex::new(()),
            next_conn_id: AtomicU64::new(1),
            hold: watch::Sender::new(Hold::Open),
            parked: Mutex::new(Vec::new()),
        }
    }

    /// Client key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Endpoint URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Endpoint scope.
    #[must_use]
    pub const fn scope(&self) -> EndpointScope {
        self.scope
    }

    /// Account of a private client.
    #[must_use]
    pub fn account(&self) -> Option<&str> {
        self.account.as_deref()
    }

    /// Live connections, by id.
    #[must_use]
    pub fn connections(&self) -> Vec<ConnectionHandle> {
        self.conns
            .read()
            .values()
            .filter(|c| c.is_alive())
            .cloned()
            .collect()
    }

    /// A connection by id.
    #[must_use]
    pub fn connection(&self, conn_id: ConnId) -> Option<ConnectionHandle> {
        self.conns.read().get(&conn_id).cloned()
    }

    /// Current subscription hold.
    #[must_use]
    pub fn hold(&self) -> Hold {
        *self.hold.borrow()
    }

    /// The first live connection, dialing one if none exists.
    ///
    /// A private client waits for a pending replacement instead of dialing.
    ///
    /// # Errors
    ///
    /// Returns an error if dialing fails or the client is closed.
    pub async fn primary(&self) -> Result<ConnectionHandle, ConnectionError> {
        let mut hold = self.hold.subscribe();
        loop {
            let state = *hold
                .wait_for(|h| *h != Hold::Reconnecting)
                .await
                .map_err(|_| ConnectionError::ClientClosed)?;
            if state == Hold::Closed {
                return Err(ConnectionError::ClientClosed);
            }

            let guard = self.dial_lock.lock().await;
            if self.hold() == Hold::Reconnecting {
                continue;
            }
            if let Some(conn) = self.connections().into_iter().next() {
                return Ok(conn);
            }
            if self.awaiting_replacement() {
                // The drop is not reported yet; wait for the hold to move.
                drop(guard);
                hold.changed()
                    .await
                    .map_err(|_| ConnectionError::ClientClosed)?;
                continue;
            }
            return self.dial().await;
        }
    }

    /// Put a private client on hold after its connection dropped.
    ///
    /// Returns `false` for public clients, which are never held.
    pub fn begin_hold(&self) -> bool {
        if !self.scope.requires_login() {
            return false;
        }
        self.hold.send_if_modified(|h| {
            let changed = *h != Hold::Closed && *h != Hold::Reconnecting;
            if changed {
                *h = Hold::Reconnecting;
            }
            changed
        })
    }

    /// Lift the hold after a successful login, returning the parked keys.
    pub fn release_hold(&self) -> Vec<SubscriptionKey> {
        let mut parked = Vec::new();
        self.hold.send_if_modified(|h| {
            if !h.parks() {
                return false;
            }
            *h = Hold::Open;
            parked = std::mem::take(&mut *self.parked.lock());
            true
        });
        parked
    }

    /// Place `keys` on connections and send subscribe frames.
    ///
    /// Keys already placed are skipped. On failure the keys of the failed
    /// and unsent batches are unplaced again.
    ///
    /// # Errors
    ///
    /// Returns an error if dialing or enqueueing a frame fails.
    pub async fn subscribe(&self, keys: &[SubscriptionKey]) -> Result<(), ConnectionError> {
        let mut batches: BTreeMap<ConnId, (ConnectionHandle, Vec<SubscriptionKey>)> =
            BTreeMap::new();
        {
            let _guard = self.dial_lock.lock().await;
            if self.park(keys)? {
                return Ok(());
            }
            let now = now_ms();
            for key in keys {
                if self.registry.contains(key) {
                    continue;
                }
                let conn = match self.place().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        self.unplace(batches.values().flat_map(|(_, keys)| keys));
                        return Err(e);
                    }
                };
                self.registry.insert(key.clone(), conn.conn_id(), now);
                batches
                    .entry(conn.conn_id())
                    .or_insert_with(|| (conn, Vec::new()))
                    .1
                    .push(key.clone());
            }
        }

        let mut batches = batches.into_values();
        while let Some((conn, keys)) = batches.next() {
            if let Err(e) = self.send_frames(&conn, &keys, true).await {
                self.unplace(&keys);
                for (_, rest) in batches.by_ref() {
                    self.unplace(&rest);
                }
                return Err(e);
            }
        }

        metrics::set_subscriptions(self.protocol.name(), self.registry.len());
        Ok(())
    }

    /// Unplace `keys` and send unsubscribe frames on their connections.
    ///
    /// # Errors
    ///
    /// Returns the first enqueue failure; every batch is still attempted.
    pub async fn unsubscribe(&self, keys: &[SubscriptionKey]) -> Result<(), ConnectionError> {
        let mut held = false;
        self.hold.send_if_modified(|h| {
            held = h.parks();
            if held {
                self.parked.lock().retain(|k| !keys.contains(k));
                self.unplace(keys);
            }
            false
        });
        if held {
            debug!(client = %self.key, keys = keys.len(), "Unplaced held keys without a frame");
            metrics::set_subscriptions(self.protocol.name(), self.registry.len());
            return Ok(());
        }

        let mut batches: BTreeMap<ConnId, Vec<SubscriptionKey>> = BTreeMap::new();
        for key in keys {
            if let Some(conn_id) = self.registry.remove(key) {
                batches.entry(conn_id).or_default().push(key.clone());
            }
        }

        let mut first_error = None;
        for (conn_id, keys) in batches {
            let Some(conn) = self.connection(conn_id).filter(ConnectionHandle::is_alive) else {
                debug!(client = %self.key, conn_id, "Connection gone, skipping unsubscribe");
                continue;
            };
            if let Err(e) = self.send_frames(&conn, &keys, false).await {
                warn!(client = %self.key, conn_id, error = %e, "Unsubscribe failed");
                first_error.get_or_insert(e);
            }
        }

        metrics::set_subscriptions(self.protocol.name(), self.registry.len());
        first_error.map_or(Ok(()), Err)
    }

    /// Send subscribe frames again for keys still placed on `conn_id`.
    ///
    /// With `refresh` the keys are unsubscribed first. Returns the number
    /// of keys resubscribed.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is gone or a frame cannot be
    /// enqueued.
    pub async fn resubscribe(
        &self,
        conn_id: ConnId,
        keys: &[SubscriptionKey],
        refresh: bool,
    ) -> Result<usize, ConnectionError> {
        let keys: Vec<SubscriptionKey> = keys
            .iter()
            .filter(|k| self.registry.conn_of(k) == Some(conn_id))
            .cloned()
            .collect();
        if keys.is_empty() {
            return Ok(0);
        }

        let conn = self
            .connection(conn_id)
            .filter(ConnectionHandle::is_alive)
            .ok_or(ConnectionError::SendQueueClosed)?;

        if refresh {
            self.send_frames(&conn, &keys, false).await?;
        }
        self.send_frames(&conn, &keys, true).await?;

        let now = now_ms();
        for key in &keys {
            self.registry.touch(key, now);
        }
        Ok(keys.len())
    }

    /// Replace a dropped connection with a freshly dialed one.
    ///
    /// The dropped connection's keys move to the new connection and are
    /// returned so the caller can restore them.
    ///
    /// # Errors
    ///
    /// Returns an error if dialing fails. The keys stay placed on the old
    /// id so a later attempt can still move them.
    pub async fn replace_connection(
        &self,
        old: ConnId,
    ) -> Result<(ConnectionHandle, Vec<SubscriptionKey>), ConnectionError> {
        let _guard = self.dial_lock.lock().await;
        if let Some(stale) = self.conns.write().remove(&old) {
            stale.close();
        }

        let conn = self.dial().await?;
        let keys = self.registry.rehome(old, conn.conn_id(), now_ms());
        self.hold.send_if_modified(|h| {
            let changed = *h == Hold::Reconnecting;
            if changed {
                *h = Hold::AwaitingLogin;
            }
            changed
        });
        info!(
            client = %self.key,
            old,
            new = conn.conn_id(),
            keys = keys.len(),
            "Replaced connection"
        );
        Ok((conn, keys))
    }

    /// Give up on a connection, discarding its keys.
    pub fn drop_connection(&self, conn_id: ConnId) -> Vec<SubscriptionKey> {
        if let Some(conn) = self.conns.write().remove(&conn_id) {
            conn.close();
        }
        metrics::set_connections(self.protocol.name(), self.conns.read().len());
        let keys = self.registry.drain_conn(conn_id);
        metrics::set_subscriptions(self.protocol.name(), self.registry.len());
        keys
    }

    /// Record activity on a key.
    pub fn touch(&self, key: &SubscriptionKey) -> bool {
        self.registry.touch(key, now_ms())
    }

    /// Whether a key is placed on a connection.
    #[must_use]
    pub fn is_subscribed(&self, key: &SubscriptionKey) -> bool {
        self.registry.contains(key)
    }

    /// Keys placed on a connection.
    #[must_use]
    pub fn keys_for(&self, conn_id: ConnId) -> Vec<SubscriptionKey> {
        self.registry.keys_for(conn_id)
    }

    /// Keys silent beyond the protocol's tolerance.
    #[must_use]
    pub fn stale_keys(&self, now_ms: i64) -> Vec<(ConnId, SubscriptionKey)> {
        self.registry.stale_keys(now_ms, |key| {
            self.protocol
                .max_silence(key)
                .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        })
    }

    /// Per-key statistics.
    #[must_use]
    pub fn stats(&self, now_ms: i64) -> Vec<SubscriptionStat> {
        self.registry.stats(now_ms)
    }

    /// Number of placed keys.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.registry.len()
    }

    /// Close every connection.
    pub fn close(&self) {
        self.hold.send_replace(Hold::Closed);
        self.parked.lock().clear();
        let conns: Vec<_> = std::mem::take(&mut *self.conns.write()).into_values().collect();
        for conn in conns {
            conn.close();
        }
        metrics::set_connections(self.protocol.name(), 0);
    }

    fn max_conns(&self) -> usize {
        if self.scope.requires_login() {
            1
        } else {
            self.settings.max_conns_per_endpoint.max(1)
        }
    }

    /// A private connection died and its replacement has not been dialed.
    fn awaiting_replacement(&self) -> bool {
        self.scope.requires_login() && {
            let conns = self.conns.read();
            !conns.is_empty() && conns.values().all(|c| !c.is_alive())
        }
    }

    /// Park `keys` on the held connection without sending frames.
    ///
    /// Returns `false` when the client is not held. Caller holds `dial_lock`.
    fn park(&self, keys: &[SubscriptionKey]) -> Result<bool, ConnectionError> {
        if self.hold() == Hold::Closed {
            return Err(ConnectionError::ClientClosed);
        }
        if !self.scope.requires_login() {
            return Ok(false);
        }
        let mut outcome = Ok(false);
        self.hold.send_if_modified(|h| {
            if *h == Hold::Closed {
                outcome = Err(ConnectionError::ClientClosed);
                return false;
            }
            let early = !h.parks();
            if early && !self.awaiting_replacement() {
                return false;
            }
            let Some(home) = self.conns.read().keys().next().copied() else {
                return false;
            };
            // The drop is not reported yet; hold ahead of the supervisor.
            if early {
                *h = Hold::Reconnecting;
            }
            let now = now_ms();
            let mut parked = self.parked.lock();
            for key in keys {
                if self.registry.insert(key.clone(), home, now) {
                    parked.push(key.clone());
                }
            }
            debug!(client = %self.key, conn_id = home, keys = keys.len(), "Parked keys until login");
            outcome = Ok(true);
            early
        });
        outcome
    }

    /// Pick the connection for a new key. Caller holds `dial_lock`.
    async fn place(&self) -> Result<ConnectionHandle, ConnectionError> {
        let live = self.connections();

        if let Some(conn) = live
            .iter()
            .find(|c| self.registry.count_for(c.conn_id()) < self.settings.min_subs_per_conn)
        {
            return Ok(conn.clone());
        }
        if live.len() < self.max_conns() {
            return self.dial().await;
        }

        let idx = rand::rng().random_range(0..live.len());
        Ok(live[idx].clone())
    }

    /// Dial a new connection. Caller holds `dial_lock`.
    async fn dial(&self) -> Result<ConnectionHandle, ConnectionError> {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let origin = FrameOrigin {
            client_key: Arc::clone(&self.key),
            conn_id,
        };
        let conn = ConnectionHandle::connect(
            &self.url,
            origin,
            &self.settings,
            self.protocol.correlation_field(),
            Arc::clone(&self.handler),
            self.events.clone(),
        )
        .await?;

        self.conns.write().insert(conn_id, conn.clone());
        metrics::set_connections(self.protocol.name(), self.conns.read().len());
        Ok(conn)
    }

    fn unplace<'a>(&self, keys: impl IntoIterator<Item = &'a SubscriptionKey>) {
        for key in keys {
            self.registry.remove(key);
        }
    }

    async fn send_frames(
        &self,
        conn: &ConnectionHandle,
        keys: &[SubscriptionKey],
        subscribe: bool,
    ) -> Result<(), ConnectionError> {
        let op = if subscribe { "subscribe" } else { "unsubscribe" };
        for frame in self.protocol.subscribe_frames(keys, subscribe) {
            debug!(client = %self.key, conn_id = conn.conn_id(), op, keys = keys.len(), "Sending frame");
            let reply = frame
                .correlation_id
                .map(|id| (id, self.ack_callback(keys, op)));
            conn.write(frame.text, reply).await?;
        }
        Ok(())
    }

    fn ack_callback(&self, keys: &[SubscriptionKey], op: &'static str) -> ReplyCallback {
        let protocol = Arc::clone(&self.protocol);
        let client = Arc::clone(&self.key);
        let described = keys
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        Box::new(move |reply| match protocol.ack_error(&reply) {
            Some(rejection) => warn!(
                client = %client,
                op,
                keys = %described,
                code = %rejection.code,
                message = %rejection.message,
                "Request rejected"
            ),
            None => debug!(client = %client, op, keys = %described, "Request acknowledged"),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::DateTime;
    use futures_util::{SinkExt, StreamExt};
    use parking_lot::Mutex;
    use serde_json::{Value, json};
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::Message;

    use super::*;
    use crate::application::ports::{
        ChannelBinding, ChannelRequest, DecodeError, InboundEvent, LoginRejection, MarketCatalog,
        OutboundFrame,
    };
    use crate::domain::account::Credentials;
    use crate::domain::streaming::MarketType;
    use crate::error::StreamError;

    /// Minimal wire convention: `{"id", "op", "keys"}`, acks echo the id.
    struct EchoProtocol;

    impl ExchangeProtocol for EchoProtocol {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn endpoint_url(&self, _: EndpointScope, _: MarketType) -> Result<String, StreamError> {
            Err(StreamError::NotSupported("endpoint".into()))
        }

        fn bind(&self, _: &ChannelRequest) -> Result<ChannelBinding, StreamError> {
            Err(StreamError::NotSupported("bind".into()))
        }

        fn subscribe_frames(&self, keys: &[SubscriptionKey], subscribe: bool) -> Vec<OutboundFrame> {
            let id = uuid::Uuid::new_v4().simple().to_string();
            let text = json!({
                "id": id,
                "op": if subscribe { "subscribe" } else { "unsubscribe" },
                "keys": keys.iter().map(ToString::to_string).collect::<Vec<_>>(),
            })
            .to_string();
            vec![OutboundFrame {
                text,
                correlation_id: Some(id),
            }]
        }

        fn login_frame(&self, _: &Credentials, _: DateTime<Utc>) -> Result<String, StreamError> {
            Ok("login".into())
        }

        fn ping_frame(&self) -> String {
            "ping".into()
        }

        fn correlation_field(&self) -> &'static str {
            "id"
        }

        fn ack_error(&self, reply: &Value) -> Option<LoginRejection> {
            reply.get("error").map(|e| LoginRejection {
                code: e.to_string(),
                message: String::new(),
            })
        }

        fn max_silence(&self, _: &SubscriptionKey) -> Option<Duration> {
            Some(Duration::from_millis(5))
        }

        fn decode(
            &self,
            _: &Value,
            _: MarketType,
            _: &dyn MarketCatalog,
        ) -> Result<Vec<InboundEvent>, DecodeError> {
            Ok(Vec::new())
        }
    }

    struct NullHandler;

    impl FrameHandler for NullHandler {
        fn on_unit(&self, _: &FrameOrigin, _: Value) {}
    }

    type Frames = Arc<Mutex<Vec<Value>>>;

    /// Server accepting any number of connections, recording every frame.
    async fn spawn_server() -> (String, Frames, Arc<Mutex<usize>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let frames: Frames = Arc::default();
        let accepted = Arc::new(Mutex::new(0));
        {
            let frames = Arc::clone(&frames);
            let accepted = Arc::clone(&accepted);
            tokio::spawn(async move {
                while let Ok((tcp, _)) = listener.accept().await {
                    *accepted.lock() += 1;
                    let frames = Arc::clone(&frames);
                    tokio::spawn(async move {
                        let mut ws = accept_async(tcp).await.unwrap();
                        while let Some(Ok(msg)) = ws.next().await {
                            if let Message::Text(text) = msg {
                                let value: Value = serde_json::from_str(text.as_str()).unwrap();
                                let ack = json!({"id": value["id"], "event": value["op"]});
                                frames.lock().push(value);
                                let _ = ws.send(Message::Text(ack.to_string().into())).await;
                            }
                        }
                    });
                }
            });
        }
        (format!("ws://{addr}"), frames, accepted)
    }

    fn client(url: &str, scope: EndpointScope, settings: ConnectionSettings) -> WsClient {
        let (events, _rx) = mpsc::unbounded_channel();
        WsClient::new(
            url.to_string(),
            scope,
            Some("main".to_string()),
            Arc::new(EchoProtocol),
            settings,
            Arc::new(NullHandler),
            events,
        )
    }

    fn keys(n: usize) -> Vec<SubscriptionKey> {
        (0..n)
            .map(|i| SubscriptionKey::instrument("trades", &format!("I{i}")))
            .collect()
    }

    async fn eventually(check: impl Fn() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn keys_by_scope() {
        assert_eq!(client_key(EndpointScope::Public, "main", "wss://x"), "wss://x");
        assert_eq!(client_key(EndpointScope::Private, "main", "wss://x"), "main@wss://x");
    }

    #[tokio::test]
    async fn subscribe_and_unsubscribe_send_frames() {
        let (url, frames, _) = spawn_server().await;
        let client = client(&url, EndpointScope::Public, ConnectionSettings::default());

        client.subscribe(&keys(2)).await.unwrap();
        assert_eq!(client.subscription_count(), 2);
        eventually(|| frames.lock().len() == 1).await;
        assert_eq!(frames.lock()[0]["op"], "subscribe");
        assert_eq!(frames.lock()[0]["keys"].as_array().unwrap().len(), 2);

        client.subscribe(&keys(1)).await.unwrap();
        assert_eq!(frames.lock().len(), 1, "placed keys are not resent");

        client.unsubscribe(&keys(1)).await.unwrap();
        eventually(|| frames.lock().len() == 2).await;
        assert_eq!(frames.lock()[1]["op"], "unsubscribe");
        assert_eq!(client.subscription_count(), 1);

        eventually(|| client.connections()[0].pending_replies() == 0).await;
    }

    #[tokio::test]
    async fn spreads_keys_across_connections() {
        let (url, _, accepted) = spawn_server().await;
        let settings = ConnectionSettings {
            min_subs_per_conn: 2,
            max_conns_per_endpoint: 2,
            ..ConnectionSettings::default()
        };
        let client = client(&url, EndpointScope::Public, settings);

        client.subscribe(&keys(5)).await.unwrap();
        let conns = client.connections();
        assert_eq!(conns.len(), 2);
        assert_eq!(*accepted.lock(), 2);
        let total: usize = conns.iter().map(|c| client.keys_for(c.conn_id()).len()).sum();
        assert_eq!(total, 5);
        assert!(client.keys_for(conns[0].conn_id()).len() >= 2);
    }

    #[tokio::test]
    async fn private_client_uses_one_connection() {
        let (url, _, _) = spawn_server().await;
        let settings = ConnectionSettings {
            min_subs_per_conn: 1,
            ..ConnectionSettings::default()
        };
        let client = client(&url, EndpointScope::Private, settings);
        assert_eq!(client.key(), format!("main@{url}"));

        client.subscribe(&keys(3)).await.unwrap();
        assert_eq!(client.connections().len(), 1);
    }

    #[tokio::test]
    async fn replace_moves_keys() {
        let (url, frames, _) = spawn_server().await;
        let client = client(&url, EndpointScope::Public, ConnectionSettings::default());
        client.subscribe(&keys(2)).await.unwrap();
        eventually(|| frames.lock().len() == 1).await;
        let old = client.connections()[0].conn_id();

        let (conn, moved) = client.replace_connection(old).await.unwrap();
        assert_ne!(conn.conn_id(), old);
        assert_eq!(moved, keys(2));
        assert_eq!(client.keys_for(conn.conn_id()), keys(2));

        assert_eq!(client.resubscribe(conn.conn_id(), &moved, false).await.unwrap(), 2);
        eventually(|| frames.lock().len() == 2).await;
    }

    #[tokio::test]
    async fn held_private_client_parks_keys_until_released() {
        let (url, frames, accepted) = spawn_server().await;
        let client = Arc::new(client(&url, EndpointScope::Private, ConnectionSettings::default()));
        let all = keys(3);
        client.subscribe(&all[..1]).await.unwrap();
        eventually(|| frames.lock().len() == 1).await;
        let old = client.connections()[0].conn_id();

        assert!(client.begin_hold());
        assert_eq!(client.hold(), Hold::Reconnecting);
        client.subscribe(&all[1..]).await.unwrap();
        assert_eq!(client.subscription_count(), 3);

        let waiter = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.primary().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished(), "no dial while the replacement is pending");
        assert_eq!(*accepted.lock(), 1);

        let (conn, moved) = client.replace_connection(old).await.unwrap();
        assert_eq!(moved.len(), 3);
        assert_eq!(client.hold(), Hold::AwaitingLogin);
        assert_eq!(waiter.await.unwrap().unwrap().conn_id(), conn.conn_id());
        assert_eq!(*accepted.lock(), 2);

        // Unwatching a held key sends nothing.
        client.unsubscribe(&all[2..]).await.unwrap();
        assert_eq!(client.release_hold(), all[1..2].to_vec());
        assert_eq!(client.hold(), Hold::Open);
        assert!(client.release_hold().is_empty());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(frames.lock().len(), 1);
    }

    #[tokio::test]
    async fn public_clients_are_never_held() {
        let (url, _, _) = spawn_server().await;
        let client = client(&url, EndpointScope::Public, ConnectionSettings::default());
        assert!(!client.begin_hold());
        assert_eq!(client.hold(), Hold::Open);
    }

    #[tokio::test]
    async fn closed_client_refuses_work() {
        let (url, _, accepted) = spawn_server().await;
        let client = client(&url, EndpointScope::Private, ConnectionSettings::default());
        client.close();

        assert!(matches!(client.primary().await, Err(ConnectionError::ClientClosed)));
        assert!(matches!(
            client.subscribe(&keys(1)).await,
            Err(ConnectionError::ClientClosed)
        ));
        assert_eq!(*accepted.lock(), 0);
    }

    #[tokio::test]
    async fn drop_connection_discards_keys() {
        let (url, _, _) = spawn_server().await;
        let client = client(&url, EndpointScope::Public, ConnectionSettings::default());
        client.subscribe(&keys(2)).await.unwrap();
        let conn_id = client.connections()[0].conn_id();

        assert_eq!(client.drop_connection(conn_id), keys(2));
        assert_eq!(client.subscription_count(), 0);
        assert!(client.connections().is_empty());
    }

    #[tokio::test]
    async fn silent_keys_are_stale() {
        let (url, _, _) = spawn_server().await;
        let client = client(&url, EndpointScope::Public, ConnectionSettings::default());
        client.subscribe(&keys(1)).await.unwrap();

        let later = now_ms() + 1_000;
        assert_eq!(client.stale_keys(later).len(), 1);
        client.touch(&keys(1)[0]);
        assert!(client.stale_keys(now_ms()).is_empty());
    }

    #[tokio::test]
    async fn dial_failure_unplaces_keys() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let client = client(&url, EndpointScope::Public, ConnectionSettings::default());
        assert!(client.subscribe(&keys(2)).await.is_err());
        assert_eq!(client.subscription_count(), 0);
    }
}
