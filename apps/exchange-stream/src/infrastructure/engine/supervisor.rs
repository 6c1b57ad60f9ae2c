//! Keepalive supervisor.
//!
//! One task per engine. Keepalive ticks send heartbeats and resubscribe
//! silent keys; connection-closed events start a reconnect task that
//! replaces the dropped connection and restores its keys. Public keys are
//! resubscribed right away. A private client is held as soon as the drop is
//! seen: its login is reset and its keys are parked until the login on the
//! replacement succeeds, when the dispatcher restores them.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{ClientEntry, Inner};
use crate::domain::subscription::{ConnId, SubscriptionKey};
use crate::infrastructure::metrics;
use crate::infrastructure::ws::{
    AuthState, ConnectionError, ConnectionEvent, ConnectionHandle, FrameOrigin, Hold,
    KeepaliveEvent, PendingRestore, ReconnectPolicy, now_ms,
};

/// Run until cancelled or the engine is dropped.
pub(super) async fn run(
    inner: Weak<Inner>,
    mut keepalive: mpsc::Receiver<KeepaliveEvent>,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!("Supervisor cancelled");
                break;
            }
            Some(tick) = keepalive.recv() => {
                let Some(inner) = inner.upgrade() else { break };
                match tick {
                    KeepaliveEvent::Ping => send_pings(&inner),
                    KeepaliveEvent::CheckStale => resubscribe_stale(&inner),
                }
            }
            Some(event) = events.recv() => {
                let Some(inner) = inner.upgrade() else { break };
                match event {
                    ConnectionEvent::Closed { origin, error } => {
                        hold_private(&inner, &origin);
                        tokio::spawn(reconnect(inner, origin, error, cancel.clone()));
                    }
                }
            }
            else => break,
        }
    }
}

/// Reset the login of a private client and park its keys for restore.
fn hold_private(inner: &Inner, origin: &FrameOrigin) {
    let Some(entry) = inner.client(&origin.client_key) else {
        return;
    };
    if !entry.client.begin_hold() && entry.client.hold() != Hold::Reconnecting {
        return;
    }
    let keys = entry.client.keys_for(origin.conn_id);
    debug!(client = %origin.client_key, conn_id = origin.conn_id, keys = keys.len(), "Holding private client");
    inner.auth.reset_for_reconnect(
        &origin.client_key,
        PendingRestore {
            conn_id: origin.conn_id,
            keys,
        },
    );
}

/// Heartbeat every live connection. Failures are only logged.
fn send_pings(inner: &Inner) {
    let frame = inner.protocol.ping_frame();
    for entry in inner.entries() {
        for conn in entry.client.connections() {
            if let Err(e) = conn.try_write(frame.clone()) {
                warn!(
                    client = %entry.client.key(),
                    conn_id = conn.conn_id(),
                    error = %e,
                    "Heartbeat send failed"
                );
            }
        }
    }
}

/// Resubscribe keys silent beyond the protocol's tolerance.
fn resubscribe_stale(inner: &Inner) {
    let now = now_ms();
    for entry in inner.entries() {
        let client = entry.client.key().to_string();
        if entry.client.scope().requires_login() && inner.auth.state(&client) != AuthState::Authenticated {
            continue;
        }

        let mut by_conn: BTreeMap<ConnId, Vec<SubscriptionKey>> = BTreeMap::new();
        for (conn_id, key) in entry.client.stale_keys(now) {
            by_conn.entry(conn_id).or_default().push(key);
        }
        if by_conn.is_empty() {
            continue;
        }

        let exchange = inner.protocol.name();
        for (conn_id, keys) in by_conn {
            info!(client = %client, conn_id, keys = keys.len(), "Resubscribing silent keys");
            let entry = Arc::clone(&entry);
            let client = client.clone();
            tokio::spawn(async move {
                match entry.client.resubscribe(conn_id, &keys, true).await {
                    Ok(count) => metrics::record_resubscribe(
                        exchange,
                        "stale",
                        u64::try_from(count).unwrap_or(u64::MAX),
                    ),
                    Err(e) => warn!(client = %client, conn_id, error = %e, "Stale resubscribe failed"),
                }
            });
        }
    }
}

/// Replace a dropped connection, backing off between attempts.
async fn reconnect(
    inner: Arc<Inner>,
    origin: FrameOrigin,
    error: ConnectionError,
    cancel: CancellationToken,
) {
    let Some(entry) = inner.client(&origin.client_key) else {
        return;
    };
    let client = entry.client.key().to_string();
    warn!(client = %client, conn_id = origin.conn_id, error = %error, "Connection lost");

    let mut policy = ReconnectPolicy::after(inner.config.reconnect.clone(), &error);
    loop {
        let Some(delay) = policy.next_delay() else {
            give_up(&inner, &entry, origin.conn_id);
            return;
        };
        debug!(
            client = %client,
            attempt = policy.attempt_count(),
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Reconnecting"
        );
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(delay) => {}
        }

        metrics::record_reconnect(inner.protocol.name());
        match entry.client.replace_connection(origin.conn_id).await {
            Ok((conn, keys)) => {
                restore(&inner, &entry, conn, keys).await;
                return;
            }
            Err(e) => {
                warn!(
                    client = %client,
                    attempt = policy.attempt_count(),
                    error = %e,
                    "Reconnect attempt failed"
                );
            }
        }
    }
}

/// Restore the keys moved onto a fresh connection.
async fn restore(
    inner: &Arc<Inner>,
    entry: &Arc<ClientEntry>,
    conn: ConnectionHandle,
    keys: Vec<SubscriptionKey>,
) {
    let client = entry.client.key();
    let conn_id = conn.conn_id();

    if !entry.client.scope().requires_login() {
        match entry.client.resubscribe(conn_id, &keys, false).await {
            Ok(count) => {
                metrics::record_resubscribe(
                    inner.protocol.name(),
                    "reconnect",
                    u64::try_from(count).unwrap_or(u64::MAX),
                );
                info!(client, conn_id, keys = count, "Restored subscriptions");
            }
            Err(e) => warn!(client, conn_id, error = %e, "Restoring subscriptions failed"),
        }
        return;
    }

    debug!(client, conn_id, keys = keys.len(), "Logging in on replacement");
    let credentials = match inner.credentials_for(entry) {
        Ok(credentials) => credentials,
        Err(e) => {
            error!(client, error = %e, "Cannot log in after reconnect");
            return;
        }
    };

    let inner = Arc::clone(inner);
    let entry = Arc::clone(entry);
    tokio::spawn(async move {
        if let Err(e) = inner.login_on(&entry, conn, credentials).await {
            warn!(client = %entry.client.key(), error = %e, "Login after reconnect failed");
        }
    });
}

/// Drop an endpoint whose connection could not be restored.
fn give_up(inner: &Inner, entry: &ClientEntry, conn_id: ConnId) {
    let client = entry.client.key().to_string();
    let discarded = entry.client.drop_connection(conn_id);
    error!(
        client = %client,
        conn_id,
        keys = discarded.len(),
        "Reconnect attempts exhausted, dropping endpoint"
    );

    inner.clients.write().remove(&client);
    entry.client.close();
    inner.auth.forget(&client);
    let closed = inner.router.close_scope(&client);
    inner.evict_client(&client);
    debug!(client = %client, queues = closed, "Closed output queues");
}
