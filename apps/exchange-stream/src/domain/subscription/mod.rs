//! Subscription Management Types
//!
//! Domain types for tracking which upstream subscriptions exist, who
//! depends on them, and which physical connection carries each of them.
//!
//! # Design
//!
//! Two registries cooperate:
//! - [`WatcherRegistry`]: key → set of watcher names. A key is active iff its
//!   watcher set is non-empty. Mutations report first-watcher and
//!   last-watcher transitions so callers send exactly one subscribe and one
//!   unsubscribe frame per key. The registry never sends frames itself.
//! - [`SubscriptionRegistry`]: key → (connection, last-activity stamp). Used to
//!   resubscribe after a reconnect and to detect silent streams.
//!
//! This allows multiple watchers to rely on the same key while maintaining
//! only one upstream subscription.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

// =============================================================================
// Types
// =============================================================================

/// Identifier of one physical connection.
pub type ConnId = u64;

/// Canonical identity of one upstream subscription.
///
/// Two logically identical interests produce equal keys: surrounding
/// whitespace is trimmed and empty instrument fields collapse to `None`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionKey {
    channel: String,
    inst_type: Option<String>,
    inst_id: Option<String>,
}

impl SubscriptionKey {
    /// Create a key from its channel and optional instrument fields.
    #[must_use]
    pub fn new(
        channel: impl Into<String>,
        inst_type: Option<&str>,
        inst_id: Option<&str>,
    ) -> Self {
        let normalize = |field: Option<&str>| {
            field
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
        };
        Self {
            channel: channel.into().trim().to_string(),
            inst_type: normalize(inst_type),
            inst_id: normalize(inst_id),
        }
    }

    /// Key for a channel bound to a single instrument.
    #[must_use]
    pub fn instrument(channel: impl Into<String>, inst_id: &str) -> Self {
        Self::new(channel, None, Some(inst_id))
    }

    /// Key for a channel bound to an instrument type.
    #[must_use]
    pub fn instrument_type(channel: impl Into<String>, inst_type: &str) -> Self {
        Self::new(channel, Some(inst_type), None)
    }

    /// Key for a channel with no instrument fields.
    #[must_use]
    pub fn channel_only(channel: impl Into<String>) -> Self {
        Self::new(channel, None, None)
    }

    /// Channel name (or combined topic).
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Instrument type, if any.
    #[must_use]
    pub fn inst_type(&self) -> Option<&str> {
        self.inst_type.as_deref()
    }

    /// Wire instrument id, if any.
    #[must_use]
    pub fn inst_id(&self) -> Option<&str> {
        self.inst_id.as_deref()
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.channel)?;
        if let Some(inst_type) = &self.inst_type {
            write!(f, ":{inst_type}")?;
        }
        if let Some(inst_id) = &self.inst_id {
            write!(f, ":{inst_id}")?;
        }
        Ok(())
    }
}

// =============================================================================
// Watcher Registry
// =============================================================================

/// Statistics of a watcher registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatcherStats {
    /// Number of active keys.
    pub key_count: usize,
    /// Sum of watcher set sizes.
    pub watcher_count: usize,
}

/// Reference-counted key → watcher-name sets.
///
/// # Example
///
/// ```rust
/// use exchange_stream::domain::subscription::WatcherRegistry;
///
/// let registry = WatcherRegistry::<String>::new();
/// let key = "books5:BTC-USDT".to_string();
///
/// assert!(registry.register(key.clone(), "A"));   // first watcher: subscribe
/// assert!(!registry.register(key.clone(), "B"));  // shared
/// assert!(!registry.unregister(&key, "A"));       // still watched by B
/// assert!(registry.unregister(&key, "B"));        // last watcher: unsubscribe
/// assert!(!registry.is_active(&key));
/// ```
#[derive(Debug)]
pub struct WatcherRegistry<K> {
    inner: RwLock<HashMap<K, HashSet<String>>>,
}

impl<K> Default for WatcherRegistry<K> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> WatcherRegistry<K> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a watcher to a key.
    ///
    /// Returns `true` when this was the first watcher of the key.
    pub fn register(&self, key: K, watcher: &str) -> bool {
        let mut inner = self.inner.write();
        let set = inner.entry(key).or_default();
        let first = set.is_empty();
        set.insert(watcher.to_string()) && first
    }

    /// Remove a watcher from a key.
    ///
    /// Returns `true` when this removed the last watcher of the key. Removing
    /// an unknown watcher is a no-op.
    pub fn unregister(&self, key: &K, watcher: &str) -> bool {
        let mut inner = self.inner.write();
        let Some(set) = inner.get_mut(key) else {
            return false;
        };
        if !set.remove(watcher) {
            return false;
        }
        if set.is_empty() {
            inner.remove(key);
            return true;
        }
        false
    }

    /// Register many (key, watcher) pairs under one lock.
    ///
    /// Returns the keys that transitioned from zero to one watcher, in input
    /// order and without duplicates.
    pub fn register_many<'a>(&self, pairs: impl IntoIterator<Item = (K, &'a str)>) -> Vec<K> {
        let mut inner = self.inner.write();
        let mut first = Vec::new();
        for (key, watcher) in pairs {
            let set = inner.entry(key.clone()).or_default();
            let was_empty = set.is_empty();
            if set.insert(watcher.to_string()) && was_empty {
                first.push(key);
            }
        }
        first
    }

    /// Unregister many (key, watcher) pairs under one lock.
    ///
    /// Returns the keys that lost their last watcher.
    pub fn unregister_many<'a>(&self, pairs: impl IntoIterator<Item = (K, &'a str)>) -> Vec<K> {
        let mut inner = self.inner.write();
        let mut last = Vec::new();
        for (key, watcher) in pairs {
            let Some(set) = inner.get_mut(&key) else {
                continue;
            };
            if set.remove(watcher) && set.is_empty() {
                inner.remove(&key);
                last.push(key);
            }
        }
        last
    }

    #[cfg(test)]
    fn watchers(&self, key: &K) -> HashSet<String> {
        self.inner.read().get(key).cloned().unwrap_or_default()
    }

    /// Whether the key has at least one watcher.
    #[must_use]
    pub fn is_active(&self, key: &K) -> bool {
        self.inner.read().get(key).is_some_and(|set| !set.is_empty())
    }

    /// Drop a key with all its watchers.
    pub fn remove_key(&self, key: &K) -> Option<HashSet<String>> {
        self.inner.write().remove(key)
    }

    #[cfg(test)]
    fn active_keys(&self) -> Vec<K> {
        self.inner.read().keys().cloned().collect()
    }

    /// Registry statistics.
    #[must_use]
    pub fn stats(&self) -> WatcherStats {
        let inner = self.inner.read();
        WatcherStats {
            key_count: inner.len(),
            watcher_count: inner.values().map(HashSet::len).sum(),
        }
    }
}

// =============================================================================
// Subscription Registry (per endpoint client)
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct Placement {
    conn_id: ConnId,
    stamp_ms: i64,
}

/// One row of [`SubscriptionRegistry::stats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionStat {
    /// Subscription key.
    pub key: SubscriptionKey,
    /// Connection carrying the subscription.
    pub conn_id: ConnId,
    /// Last activity, milliseconds since the epoch.
    pub last_update_ms: i64,
    /// Milliseconds since the last activity.
    pub idle_ms: i64,
}

#[derive(Debug, Default)]
struct RegistryState {
    placements: HashMap<SubscriptionKey, Placement>,
    conn_counts: HashMap<ConnId, usize>,
}

impl RegistryState {
    fn bump(&mut self, conn_id: ConnId) {
        *self.conn_counts.entry(conn_id).or_insert(0) += 1;
    }

    fn drop_one(&mut self, conn_id: ConnId) {
        if let Some(count) = self.conn_counts.get_mut(&conn_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.conn_counts.remove(&conn_id);
            }
        }
    }
}

/// Map of subscription key → carrying connection and last-activity stamp.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    state: Mutex<RegistryState>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Place a key on a connection, stamping it with `now_ms`.
    ///
    /// Returns `false` if the key was already placed (the placement is kept).
    pub fn insert(&self, key: SubscriptionKey, conn_id: ConnId, now_ms: i64) -> bool {
        let mut state = self.state.lock();
        if state.placements.contains_key(&key) {
            return false;
        }
        state.placements.insert(
            key,
            Placement {
                conn_id,
                stamp_ms: now_ms,
            },
        );
        state.bump(conn_id);
        true
    }

    /// Remove a key, returning the connection that carried it.
    pub fn remove(&self, key: &SubscriptionKey) -> Option<ConnId> {
        let mut state = self.state.lock();
        let placement = state.placements.remove(key)?;
        state.drop_one(placement.conn_id);
        Some(placement.conn_id)
    }

    /// Record activity on a key. Returns `false` for unknown keys.
    pub fn touch(&self, key: &SubscriptionKey, now_ms: i64) -> bool {
        let mut state = self.state.lock();
        match state.placements.get_mut(key) {
            Some(placement) => {
                placement.stamp_ms = placement.stamp_ms.max(now_ms);
                true
            }
            None => false,
        }
    }

    /// Connection carrying a key.
    #[must_use]
    pub fn conn_of(&self, key: &SubscriptionKey) -> Option<ConnId> {
        self.state.lock().placements.get(key).map(|p| p.conn_id)
    }

    /// Whether the key is placed on any connection.
    #[must_use]
    pub fn contains(&self, key: &SubscriptionKey) -> bool {
        self.state.lock().placements.contains_key(key)
    }

    /// Keys carried by a connection, sorted.
    #[must_use]
    pub fn keys_for(&self, conn_id: ConnId) -> Vec<SubscriptionKey> {
        let state = self.state.lock();
        let mut keys: Vec<_> = state
            .placements
            .iter()
            .filter(|(_, p)| p.conn_id == conn_id)
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Number of keys carried by a connection.
    #[must_use]
    pub fn count_for(&self, conn_id: ConnId) -> usize {
        self.state
            .lock()
            .conn_counts
            .get(&conn_id)
            .copied()
            .unwrap_or(0)
    }

    /// Move every key of `from` onto `to`, restamping with `now_ms`.
    ///
    /// Returns the moved keys, sorted.
    pub fn rehome(&self, from: ConnId, to: ConnId, now_ms: i64) -> Vec<SubscriptionKey> {
        let mut state = self.state.lock();
        let mut moved = Vec::new();
        for (key, placement) in &mut state.placements {
            if placement.conn_id == from {
                placement.conn_id = to;
                placement.stamp_ms = now_ms;
                moved.push(key.clone());
            }
        }
        if let Some(count) = state.conn_counts.remove(&from) {
            *state.conn_counts.entry(to).or_insert(0) += count;
        }
        moved.sort();
        moved
    }

    /// Remove every key of a connection, returning them sorted.
    pub fn drain_conn(&self, conn_id: ConnId) -> Vec<SubscriptionKey> {
        let mut state = self.state.lock();
        let mut drained: Vec<_> = state
            .placements
            .iter()
            .filter(|(_, p)| p.conn_id == conn_id)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &drained {
            state.placements.remove(key);
        }
        state.conn_counts.remove(&conn_id);
        drained.sort();
        drained
    }

    /// Per-key statistics, sorted by key.
    #[must_use]
    pub fn stats(&self, now_ms: i64) -> Vec<SubscriptionStat> {
        let state = self.state.lock();
        let mut rows: Vec<_> = state
            .placements
            .iter()
            .map(|(key, p)| SubscriptionStat {
                key: key.clone(),
                conn_id: p.conn_id,
                last_update_ms: p.stamp_ms,
                idle_ms: now_ms.saturating_sub(p.stamp_ms),
            })
            .collect();
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        rows
    }

    /// Keys silent for longer than their tolerance.
    ///
    /// `tolerance_ms` returns `None` for keys that have no expected cadence.
    #[must_use]
    pub fn stale_keys(
        &self,
        now_ms: i64,
        tolerance_ms: impl Fn(&SubscriptionKey) -> Option<i64>,
    ) -> Vec<(ConnId, SubscriptionKey)> {
        self.stats(now_ms)
            .into_iter()
            .filter(|row| tolerance_ms(&row.key).is_some_and(|limit| row.idle_ms > limit))
            .map(|row| (row.conn_id, row.key))
            .collect()
    }

    /// Total number of keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().placements.len()
    }

    /// Whether no key is placed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Tests
// =============================================================================
