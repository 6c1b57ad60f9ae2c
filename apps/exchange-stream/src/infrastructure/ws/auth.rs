//! Auth Coordinator
//!
//! Serializes the private-channel login per endpoint client and broadcasts
//! the outcome to every caller waiting on it.
//!
//! # Login Flow
//!
//! 1. The first caller of [`AuthCoordinator::ensure_login`] moves the slot
//!    to `LoginInFlight` and sends the signed login frame
//! 2. Later callers join the same in-flight login instead of sending another
//! 3. The dispatcher routes the server's login result into
//!    [`AuthCoordinator::complete`], which wakes every waiter
//!
//! # Reconnect Flow
//!
//! When a private connection is replaced the slot is reset to
//! `Unauthenticated` and the keys to restore are parked as a
//! [`PendingRestore`]. The next successful login hands that record back to
//! the dispatcher, which resubscribes exactly those keys.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::domain::subscription::{ConnId, SubscriptionKey};

/// Default bound on waiting for a login result.
pub const LOGIN_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Error Types
// =============================================================================

/// Login failures, shared by every waiter of the same login.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    /// No credentials are configured for the account.
    #[error("no credentials for account {0}")]
    MissingCredentials(String),

    /// The exchange rejected the login.
    #[error("login rejected ({code}): {message}")]
    Rejected {
        /// Exchange error code.
        code: String,
        /// Exchange error message.
        message: String,
    },

    /// No login result arrived in time.
    #[error("login timed out")]
    Timeout,

    /// The connection went away while the login was in flight.
    #[error("connection lost during login")]
    ConnectionLost,

    /// The login frame could not be sent.
    #[error("failed to send login frame")]
    SendFailed,

    /// The login frame could not be signed.
    #[error("failed to sign login: {0}")]
    Signing(String),
}

// =============================================================================
// Authentication State
// =============================================================================

/// Login state of one endpoint client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthState {
    /// No login sent on the current connection.
    #[default]
    Unauthenticated,
    /// A login is awaiting its result.
    LoginInFlight,
    /// The current connection is logged in.
    Authenticated,
}

/// Keys to resubscribe after the next successful login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRestore {
    /// Connection the keys live on.
    pub conn_id: ConnId,
    /// Keys active when the previous connection dropped.
    pub keys: Vec<SubscriptionKey>,
}

type Outcome = Option<Result<(), AuthError>>;

struct AuthSlot {
    state: AuthState,
    generation: u64,
    outcome: watch::Sender<Outcome>,
    pending_restore: Option<PendingRestore>,
}

impl AuthSlot {
    fn new() -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            state: AuthState::Unauthenticated,
            generation: 0,
            outcome,
            pending_restore: None,
        }
    }
}

// =============================================================================
// Coordinator
// =============================================================================

/// Per-client login state machine.
pub struct AuthCoordinator {
    slots: Mutex<HashMap<String, AuthSlot>>,
    login_timeout: Duration,
}

impl std::fmt::Debug for AuthCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthCoordinator")
            .field("clients", &self.slots.lock().len())
            .field("login_timeout", &self.login_timeout)
            .finish()
    }
}

impl Default for AuthCoordinator {
    fn default() -> Self {
        Self::new(LOGIN_TIMEOUT)
    }
}

impl AuthCoordinator {
    /// Create a coordinator with the given login timeout.
    #[must_use]
    pub fn new(login_timeout: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            login_timeout,
        }
    }

    /// Make sure the client `key` is logged in.
    ///
    /// Returns immediately if already authenticated. Otherwise exactly one
    /// caller runs `send_login`; everyone waits for the shared result.
    ///
    /// # Errors
    ///
    /// Returns the login failure seen by all waiters, [`AuthError::Timeout`]
    /// if no result arrives in time, or the error from `send_login`.
    pub async fn ensure_login<F, Fut>(&self, key: &str, send_login: F) -> Result<(), AuthError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), AuthError>>,
    {
        let (mut rx, initiator) = {
            let mut slots = self.slots.lock();
            let slot = slots.entry(key.to_string()).or_insert_with(AuthSlot::new);
            match slot.state {
                AuthState::Authenticated => return Ok(()),
                AuthState::LoginInFlight => (slot.outcome.subscribe(), None),
                AuthState::Unauthenticated => {
                    slot.state = AuthState::LoginInFlight;
                    slot.generation += 1;
                    slot.outcome.send_replace(None);
                    (slot.outcome.subscribe(), Some(slot.generation))
                }
            }
        };

        if let Some(generation) = initiator {
            debug!(client = key, "Sending login");
            if let Err(e) = send_login().await {
                self.fail_in_flight(key, generation, e.clone());
                return Err(e);
            }
        }

        let waited = tokio::time::timeout(self.login_timeout, async {
            rx.wait_for(Option::is_some).await.map(|seen| seen.clone())
        })
        .await;

        match waited {
            Ok(Ok(Some(outcome))) => outcome,
            Ok(Ok(None) | Err(_)) => Err(AuthError::ConnectionLost),
            Err(_) => {
                warn!(client = key, "Login timed out");
                if let Some(generation) = initiator {
                    self.fail_in_flight(key, generation, AuthError::Timeout);
                }
                Err(AuthError::Timeout)
            }
        }
    }

    /// Deliver a login result from the exchange.
    ///
    /// Returns the parked restore record when the login succeeded.
    pub fn complete(&self, key: &str, outcome: Result<(), AuthError>) -> Option<PendingRestore> {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(key) else {
            debug!(client = key, "Login result for unknown client");
            return None;
        };
        if slot.state != AuthState::LoginInFlight {
            debug!(client = key, state = ?slot.state, "Ignoring login result with no login in flight");
            return None;
        }

        let restore = match &outcome {
            Ok(()) => {
                info!(client = key, "Logged in");
                slot.state = AuthState::Authenticated;
                slot.pending_restore.take()
            }
            Err(e) => {
                warn!(client = key, error = %e, "Login failed");
                slot.state = AuthState::Unauthenticated;
                None
            }
        };
        slot.outcome.send_replace(Some(outcome));
        restore
    }

    /// Forget the login of a replaced connection and park the keys to restore.
    ///
    /// Waiters of a login in flight on the old connection see
    /// [`AuthError::ConnectionLost`]. A restore record not yet consumed is
    /// merged with the new one.
    pub fn reset_for_reconnect(&self, key: &str, restore: PendingRestore) {
        let mut slots = self.slots.lock();
        let slot = slots.entry(key.to_string()).or_insert_with(AuthSlot::new);

        if slot.state == AuthState::LoginInFlight {
            slot.outcome.send_replace(Some(Err(AuthError::ConnectionLost)));
        }
        slot.state = AuthState::Unauthenticated;
        slot.generation += 1;

        let merged = match slot.pending_restore.take() {
            Some(mut previous) => {
                previous.conn_id = restore.conn_id;
                for k in restore.keys {
                    if !previous.keys.contains(&k) {
                        previous.keys.push(k);
                    }
                }
                previous
            }
            None => restore,
        };
        debug!(client = key, keys = merged.keys.len(), "Parked keys for restore");
        slot.pending_restore = Some(merged);
    }

    /// Drop all state for a client.
    pub fn forget(&self, key: &str) {
        if let Some(slot) = self.slots.lock().remove(key)
            && slot.state == AuthState::LoginInFlight
        {
            slot.outcome.send_replace(Some(Err(AuthError::ConnectionLost)));
        }
    }

    /// Current state of a client.
    #[must_use]
    pub fn state(&self, key: &str) -> AuthState {
        self.slots
            .lock()
            .get(key)
            .map_or(AuthState::Unauthenticated, |slot| slot.state)
    }

    /// Restore record waiting for the next login, if any.
    #[must_use]
    pub fn pending_restore(&self, key: &str) -> Option<PendingRestore> {
        self.slots
            .lock()
            .get(key)
            .and_then(|slot| slot.pending_restore.clone())
    }

    fn fail_in_flight(&self, key: &str, generation: u64, error: AuthError) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(key)
            && slot.generation == generation
            && slot.state == AuthState::LoginInFlight
        {
            slot.state = AuthState::Unauthenticated;
            slot.outcome.send_replace(Some(Err(error)));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn key(inst: &str) -> SubscriptionKey {
        SubscriptionKey::instrument_type("orders", inst)
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_login() {
        let auth = Arc::new(AuthCoordinator::default());
        let sends = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..2 {
            let auth = Arc::clone(&auth);
            let sends = Arc::clone(&sends);
            tasks.push(tokio::spawn(async move {
                auth.ensure_login("acct@wss://private", || async move {
                    sends.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }));
        }

        while auth.state("acct@wss://private") != AuthState::LoginInFlight {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        auth.complete("acct@wss://private", Ok(()));

        for task in tasks {
            assert_eq!(task.await.unwrap(), Ok(()));
        }
        assert_eq!(sends.load(Ordering::SeqCst), 1);
        assert_eq!(auth.state("acct@wss://private"), AuthState::Authenticated);
    }

    #[tokio::test]
    async fn rejection_reaches_every_waiter() {
        let auth = Arc::new(AuthCoordinator::default());
        let rejected = AuthError::Rejected {
            code: "60009".into(),
            message: "Login failed.".into(),
        };

        let a = {
            let auth = Arc::clone(&auth);
            tokio::spawn(async move { auth.ensure_login("k", || async { Ok(()) }).await })
        };
        while auth.state("k") != AuthState::LoginInFlight {
            tokio::task::yield_now().await;
        }
        let b = {
            let auth = Arc::clone(&auth);
            tokio::spawn(async move {
                auth.ensure_login("k", || async { Err(AuthError::SendFailed) }).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        auth.complete("k", Err(rejected.clone()));

        assert_eq!(a.await.unwrap(), Err(rejected.clone()));
        assert_eq!(b.await.unwrap(), Err(rejected));
        assert_eq!(auth.state("k"), AuthState::Unauthenticated);
    }

    #[tokio::test]
    async fn authenticated_returns_immediately() {
        let auth = Arc::new(AuthCoordinator::default());
        let first = {
            let auth = Arc::clone(&auth);
            tokio::spawn(async move { auth.ensure_login("k", || async { Ok(()) }).await })
        };
        while auth.state("k") != AuthState::LoginInFlight {
            tokio::task::yield_now().await;
        }
        auth.complete("k", Ok(()));
        assert_eq!(first.await.unwrap(), Ok(()));

        // A second send would surface as SendFailed.
        let again = auth
            .ensure_login("k", || async { Err(AuthError::SendFailed) })
            .await;
        assert_eq!(again, Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_resets_state() {
        let auth = AuthCoordinator::new(Duration::from_millis(50));
        let result = auth.ensure_login("k", || async { Ok(()) }).await;
        assert_eq!(result, Err(AuthError::Timeout));
        assert_eq!(auth.state("k"), AuthState::Unauthenticated);

        // A late result is ignored.
        assert!(auth.complete("k", Ok(())).is_none());
        assert_eq!(auth.state("k"), AuthState::Unauthenticated);
    }

    #[tokio::test]
    async fn send_failure_is_returned() {
        let auth = AuthCoordinator::default();
        let result = auth
            .ensure_login("k", || async { Err(AuthError::SendFailed) })
            .await;
        assert_eq!(result, Err(AuthError::SendFailed));
        assert_eq!(auth.state("k"), AuthState::Unauthenticated);
    }

    #[tokio::test]
    async fn restore_handed_back_on_success_only() {
        let auth = Arc::new(AuthCoordinator::default());
        auth.reset_for_reconnect(
            "k",
            PendingRestore {
                conn_id: 2,
                keys: vec![key("SPOT"), key("SWAP")],
            },
        );
        assert_eq!(auth.state("k"), AuthState::Unauthenticated);

        let login = {
            let auth = Arc::clone(&auth);
            tokio::spawn(async move { auth.ensure_login("k", || async { Ok(()) }).await })
        };
        while auth.state("k") != AuthState::LoginInFlight {
            tokio::task::yield_now().await;
        }
        let restore = auth.complete("k", Ok(())).unwrap();
        assert_eq!(restore.conn_id, 2);
        assert_eq!(restore.keys, vec![key("SPOT"), key("SWAP")]);
        assert!(auth.pending_restore("k").is_none());
        login.await.unwrap().unwrap();
    }

    #[test]
    fn reset_merges_unconsumed_restore() {
        let auth = AuthCoordinator::default();
        auth.reset_for_reconnect(
            "k",
            PendingRestore {
                conn_id: 1,
                keys: vec![key("SPOT")],
            },
        );
        auth.reset_for_reconnect(
            "k",
            PendingRestore {
                conn_id: 3,
                keys: vec![key("SPOT"), key("SWAP")],
            },
        );

        let restore = auth.pending_restore("k").unwrap();
        assert_eq!(restore.conn_id, 3);
        assert_eq!(restore.keys, vec![key("SPOT"), key("SWAP")]);
    }

    #[tokio::test]
    async fn reset_wakes_in_flight_waiters() {
        let auth = Arc::new(AuthCoordinator::default());
        let login = {
            let auth = Arc::clone(&auth);
            tokio::spawn(async move { auth.ensure_login("k", || async { Ok(()) }).await })
        };
        while auth.state("k") != AuthState::LoginInFlight {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        auth.reset_for_reconnect(
            "k",
            PendingRestore {
                conn_id: 5,
                keys: Vec::new(),
            },
        );
        assert_eq!(login.await.unwrap(), Err(AuthError::ConnectionLost));
    }
}
