//! Keepalive Timer
//!
//! Drives the keepalive supervisor: emits a ping tick on the heartbeat
//! interval and a stale-check tick on the staleness interval. The supervisor
//! decides what each tick means for the live connections.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::infrastructure::config::KeepaliveSettings;

/// Shortest tick period; `interval_at` rejects a zero period.
const MIN_PERIOD: Duration = Duration::from_millis(10);

/// Ticks emitted by the keepalive timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveEvent {
    /// Send a heartbeat on every live connection.
    Ping,
    /// Compare subscription activity against the expected cadence.
    CheckStale,
}

/// Timer task feeding [`KeepaliveEvent`]s to the supervisor.
pub struct KeepaliveTimer {
    settings: KeepaliveSettings,
    event_tx: mpsc::Sender<KeepaliveEvent>,
    cancel: CancellationToken,
}

impl KeepaliveTimer {
    /// Create a new keepalive timer.
    #[must_use]
    pub const fn new(
        settings: KeepaliveSettings,
        event_tx: mpsc::Sender<KeepaliveEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            settings,
            event_tx,
            cancel,
        }
    }

    /// Run until cancelled or the supervisor goes away.
    pub async fn run(self) {
        let start = tokio::time::Instant::now();
        let mut ping = ticker(start, self.settings.ping_interval);
        let mut stale = ticker(start, self.settings.stale_check_interval);

        loop {
            let event = tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("Keepalive timer cancelled");
                    break;
                }
                _ = ping.tick() => KeepaliveEvent::Ping,
                _ = stale.tick(), if self.settings.stale_check => KeepaliveEvent::CheckStale,
            };

            if self.event_tx.send(event).await.is_err() {
                tracing::debug!("Keepalive channel closed, stopping timer");
                break;
            }
        }
    }
}

fn ticker(start: tokio::time::Instant, period: Duration) -> Interval {
    let period = period.max(MIN_PERIOD);
    let mut interval = tokio::time::interval_at(start + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(stale_check: bool) -> KeepaliveSettings {
        KeepaliveSettings {
            ping_interval: Duration::from_millis(20),
            stale_check,
            stale_check_interval: Duration::from_millis(30),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn emits_both_ticks() {
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(KeepaliveTimer::new(settings(true), tx, cancel.clone()).run());

        let mut seen = Vec::new();
        while seen.len() < 4 {
            seen.push(rx.recv().await.unwrap());
        }
        assert!(seen.contains(&KeepaliveEvent::Ping));
        assert!(seen.contains(&KeepaliveEvent::CheckStale));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stale_check_can_be_disabled() {
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(KeepaliveTimer::new(settings(false), tx, cancel.clone()).run());

        for _ in 0..5 {
            assert_eq!(rx.recv().await, Some(KeepaliveEvent::Ping));
        }

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn zero_intervals_still_tick() {
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let zero = KeepaliveSettings {
            ping_interval: Duration::ZERO,
            stale_check: true,
            stale_check_interval: Duration::ZERO,
        };
        let handle = tokio::spawn(KeepaliveTimer::new(zero, tx, cancel.clone()).run());

        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn stops_when_receiver_dropped() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let timer = KeepaliveTimer::new(settings(true), tx, CancellationToken::new());
        tokio::time::timeout(Duration::from_secs(1), timer.run())
            .await
            .expect("timer should stop");
    }
}
