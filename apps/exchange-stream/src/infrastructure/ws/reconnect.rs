//! Reconnection Policy
//!
//! Exponential backoff with jitter for re-establishing a dropped connection.
//! The first delay depends on how the connection ended: transient server
//! faults retry quickly, an explicit "try again later" waits longer.

use std::time::Duration;

use rand::Rng;

use super::connection::ConnectionError;
use crate::infrastructure::config::ReconnectSettings;

/// Delay before the first attempt after an abnormal closure or transport fault.
pub const FAST_RETRY: Duration = Duration::from_millis(500);

/// Delay before the first attempt after a "try again later" close.
pub const TRY_AGAIN_LATER: Duration = Duration::from_secs(10);

/// Delay before the first attempt after any other close.
pub const DEFAULT_RETRY: Duration = Duration::from_secs(1);

/// First reconnect delay for the error that ended a connection.
#[must_use]
pub fn initial_delay_for(error: &ConnectionError) -> Duration {
    match error {
        ConnectionError::Eof | ConnectionError::Reset => FAST_RETRY,
        ConnectionError::Closed { code, .. } => match *code {
            // abnormal closure, internal error, service restart
            1006 | 1011 | 1012 => FAST_RETRY,
            1013 => TRY_AGAIN_LATER,
            _ => DEFAULT_RETRY,
        },
        _ => DEFAULT_RETRY,
    }
}

/// Reconnection policy implementing exponential backoff with jitter.
#[derive(Debug)]
pub struct ReconnectPolicy {
    settings: ReconnectSettings,
    initial_delay: Duration,
    current_delay: Duration,
    attempt_count: u32,
}

impl ReconnectPolicy {
    /// Create a policy starting at `initial_delay`.
    #[must_use]
    pub const fn new(settings: ReconnectSettings, initial_delay: Duration) -> Self {
        Self {
            settings,
            initial_delay,
            current_delay: initial_delay,
            attempt_count: 0,
        }
    }

    /// Create a policy whose first delay matches how the connection ended.
    #[must_use]
    pub fn after(settings: ReconnectSettings, error: &ConnectionError) -> Self {
        Self::new(settings, initial_delay_for(error))
    }

    /// Get the next delay, or `None` once max attempts are exhausted.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.should_retry() {
            return None;
        }

        self.attempt_count += 1;
        let delay_with_jitter = self.apply_jitter(self.current_delay);

        #[allow(clippy::cast_precision_loss)]
        let scaled = (self.current_delay.as_millis() as f64 * self.settings.multiplier).round();
        let next_millis = if scaled.is_finite() && scaled > 0.0 {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            {
                scaled as u128
            }
        } else {
            0
        };
        let capped = next_millis.min(self.settings.max_delay.as_millis());
        self.current_delay = Duration::from_millis(u64::try_from(capped).unwrap_or(u64::MAX));

        Some(delay_with_jitter)
    }

    /// Reset after a successful connection.
    pub const fn reset(&mut self) {
        self.current_delay = self.initial_delay;
        self.attempt_count = 0;
    }

    /// Attempts made so far.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Whether another attempt is allowed.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.settings.max_attempts == 0 || self.attempt_count < self.settings.max_attempts
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.settings.jitter <= 0.0 {
            return duration;
        }

        #[allow(clippy::cast_precision_loss)]
        let base_millis = duration.as_millis() as f64;
        let jitter_range = base_millis * self.settings.jitter;
        let jitter: f64 = rand::rng().random_range(-jitter_range..=jitter_range);
        let adjusted_millis = (base_millis + jitter).max(1.0);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let adjusted_u64 = adjusted_millis as u64;
        Duration::from_millis(adjusted_u64)
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn settings(max_attempts: u32) -> ReconnectSettings {
        ReconnectSettings {
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.0,
            max_attempts,
        }
    }

    #[test_case(ConnectionError::Eof, FAST_RETRY ; "eof")]
    #[test_case(ConnectionError::Reset, FAST_RETRY ; "reset")]
    #[test_case(ConnectionError::Closed { code: 1006, reason: String::new() }, FAST_RETRY ; "abnormal")]
    #[test_case(ConnectionError::Closed { code: 1011, reason: String::new() }, FAST_RETRY ; "internal error")]
    #[test_case(ConnectionError::Closed { code: 1012, reason: String::new() }, FAST_RETRY ; "service restart")]
    #[test_case(ConnectionError::Closed { code: 1013, reason: String::new() }, TRY_AGAIN_LATER ; "try again later")]
    #[test_case(ConnectionError::Closed { code: 1000, reason: String::new() }, DEFAULT_RETRY ; "normal")]
    #[test_case(ConnectionError::Read("boom".into()), DEFAULT_RETRY ; "read error")]
    fn first_delay_by_close(error: ConnectionError, expected: Duration) {
        assert_eq!(initial_delay_for(&error), expected);
    }

    #[test]
    fn exponential_backoff() {
        let mut policy = ReconnectPolicy::new(settings(0), Duration::from_millis(500));
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(500)));
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(1000)));
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(2000)));
    }

    #[test]
    fn max_delay_cap() {
        let mut policy = ReconnectPolicy::new(settings(0), Duration::from_secs(8));
        let _ = policy.next_delay();
        assert_eq!(policy.next_delay(), Some(Duration::from_secs(10)));
        assert_eq!(policy.next_delay(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn max_attempts_then_reset() {
        let mut policy = ReconnectPolicy::after(settings(2), &ConnectionError::Eof);
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_none());
        assert!(!policy.should_retry());

        policy.reset();
        assert_eq!(policy.attempt_count(), 0);
        assert_eq!(policy.next_delay(), Some(FAST_RETRY));
    }

    #[test]
    fn jitter_bounds() {
        for _ in 0..100 {
            let mut policy = ReconnectPolicy::new(
                ReconnectSettings {
                    jitter: 0.1,
                    ..settings(0)
                },
                Duration::from_millis(1000),
            );
            let millis = policy.next_delay().unwrap().as_millis();
            assert!((900..=1100).contains(&millis), "delay {millis}ms out of bounds");
        }
    }
}
