//! Account State
//!
//! API credentials used to sign private-channel logins, and the per-account
//! leverage book that turns position updates into account-config changes.
//! The credentials' `Debug` implementation never prints secret material.

use std::collections::HashMap;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::RoundingStrategy;

use crate::domain::streaming::{AccountConfig, Position, Symbol};

/// API credentials for one exchange account.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    api_key: String,
    secret: String,
    passphrase: Option<String>,
}

impl Credentials {
    /// Create new credentials.
    #[must_use]
    pub const fn new(api_key: String, secret: String, passphrase: Option<String>) -> Self {
        Self {
            api_key,
            secret,
            passphrase,
        }
    }

    /// Get the API key.
    #[must_use]
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Get the API secret.
    #[must_use]
    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Get the passphrase, when the exchange requires one.
    #[must_use]
    pub fn passphrase(&self) -> Option<&str> {
        self.passphrase.as_deref()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"[REDACTED]")
            .field("secret", &"[REDACTED]")
            .field(
                "passphrase",
                &self.passphrase.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

// =============================================================================
// Leverage Book
// =============================================================================

/// Last leverage seen per symbol for one account.
#[derive(Debug, Default)]
pub struct LeverageBook {
    leverages: HashMap<Symbol, u32>,
}

impl LeverageBook {
    /// Create an empty book.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the leverage of each position and return the symbols whose
    /// leverage is new or changed.
    ///
    /// Leverage is rounded to a whole number; positions without a positive
    /// leverage are skipped.
    pub fn apply(&mut self, positions: &[Position]) -> Vec<AccountConfig> {
        let mut changes = Vec::new();
        for position in positions {
            if position.symbol.is_empty() {
                continue;
            }
            let Some(leverage) = position
                .leverage
                .map(|l| l.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero))
                .and_then(|l| l.to_u32())
                .filter(|l| *l > 0)
            else {
                continue;
            };
            if self.leverages.get(&position.symbol) == Some(&leverage) {
                continue;
            }
            self.leverages.insert(position.symbol.clone(), leverage);
            changes.push(AccountConfig {
                symbol: position.symbol.clone(),
                leverage,
            });
        }
        changes
    }

    /// Last recorded leverage of a symbol.
    #[must_use]
    pub fn leverage(&self, symbol: &str) -> Option<u32> {
        self.leverages.get(symbol).copied()
    }
}
