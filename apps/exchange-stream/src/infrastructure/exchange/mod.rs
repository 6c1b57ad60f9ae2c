//! Exchange Adapters
//!
//! Wire protocols of the supported exchanges and an in-memory market
//! catalog. Each protocol implements [`ExchangeProtocol`]; the engine is
//! identical for all of them.
//!
//! - [`OkxProtocol`]: flat `{channel, instType, instId}` subscription
//!   arguments, raw `ping` heartbeat, passphrase login
//! - [`BybitProtocol`]: combined `orderbook.50.BTCUSDT` topics, JSON
//!   heartbeat, `auth` login with an expiring signature
//!
//! [`ExchangeProtocol`]: crate::application::ports::ExchangeProtocol

mod bybit;
mod markets;
mod okx;

use std::str::FromStr;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde_json::Value;
use sha2::Sha256;

pub use bybit::BybitProtocol;
pub use markets::StaticMarketCatalog;
pub use okx::OkxProtocol;

use crate::application::ports::{DecodeError, MarketCatalog};
use crate::domain::orderbook::PriceLevel;
use crate::domain::streaming::{MarketType, Symbol};

/// Largest number of channel arguments sent in one subscribe frame.
const MAX_ARGS_PER_FRAME: usize = 10;

// =============================================================================
// Signing
// =============================================================================

/// HMAC-SHA256 of `payload` keyed by `secret`.
fn hmac_sha256(secret: &str, payload: &str) -> Result<Vec<u8>, String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).map_err(|e| e.to_string())?;
    mac.update(payload.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

fn correlation_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

// =============================================================================
// Row Accessors
// =============================================================================

/// A string field; numbers are rendered, empty strings count as absent.
fn text(row: &Value, field: &str) -> Option<String> {
    match row.get(field)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn require_text(row: &Value, field: &'static str) -> Result<String, DecodeError> {
    text(row, field).ok_or(DecodeError::MissingField(field))
}

fn parse_decimal(field: &'static str, raw: &str) -> Result<Decimal, DecodeError> {
    Decimal::from_str(raw)
        .or_else(|_| Decimal::from_scientific(raw))
        .map_err(|_| DecodeError::InvalidField {
            field,
            value: raw.to_string(),
        })
}

fn decimal(row: &Value, field: &'static str) -> Result<Decimal, DecodeError> {
    parse_decimal(field, &require_text(row, field)?)
}

/// An optional decimal field. Present but unparsable values are errors.
fn opt_decimal(row: &Value, field: &'static str) -> Result<Option<Decimal>, DecodeError> {
    text(row, field)
        .map(|raw| parse_decimal(field, &raw))
        .transpose()
}

fn parse_millis(field: &'static str, raw: &str) -> Result<DateTime<Utc>, DecodeError> {
    raw.parse::<i64>()
        .ok()
        .and_then(DateTime::from_timestamp_millis)
        .ok_or_else(|| DecodeError::InvalidField {
            field,
            value: raw.to_string(),
        })
}

fn millis(row: &Value, field: &'static str) -> Result<DateTime<Utc>, DecodeError> {
    parse_millis(field, &require_text(row, field)?)
}

fn opt_millis(row: &Value, field: &'static str) -> Result<Option<DateTime<Utc>>, DecodeError> {
    text(row, field)
        .map(|raw| parse_millis(field, &raw))
        .transpose()
}

/// `[price, size, ...]` tuples; trailing elements are ignored.
fn levels(row: &Value, field: &'static str) -> Result<Vec<PriceLevel>, DecodeError> {
    let Some(raw) = row.get(field) else {
        return Ok(Vec::new());
    };
    let tuples = raw.as_array().ok_or_else(|| DecodeError::InvalidField {
        field,
        value: raw.to_string(),
    })?;

    tuples
        .iter()
        .map(|tuple| {
            let price = tuple.get(0).and_then(scalar);
            let size = tuple.get(1).and_then(scalar);
            match (price, size) {
                (Some(price), Some(size)) => Ok(PriceLevel::new(
                    parse_decimal(field, &price)?,
                    parse_decimal(field, &size)?,
                )),
                _ => Err(DecodeError::InvalidField {
                    field,
                    value: tuple.to_string(),
                }),
            }
        })
        .collect()
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Rows of a `data` array. A single object counts as one row.
fn rows(unit: &Value) -> Vec<&Value> {
    match unit.get("data") {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(obj @ Value::Object(_)) => vec![obj],
        _ => Vec::new(),
    }
}

/// Resolve a wire id, preferring the given market type.
fn resolve_symbol(
    markets: &dyn MarketCatalog,
    wire_id: &str,
    market_type: MarketType,
) -> Result<Symbol, DecodeError> {
    markets
        .symbol_for(wire_id, Some(market_type))
        .or_else(|_| markets.symbol_for(wire_id, None))
        .map_err(DecodeError::from)
}
