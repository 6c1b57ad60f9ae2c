//! Stream Payload Types
//!
//! Normalized rows produced by exchange decoders and delivered to watchers.
//! These types are protocol-agnostic: every exchange adapter maps its wire
//! format into them.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// Symbols and Markets
// =============================================================================

/// Unified symbol such as `BTC/USDT` or `BTC/USDT:USDT`.
pub type Symbol = String;

/// Market segment of an instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketType {
    /// Spot market.
    Spot,
    /// Margin market.
    Margin,
    /// Perpetual swap.
    Swap,
    /// Dated future.
    Future,
    /// Option.
    Option,
}

impl MarketType {
    /// All market types.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::Spot,
            Self::Margin,
            Self::Swap,
            Self::Future,
            Self::Option,
        ]
    }

    /// Lowercase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Spot => "spot",
            Self::Margin => "margin",
            Self::Swap => "swap",
            Self::Future => "future",
            Self::Option => "option",
        }
    }

    /// Whether instruments of this type settle in a contract currency.
    #[must_use]
    pub const fn is_contract(&self) -> bool {
        matches!(self, Self::Swap | Self::Future | Self::Option)
    }
}

impl fmt::Display for MarketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MarketType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "spot" => Ok(Self::Spot),
            "margin" => Ok(Self::Margin),
            "swap" => Ok(Self::Swap),
            "future" | "futures" => Ok(Self::Future),
            "option" => Ok(Self::Option),
            other => Err(format!("unknown market type: {other}")),
        }
    }
}

// =============================================================================
// Stream Kinds
// =============================================================================

/// The closed set of streams a watcher can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    /// Order book snapshots.
    OrderBook,
    /// Public trades.
    Trade,
    /// OHLCV candles.
    Kline,
    /// Mark price table.
    MarkPrice,
    /// Account balances.
    Balance,
    /// Open positions.
    Position,
    /// Own fills.
    MyTrade,
    /// Per-symbol account settings such as leverage.
    AccountConfig,
}

impl StreamKind {
    /// All stream kinds.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::OrderBook,
            Self::Trade,
            Self::Kline,
            Self::MarkPrice,
            Self::Balance,
            Self::Position,
            Self::MyTrade,
            Self::AccountConfig,
        ]
    }

    /// Snake-case name, used in queue keys and config variables.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::OrderBook => "orderbook",
            Self::Trade => "trades",
            Self::Kline => "ohlcv",
            Self::MarkPrice => "mark_price",
            Self::Balance => "balance",
            Self::Position => "positions",
            Self::MyTrade => "my_trades",
            Self::AccountConfig => "account_config",
        }
    }

    /// Whether the stream needs an authenticated connection.
    #[must_use]
    pub const fn is_private(&self) -> bool {
        matches!(
            self,
            Self::Balance | Self::Position | Self::MyTrade | Self::AccountConfig
        )
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Market Data
// =============================================================================

/// Aggressor side of a trade or side of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Buy.
    Buy,
    /// Sell.
    Sell,
}

impl Side {
    /// Parse a wire side, case-insensitively.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "buy" | "bid" => Some(Self::Buy),
            "sell" | "ask" => Some(Self::Sell),
            _ => None,
        }
    }
}

/// A public trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    /// Exchange trade id.
    pub id: String,
    /// Unified symbol.
    pub symbol: Symbol,
    /// Aggressor side.
    pub side: Option<Side>,
    /// Execution price.
    pub price: Decimal,
    /// Executed amount.
    pub amount: Decimal,
    /// `price * amount`.
    pub cost: Decimal,
    /// Exchange timestamp.
    pub timestamp: DateTime<Utc>,
}

/// One OHLCV candle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kline {
    /// Candle open time.
    pub open_time: DateTime<Utc>,
    /// Open price.
    pub open: Decimal,
    /// High price.
    pub high: Decimal,
    /// Low price.
    pub low: Decimal,
    /// Close price.
    pub close: Decimal,
    /// Base volume.
    pub volume: Decimal,
}

/// A candle tagged with the job it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolKline {
    /// Unified symbol.
    pub symbol: Symbol,
    /// Timeframe such as `1m` or `1h`.
    pub timeframe: String,
    /// The candle.
    pub kline: Kline,
}

/// Snapshot of mark prices keyed by symbol.
pub type MarkPrices = HashMap<Symbol, Decimal>;

// =============================================================================
// Account Data
// =============================================================================

/// Balance of a single currency.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    /// Available for trading.
    pub free: Decimal,
    /// Locked in orders or margin.
    pub used: Decimal,
    /// `free + used`.
    pub total: Decimal,
}

/// Balances snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balances {
    /// Per-currency balances.
    pub assets: HashMap<String, Asset>,
    /// Exchange update time.
    pub timestamp: Option<DateTime<Utc>>,
}

/// Direction of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    /// Long.
    Long,
    /// Short.
    Short,
    /// Net mode (sign of `contracts` gives direction).
    Net,
}

/// An open position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    /// Unified symbol.
    pub symbol: Symbol,
    /// Position side.
    pub side: PositionSide,
    /// Size in contracts.
    pub contracts: Decimal,
    /// Average entry price.
    pub entry_price: Option<Decimal>,
    /// Mark price at update time.
    pub mark_price: Option<Decimal>,
    /// Unrealized profit and loss.
    pub unrealized_pnl: Option<Decimal>,
    /// Leverage.
    pub leverage: Option<Decimal>,
    /// Exchange update time.
    pub timestamp: Option<DateTime<Utc>>,
}

/// Account setting of one symbol, emitted when it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Unified symbol.
    pub symbol: Symbol,
    /// Whole-number leverage.
    pub leverage: u32,
}

/// Fee charged on a fill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fee {
    /// Fee amount (positive is a charge).
    pub cost: Decimal,
    /// Fee currency.
    pub currency: String,
}

/// A fill of one of the account's own orders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MyTrade {
    /// Exchange trade id.
    pub id: String,
    /// Order id the fill belongs to.
    pub order_id: String,
    /// Unified symbol.
    pub symbol: Symbol,
    /// Order side.
    pub side: Option<Side>,
    /// Fill price.
    pub price: Decimal,
    /// Fill amount.
    pub amount: Decimal,
    /// Fee charged.
    pub fee: Option<Fee>,
    /// Fill time.
    pub timestamp: DateTime<Utc>,
}

// =============================================================================
// Tests
// =============================================================================
