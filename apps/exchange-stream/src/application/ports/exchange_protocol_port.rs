//! Exchange Protocol Port (Driven Port)
//!
//! Everything exchange-specific about a streaming API: which endpoint serves
//! a channel, how subscription keys are built, what subscribe and login
//! frames look like, and how raw push messages decode into normalized rows.
//! The connection, auth and routing machinery is shared by every exchange.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use thiserror::Error;

use super::market_catalog_port::{CatalogError, MarketCatalog, MarketInfo};
use crate::domain::account::Credentials;
use crate::domain::orderbook::BookUpdate;
use crate::domain::streaming::{Balances, MarketType, MyTrade, Position, Symbol, SymbolKline, Trade};
use crate::domain::subscription::SubscriptionKey;
use crate::error::StreamError;

// =============================================================================
// Endpoints and Channels
// =============================================================================

/// Which family of endpoint serves a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointScope {
    /// Public market data.
    Public,
    /// Public data served from a separate endpoint (e.g. candles).
    Business,
    /// Authenticated account data.
    Private,
}

impl EndpointScope {
    /// Whether connections to this endpoint need a login.
    #[must_use]
    pub const fn requires_login(&self) -> bool {
        matches!(self, Self::Private)
    }
}

/// A caller's interest, before it is turned into a subscription key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRequest {
    /// Order book of one market.
    OrderBook {
        /// Market.
        market: MarketInfo,
        /// Requested depth.
        depth: usize,
    },
    /// Public trades of one market.
    Trades {
        /// Market.
        market: MarketInfo,
    },
    /// Candles of one market.
    Kline {
        /// Market.
        market: MarketInfo,
        /// Unified timeframe such as `1m` or `1h`.
        timeframe: String,
    },
    /// Mark price of one market.
    MarkPrice {
        /// Market.
        market: MarketInfo,
    },
    /// Account balances.
    Balance,
    /// Open positions.
    Positions {
        /// Restrict to one market type.
        market_type: Option<MarketType>,
    },
    /// Own fills.
    MyTrades {
        /// Restrict to one market.
        market: Option<MarketInfo>,
        /// Restrict to one market type.
        market_type: Option<MarketType>,
    },
}

/// Where and under which key a channel is subscribed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelBinding {
    /// Canonical subscription key.
    pub key: SubscriptionKey,
    /// Endpoint family.
    pub scope: EndpointScope,
    /// Market type used to pick the endpoint URL.
    pub market_type: MarketType,
}

/// A text frame to send, with its correlation id if it expects a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    /// Serialized frame.
    pub text: String,
    /// Correlation id carried by the frame.
    pub correlation_id: Option<String>,
}

impl OutboundFrame {
    /// Frame that expects no correlated reply.
    #[must_use]
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            correlation_id: None,
        }
    }
}

// =============================================================================
// Decoded Events
// =============================================================================

/// A rejected login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRejection {
    /// Exchange error code.
    pub code: String,
    /// Exchange error message.
    pub message: String,
}

/// One decoded inbound unit.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// Heartbeat reply.
    Pong,
    /// Result of a login.
    Login(Result<(), LoginRejection>),
    /// Subscribe or unsubscribe acknowledgement without a pending callback.
    Ack {
        /// Key the ack refers to, when the exchange echoes it.
        key: Option<SubscriptionKey>,
        /// Whether this acknowledges a subscribe.
        subscribed: bool,
    },
    /// Error event that is not an auth failure.
    Error {
        /// Exchange error code.
        code: String,
        /// Exchange error message.
        message: String,
    },
    /// Order book push.
    Book {
        /// Subscription key.
        key: SubscriptionKey,
        /// Decoded update.
        update: BookUpdate,
    },
    /// Public trades.
    Trades {
        /// Subscription key.
        key: SubscriptionKey,
        /// Rows.
        trades: Vec<Trade>,
    },
    /// Candles.
    Klines {
        /// Subscription key.
        key: SubscriptionKey,
        /// Rows.
        klines: Vec<SymbolKline>,
    },
    /// Mark prices.
    MarkPrices {
        /// Subscription key.
        key: SubscriptionKey,
        /// Market type of the rows.
        market_type: MarketType,
        /// `(symbol, mark price)` rows.
        prices: Vec<(Symbol, Decimal)>,
    },
    /// Balance snapshot.
    Balance {
        /// Subscription key.
        key: SubscriptionKey,
        /// Balances.
        balances: Balances,
    },
    /// Position rows.
    Positions {
        /// Subscription key.
        key: SubscriptionKey,
        /// Rows.
        positions: Vec<Position>,
    },
    /// Own fills.
    MyTrades {
        /// Subscription key.
        key: SubscriptionKey,
        /// Rows.
        trades: Vec<MyTrade>,
    },
}

/// Errors while decoding a unit.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The unit has neither an event nor a channel discriminator.
    #[error("no recognizable discriminator")]
    NoDiscriminator,

    /// The channel is not one this protocol decodes.
    #[error("unhandled channel: {0}")]
    UnknownChannel(String),

    /// A required field is missing.
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// A field could not be parsed.
    #[error("invalid {field}: {value}")]
    InvalidField {
        /// Field name.
        field: &'static str,
        /// Raw value.
        value: String,
    },

    /// Instrument id not known to the catalog.
    #[error(transparent)]
    Market(#[from] CatalogError),
}

// =============================================================================
// Protocol Port
// =============================================================================

/// Port for one exchange's streaming wire protocol.
pub trait ExchangeProtocol: Send + Sync + 'static {
    /// Exchange name used in logs and metrics.
    fn name(&self) -> &'static str;

    /// URL of the endpoint for a scope and market type.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::NotSupported`] for combinations the exchange
    /// does not serve.
    fn endpoint_url(&self, scope: EndpointScope, market_type: MarketType)
    -> Result<String, StreamError>;

    /// Turn a caller's interest into a subscription key and endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::ParamInvalid`] for out-of-range arguments and
    /// [`StreamError::NotSupported`] for streams the exchange lacks.
    fn bind(&self, request: &ChannelRequest) -> Result<ChannelBinding, StreamError>;

    /// Build subscribe (or unsubscribe) frames covering `keys`.
    ///
    /// Large batches are split across frames; every frame carries its own
    /// correlation id.
    fn subscribe_frames(&self, keys: &[SubscriptionKey], subscribe: bool) -> Vec<OutboundFrame>;

    /// Build a signed login frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the signature cannot be produced.
    fn login_frame(&self, credentials: &Credentials, now: DateTime<Utc>)
    -> Result<String, StreamError>;

    /// Heartbeat frame sent by the keepalive supervisor.
    fn ping_frame(&self) -> String;

    /// Name of the field correlating replies with requests.
    fn correlation_field(&self) -> &'static str;

    /// Rejection carried by a correlated reply, if any.
    fn ack_error(&self, reply: &Value) -> Option<LoginRejection>;

    /// Longest silence tolerated on a key before resubscribing.
    fn max_silence(&self, key: &SubscriptionKey) -> Option<Duration>;

    /// Decode one unit (a JSON object) into events.
    ///
    /// `market_type` is the market type of the endpoint the unit arrived
    /// on; it disambiguates instrument ids listed in several segments.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::NoDiscriminator`] for units without an event
    /// or channel field, and other variants for malformed payloads.
    fn decode(
        &self,
        unit: &Value,
        market_type: MarketType,
        markets: &dyn MarketCatalog,
    ) -> Result<Vec<InboundEvent>, DecodeError>;
}
