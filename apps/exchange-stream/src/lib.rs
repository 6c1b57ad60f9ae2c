#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements
    )
)]

//! Exchange Stream - Crypto Exchange Streaming Engine
//!
//! Keeps shared WebSocket connections to crypto exchanges and multiplexes
//! market data and private account streams to any number of in-process
//! watchers.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core streaming types and state
//!   - `streaming`: Normalized payloads (trades, klines, balances, positions)
//!   - `subscription`: Subscription keys, watcher sets, per-connection registry
//!   - `orderbook`: Local order book reconstruction and depth queries
//!   - `account`: Account credentials
//!
//! - **Application**: Port definitions
//!   - `ports`: Market metadata catalog and exchange wire protocol contracts
//!
//! - **Infrastructure**: Adapters and runtime
//!   - `ws`: Connection handles, frame codec, auth coordinator, keepalive, reconnect
//!   - `router`: Bounded fan-out queues with per-kind drop policies
//!   - `exchange`: OKX and Bybit protocol adapters, static market catalog
//!   - `engine`: The exchange instance tying everything together
//!   - `config`: Environment-driven settings
//!   - `telemetry` / `metrics`: Logging and Prometheus instrumentation
//!
//! # Data Flow
//!
//! ```text
//! watch_*() ──► resolve symbols ──► endpoint client ──► subscribe frame
//!                                         │
//! exchange WS ──► receive loop ──► decode ──► dispatch ──► order books
//!                                                    └───► output queues ──► watchers
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core streaming types with no I/O.
pub mod domain;

/// Application layer - Port definitions.
pub mod application;

/// Infrastructure layer - Adapters and runtime.
pub mod infrastructure;

/// Crate-wide error taxonomy.
pub mod error;

// =============================================================================
// Re-exports
// =============================================================================

// Errors
pub use error::{ErrorCode, StreamError};

// Domain types
pub use domain::account::{Credentials, LeverageBook};
pub use domain::orderbook::{
    AvgFill, BookAction, BookSide, BookUpdate, OrderBook, OrderBookError, OrderBookStore,
    PriceLevel, VolumeWalk,
};
pub use domain::streaming::{
    AccountConfig, Asset, Balances, Fee, Kline, MarkPrices, MarketType, MyTrade, Position, PositionSide, Side,
    StreamKind, Symbol, SymbolKline, Trade,
};
pub use domain::subscription::{
    ConnId, SubscriptionKey, SubscriptionRegistry, WatcherRegistry,
};

// Ports
pub use application::ports::{
    CatalogError, ChannelBinding, ChannelRequest, DecodeError, EndpointScope, ExchangeProtocol,
    InboundEvent, MarketCatalog, MarketInfo, OutboundFrame,
};

// Infrastructure
pub use infrastructure::config::{ConfigError, EngineConfig};
pub use infrastructure::engine::{EndpointStats, StreamEngine, WatchOptions};
pub use infrastructure::exchange::{BybitProtocol, OkxProtocol, StaticMarketCatalog};
pub use infrastructure::router::{DropPolicy, StreamReceiver, TryRecvError};

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, init as init_telemetry};
