//! Domain Layer - Core streaming types and state.
//!
//! This layer contains the normalized stream payloads, subscription
//! bookkeeping and order book reconstruction. Nothing here performs I/O.

/// Account credentials.
pub mod account;

/// Local order book reconstruction and depth queries.
pub mod orderbook;

/// Normalized stream payloads (trades, klines, balances, positions).
pub mod streaming;

/// Subscription keys, watcher sets and per-connection registries.
pub mod subscription;
