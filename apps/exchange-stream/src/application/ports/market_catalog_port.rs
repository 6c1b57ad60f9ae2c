//! Market Catalog Port (Driven Port)
//!
//! Resolves unified symbols to wire instrument ids and back. Loading and
//! normalizing market metadata happens behind this port.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::streaming::{MarketType, Symbol};

/// Errors from market lookups.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CatalogError {
    /// The unified symbol is not listed.
    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),

    /// The wire instrument id is not listed.
    #[error("unknown instrument id: {0}")]
    UnknownWireId(String),

    /// Market metadata could not be loaded.
    #[error("failed to load markets: {0}")]
    LoadFailed(String),
}

/// Metadata of one listed market.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketInfo {
    /// Unified symbol, e.g. `BTC/USDT:USDT`.
    pub symbol: Symbol,
    /// Exchange instrument id, e.g. `BTC-USDT-SWAP`.
    pub wire_id: String,
    /// Market segment.
    pub market_type: MarketType,
    /// Base currency.
    pub base: String,
    /// Quote currency.
    pub quote: String,
}

/// Port for market metadata.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketCatalog: Send + Sync {
    /// Make sure market metadata is loaded. Called before every watch.
    async fn load_markets(&self) -> Result<(), CatalogError>;

    /// Look up a market by unified symbol.
    fn market(&self, symbol: &str) -> Result<MarketInfo, CatalogError>;

    /// Resolve a wire instrument id, optionally within one market type.
    fn symbol_for(
        &self,
        wire_id: &str,
        market_type: Option<MarketType>,
    ) -> Result<Symbol, CatalogError>;
}
