//! In-memory market catalog.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::application::ports::{CatalogError, MarketCatalog, MarketInfo};
use crate::domain::streaming::{MarketType, Symbol};

#[derive(Debug, Default)]
struct Index {
    by_symbol: HashMap<Symbol, MarketInfo>,
    by_wire: HashMap<String, Vec<MarketInfo>>,
}

/// Market catalog backed by a fixed list of markets.
#[derive(Debug, Default)]
pub struct StaticMarketCatalog {
    index: RwLock<Index>,
}

impl StaticMarketCatalog {
    /// Catalog of the given markets.
    #[must_use]
    pub fn new(markets: impl IntoIterator<Item = MarketInfo>) -> Self {
        let catalog = Self::default();
        for market in markets {
            catalog.insert(market);
        }
        catalog
    }

    /// Parse a JSON array of markets.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::LoadFailed`] if the JSON does not describe
    /// a list of markets.
    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        let markets: Vec<MarketInfo> =
            serde_json::from_str(json).map_err(|e| CatalogError::LoadFailed(e.to_string()))?;
        Ok(Self::new(markets))
    }

    /// Read a JSON array of markets from a file.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::LoadFailed`] if the file cannot be read or
    /// parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| CatalogError::LoadFailed(format!("{}: {e}", path.display())))?;
        Self::from_json(&json)
    }

    /// Spot markets for `BASE/QUOTE` symbols, with wire ids joined by
    /// `separator` (`-` gives `BTC-USDT`, an empty separator `BTCUSDT`).
    #[must_use]
    pub fn spot(symbols: &[String], separator: &str) -> Self {
        Self::new(symbols.iter().filter_map(|symbol| {
            let (base, quote) = symbol.split_once('/')?;
            Some(MarketInfo {
                symbol: symbol.clone(),
                wire_id: format!("{base}{separator}{quote}"),
                market_type: MarketType::Spot,
                base: base.to_string(),
                quote: quote.to_string(),
            })
        }))
    }

    /// Add or replace a market.
    pub fn insert(&self, market: MarketInfo) {
        let mut index = self.index.write();
        if let Some(previous) = index.by_symbol.remove(&market.symbol)
            && let Some(listed) = index.by_wire.get_mut(&previous.wire_id)
        {
            listed.retain(|m| m.symbol != previous.symbol);
        }
        index
            .by_wire
            .entry(market.wire_id.clone())
            .or_default()
            .push(market.clone());
        index.by_symbol.insert(market.symbol.clone(), market);
    }

    /// Number of listed markets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.read().by_symbol.len()
    }

    /// Whether no market is listed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MarketCatalog for StaticMarketCatalog {
    async fn load_markets(&self) -> Result<(), CatalogError> {
        if self.is_empty() {
            return Err(CatalogError::LoadFailed("catalog is empty".into()));
        }
        Ok(())
    }

    fn market(&self, symbol: &str) -> Result<MarketInfo, CatalogError> {
        self.index
            .read()
            .by_symbol
            .get(symbol)
            .cloned()
            .ok_or_else(|| CatalogError::UnknownSymbol(symbol.to_string()))
    }

    fn symbol_for(
        &self,
        wire_id: &str,
        market_type: Option<MarketType>,
    ) -> Result<Symbol, CatalogError> {
        let index = self.index.read();
        let listed = index
            .by_wire
            .get(wire_id)
            .ok_or_else(|| CatalogError::UnknownWireId(wire_id.to_string()))?;
        listed
            .iter()
            .find(|m| market_type.is_none_or(|t| m.market_type == t))
            .map(|m| m.symbol.clone())
            .ok_or_else(|| CatalogError::UnknownWireId(wire_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> StaticMarketCatalog {
        StaticMarketCatalog::from_json(
            r#"[
                {"symbol": "BTC/USDT", "wire_id": "BTCUSDT", "market_type": "spot", "base": "BTC", "quote": "USDT"},
                {"symbol": "BTC/USDT:USDT", "wire_id": "BTCUSDT", "market_type": "swap", "base": "BTC", "quote": "USDT"}
            ]"#,
        )
        .unwrap()
    }

    #[test]
    fn same_wire_id_in_two_segments() {
        let catalog = catalog();
        assert_eq!(
            catalog.symbol_for("BTCUSDT", Some(MarketType::Swap)).unwrap(),
            "BTC/USDT:USDT"
        );
        assert_eq!(
            catalog.symbol_for("BTCUSDT", Some(MarketType::Spot)).unwrap(),
            "BTC/USDT"
        );
        assert!(catalog.symbol_for("BTCUSDT", Some(MarketType::Option)).is_err());
        assert!(catalog.symbol_for("BTCUSDT", None).is_ok());
    }

    #[test]
    fn unknown_lookups() {
        let catalog = catalog();
        assert_eq!(
            catalog.market("DOGE/USDT").unwrap_err(),
            CatalogError::UnknownSymbol("DOGE/USDT".into())
        );
        assert!(matches!(
            catalog.symbol_for("DOGEUSDT", None),
            Err(CatalogError::UnknownWireId(_))
        ));
    }

    #[test]
    fn insert_replaces_wire_id() {
        let catalog = StaticMarketCatalog::spot(&["BTC/USDT".to_string()], "-");
        assert_eq!(catalog.market("BTC/USDT").unwrap().wire_id, "BTC-USDT");

        let mut moved = catalog.market("BTC/USDT").unwrap();
        moved.wire_id = "XBT-USDT".into();
        catalog.insert(moved);

        assert!(catalog.symbol_for("BTC-USDT", None).is_err());
        assert_eq!(catalog.symbol_for("XBT-USDT", None).unwrap(), "BTC/USDT");
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn bad_json_fails_to_load() {
        assert!(matches!(
            StaticMarketCatalog::from_json("{}"),
            Err(CatalogError::LoadFailed(_))
        ));
    }

    #[tokio::test]
    async fn empty_catalog_fails_to_load() {
        assert!(StaticMarketCatalog::default().load_markets().await.is_err());
        assert!(catalog().load_markets().await.is_ok());
    }
}
