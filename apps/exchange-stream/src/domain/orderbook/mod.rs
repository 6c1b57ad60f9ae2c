//! Local Order Book Reconstruction
//!
//! Applies snapshot and diff pushes to a per-symbol two-sided book and
//! answers depth queries against it.
//!
//! Bids are stored with [`Reverse`] keys so that iterating the underlying
//! [`BTreeMap`] yields the highest bid first; asks use natural ordering. Every
//! update uses replace semantics: a size of zero removes a level, any other
//! size sets it. Levels beyond the configured depth are not retained, so a
//! query that would need them reports a fill rate below one instead of
//! extrapolating.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::streaming::Symbol;

/// Depth used when neither the watcher nor the snapshot implies one.
pub const DEFAULT_DEPTH: usize = 400;

// =============================================================================
// Errors
// =============================================================================

/// Errors raised while applying an update.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OrderBookError {
    /// A level had a non-positive price or a negative size.
    #[error("invalid {side:?} level: price {price}, size {size}")]
    InvalidLevel {
        /// Side of the offending level.
        side: BookSide,
        /// Level price.
        price: Decimal,
        /// Level size.
        size: Decimal,
    },
}

// =============================================================================
// Update Types
// =============================================================================

/// Side of the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookSide {
    /// Buy side, best price is the highest.
    Bid,
    /// Sell side, best price is the lowest.
    Ask,
}

/// How an update relates to the current book state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookAction {
    /// Replaces the whole book.
    Snapshot,
    /// Changes only the listed levels.
    Diff,
}

/// One price level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    /// Level price.
    pub price: Decimal,
    /// Level size. Zero means "remove" inside an update.
    pub size: Decimal,
}

impl PriceLevel {
    /// Create a level.
    #[must_use]
    pub const fn new(price: Decimal, size: Decimal) -> Self {
        Self { price, size }
    }
}

/// A decoded order book push for one symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookUpdate {
    /// Unified symbol.
    pub symbol: Symbol,
    /// Snapshot or diff.
    pub action: BookAction,
    /// Bid levels.
    pub bids: Vec<PriceLevel>,
    /// Ask levels.
    pub asks: Vec<PriceLevel>,
    /// Exchange timestamp.
    pub timestamp: Option<DateTime<Utc>>,
    /// Exchange sequence number.
    pub nonce: Option<i64>,
}

impl BookUpdate {
    /// Check every level before anything is applied.
    ///
    /// # Errors
    ///
    /// Returns [`OrderBookError::InvalidLevel`] for the first bad level.
    pub fn validate(&self) -> Result<(), OrderBookError> {
        let sides = [(BookSide::Bid, &self.bids), (BookSide::Ask, &self.asks)];
        for (side, levels) in sides {
            if let Some(bad) = levels
                .iter()
                .find(|l| l.price <= Decimal::ZERO || l.size < Decimal::ZERO)
            {
                return Err(OrderBookError::InvalidLevel {
                    side,
                    price: bad.price,
                    size: bad.size,
                });
            }
        }
        Ok(())
    }
}

// =============================================================================
// Query Results
// =============================================================================

/// Result of [`OrderBook::sum_volume_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeWalk {
    /// Cumulative size of the levels walked.
    pub volume: Decimal,
    /// Share of the price distance the retained levels cover, in `[0, 1]`.
    pub fill_rate: Decimal,
}

/// Result of [`OrderBook::avg_price`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvgFill {
    /// Volume-weighted average price of the walked prefix.
    pub avg_price: Decimal,
    /// Price of the last level touched.
    pub last_price: Decimal,
    /// Volume actually available, at most the requested volume.
    pub filled: Decimal,
}

// =============================================================================
// Order Book
// =============================================================================

/// Two-sided price level store for one symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBook {
    symbol: Symbol,
    depth: usize,
    /// Reverse(price) -> size, highest bid first.
    bids: BTreeMap<Reverse<Decimal>, Decimal>,
    /// price -> size, lowest ask first.
    asks: BTreeMap<Decimal, Decimal>,
    timestamp: Option<DateTime<Utc>>,
    nonce: Option<i64>,
}

impl OrderBook {
    /// Create an empty book retaining at most `depth` levels per side.
    #[must_use]
    pub fn new(symbol: impl Into<Symbol>, depth: usize) -> Self {
        Self {
            symbol: symbol.into(),
            depth: depth.max(1),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            timestamp: None,
            nonce: None,
        }
    }

    /// Apply a snapshot or diff. Both sides are applied before returning.
    ///
    /// # Errors
    ///
    /// Returns [`OrderBookError::InvalidLevel`] if any level is invalid. The
    /// book is left untouched in that case.
    pub fn apply(&mut self, update: &BookUpdate) -> Result<(), OrderBookError> {
        update.validate()?;

        if update.action == BookAction::Snapshot {
            self.bids.clear();
            self.asks.clear();
        }
        for level in &update.bids {
            set_level(&mut self.bids, Reverse(level.price), level.size);
        }
        for level in &update.asks {
            set_level(&mut self.asks, level.price, level.size);
        }
        self.truncate();

        if update.timestamp.is_some() {
            self.timestamp = update.timestamp;
        }
        if update.nonce.is_some() {
            self.nonce = update.nonce;
        }
        Ok(())
    }

    /// Change the retained depth, dropping levels past it.
    pub fn set_depth(&mut self, depth: usize) {
        self.depth = depth.max(1);
        self.truncate();
    }

    fn truncate(&mut self) {
        while self.bids.len() > self.depth {
            self.bids.pop_last();
        }
        while self.asks.len() > self.depth {
            self.asks.pop_last();
        }
    }

    /// Unified symbol.
    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Retained depth per side.
    #[must_use]
    pub const fn depth(&self) -> usize {
        self.depth
    }

    /// Timestamp of the last applied update.
    #[must_use]
    pub const fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    /// Sequence number of the last applied update.
    #[must_use]
    pub const fn nonce(&self) -> Option<i64> {
        self.nonce
    }

    /// Highest bid.
    #[must_use]
    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.bids
            .iter()
            .next()
            .map(|(Reverse(price), size)| PriceLevel::new(*price, *size))
    }

    /// Lowest ask.
    #[must_use]
    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.asks
            .iter()
            .next()
            .map(|(price, size)| PriceLevel::new(*price, *size))
    }

    /// Size resting at a price, if the level exists.
    #[must_use]
    pub fn level(&self, side: BookSide, price: Decimal) -> Option<Decimal> {
        match side {
            BookSide::Bid => self.bids.get(&Reverse(price)).copied(),
            BookSide::Ask => self.asks.get(&price).copied(),
        }
    }

    /// Number of levels on a side.
    #[must_use]
    pub fn len(&self, side: BookSide) -> usize {
        match side {
            BookSide::Bid => self.bids.len(),
            BookSide::Ask => self.asks.len(),
        }
    }

    /// Whether both sides are empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    /// Levels of one side, best first.
    #[must_use]
    pub fn levels(&self, side: BookSide) -> Vec<PriceLevel> {
        self.walk(side).collect()
    }

    /// Iterate one side from the best price outward.
    fn walk(&self, side: BookSide) -> Box<dyn Iterator<Item = PriceLevel> + '_> {
        match side {
            BookSide::Bid => Box::new(
                self.bids
                    .iter()
                    .map(|(Reverse(price), size)| PriceLevel::new(*price, *size)),
            ),
            BookSide::Ask => Box::new(
                self.asks
                    .iter()
                    .map(|(price, size)| PriceLevel::new(*price, *size)),
            ),
        }
    }

    /// Sum the size resting between the best price and `target`.
    ///
    /// Bids accumulate levels priced at or above `target`, asks levels priced
    /// at or below it. The fill rate is one when a retained level at or past
    /// `target` exists; otherwise it is the fraction of the distance from the
    /// best price to `target` that the retained levels span. An empty side
    /// yields zero volume and a zero fill rate.
    #[must_use]
    pub fn sum_volume_to(&self, side: BookSide, target: Decimal) -> VolumeWalk {
        let within = |price: Decimal| match side {
            BookSide::Bid => price >= target,
            BookSide::Ask => price <= target,
        };

        let mut volume = Decimal::ZERO;
        let mut best = None;
        let mut last = None;
        for level in self.walk(side) {
            best.get_or_insert(level.price);
            if !within(level.price) || level.price == target {
                if level.price == target {
                    volume += level.size;
                }
                return VolumeWalk {
                    volume,
                    fill_rate: Decimal::ONE,
                };
            }
            volume += level.size;
            last = Some(level.price);
        }

        let fill_rate = match (best, last) {
            (Some(best), Some(last)) if best != target => {
                ((best - last) / (best - target)).abs().min(Decimal::ONE)
            }
            _ => Decimal::ZERO,
        };
        VolumeWalk { volume, fill_rate }
    }

    /// Volume-weighted price of taking `volume` from one side.
    ///
    /// Walks the minimal prefix of levels whose cumulative size covers
    /// `volume`, taking only what is needed from the last one. If the side
    /// runs out first, `filled` reports how much was available. Returns
    /// `None` for an empty side or a non-positive volume.
    #[must_use]
    pub fn avg_price(&self, side: BookSide, volume: Decimal) -> Option<AvgFill> {
        if volume <= Decimal::ZERO {
            return None;
        }

        let mut remaining = volume;
        let mut notional = Decimal::ZERO;
        let mut last_price = None;
        for level in self.walk(side) {
            let take = level.size.min(remaining);
            notional += take * level.price;
            remaining -= take;
            last_price = Some(level.price);
            if remaining.is_zero() {
                break;
            }
        }

        let last_price = last_price?;
        let filled = volume - remaining;
        if filled.is_zero() {
            return None;
        }
        Some(AvgFill {
            avg_price: notional / filled,
            last_price,
            filled,
        })
    }
}

fn set_level<K: Ord>(side: &mut BTreeMap<K, Decimal>, key: K, size: Decimal) {
    if size.is_zero() {
        side.remove(&key);
    } else {
        side.insert(key, size);
    }
}

// =============================================================================
// Order Book Store
// =============================================================================

/// Per-symbol books, each behind its own lock.
///
/// Depth queries take the same lock as mutation, so a reader never observes
/// a half-applied update.
#[derive(Debug)]
pub struct OrderBookStore {
    books: RwLock<HashMap<Symbol, Arc<Mutex<OrderBook>>>>,
    limits: RwLock<HashMap<Symbol, usize>>,
    default_depth: usize,
}

impl Default for OrderBookStore {
    fn default() -> Self {
        Self::new(DEFAULT_DEPTH)
    }
}

impl OrderBookStore {
    /// Create an empty store.
    #[must_use]
    pub fn new(default_depth: usize) -> Self {
        Self {
            books: RwLock::new(HashMap::new()),
            limits: RwLock::new(HashMap::new()),
            default_depth: default_depth.max(1),
        }
    }

    /// Remember the depth requested for a symbol and apply it to an existing book.
    pub fn set_limit(&self, symbol: &str, depth: usize) {
        self.limits.write().insert(symbol.to_string(), depth);
        if let Some(book) = self.books.read().get(symbol) {
            book.lock().set_depth(depth);
        }
    }

    /// Depth a new book for `symbol` is built with.
    fn depth_for(&self, update: &BookUpdate) -> usize {
        if let Some(limit) = self.limits.read().get(&update.symbol) {
            return *limit;
        }
        match update.bids.len().max(update.asks.len()) {
            0 => self.default_depth,
            n if update.action == BookAction::Snapshot => n,
            _ => self.default_depth,
        }
    }

    fn slot_for(&self, update: &BookUpdate) -> Arc<Mutex<OrderBook>> {
        if let Some(slot) = self.books.read().get(&update.symbol) {
            return Arc::clone(slot);
        }
        let depth = self.depth_for(update);
        let mut books = self.books.write();
        Arc::clone(books.entry(update.symbol.clone()).or_insert_with(|| {
            Arc::new(Mutex::new(OrderBook::new(update.symbol.clone(), depth)))
        }))
    }

    /// Apply an update and return a copy of the resulting book.
    ///
    /// A snapshot, or any update for a symbol with no book yet, rebuilds the
    /// book from scratch.
    ///
    /// # Errors
    ///
    /// Returns [`OrderBookError::InvalidLevel`] without touching any book.
    pub fn apply(&self, update: &BookUpdate) -> Result<OrderBook, OrderBookError> {
        update.validate()?;

        let slot = self.slot_for(update);
        let mut book = slot.lock();
        if update.action == BookAction::Snapshot {
            *book = OrderBook::new(update.symbol.clone(), self.depth_for(update));
        }
        book.apply(update)?;
        Ok(book.clone())
    }

    /// Copy of a symbol's book.
    #[must_use]
    pub fn snapshot(&self, symbol: &str) -> Option<OrderBook> {
        let slot = self.books.read().get(symbol).cloned()?;
        let book = slot.lock().clone();
        Some(book)
    }

    /// Run a query against a symbol's book under its lock.
    pub fn with_book<R>(&self, symbol: &str, query: impl FnOnce(&OrderBook) -> R) -> Option<R> {
        let slot = self.books.read().get(symbol).cloned()?;
        let book = slot.lock();
        Some(query(&book))
    }

    /// Evict a symbol's book and its depth limit.
    pub fn remove(&self, symbol: &str) -> Option<OrderBook> {
        self.limits.write().remove(symbol);
        let slot = self.books.write().remove(symbol)?;
        let book = slot.lock().clone();
        Some(book)
    }

    /// Symbols with a book.
    #[must_use]
    pub fn symbols(&self) -> Vec<Symbol> {
        let mut symbols: Vec<_> = self.books.read().keys().cloned().collect();
        symbols.sort();
        symbols
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn dec(raw: &str) -> Decimal {
        raw.parse().unwrap()
    }

    fn lv(price: &str, size: &str) -> PriceLevel {
        PriceLevel::new(dec(price), dec(size))
    }

    fn update(action: BookAction, bids: Vec<PriceLevel>, asks: Vec<PriceLevel>) -> BookUpdate {
        BookUpdate {
            symbol: "BTC/USDT".to_string(),
            action,
            bids,
            asks,
            timestamp: None,
            nonce: None,
        }
    }

    fn sample_book() -> OrderBook {
        let mut book = OrderBook::new("BTC/USDT", 10);
        book.apply(&update(
            BookAction::Snapshot,
            vec![lv("100", "1"), lv("99", "2"), lv("98", "3")],
            vec![lv("101", "1"), lv("102", "2"), lv("103", "3")],
        ))
        .unwrap();
        book
    }

    #[test]
    fn snapshot_orders_both_sides() {
        let book = sample_book();
        assert_eq!(book.best_bid(), Some(lv("100", "1")));
        assert_eq!(book.best_ask(), Some(lv("101", "1")));
        assert_eq!(
            book.levels(BookSide::Bid),
            vec![lv("100", "1"), lv("99", "2"), lv("98", "3")]
        );
    }

    #[test]
    fn diff_replaces_and_removes() {
        let mut book = sample_book();
        book.apply(&update(
            BookAction::Diff,
            vec![lv("99", "5"), lv("100", "0")],
            vec![lv("104", "1")],
        ))
        .unwrap();

        assert_eq!(book.level(BookSide::Bid, dec("99")), Some(dec("5")));
        assert_eq!(book.level(BookSide::Bid, dec("100")), None);
        assert_eq!(book.len(BookSide::Ask), 4);
    }

    #[test]
    fn snapshot_discards_previous_levels() {
        let mut book = sample_book();
        book.apply(&update(BookAction::Snapshot, vec![lv("50", "1")], vec![]))
            .unwrap();
        assert_eq!(book.len(BookSide::Bid), 1);
        assert!(book.best_ask().is_none());
    }

    #[test]
    fn depth_cap_keeps_best_levels() {
        let mut book = OrderBook::new("BTC/USDT", 2);
        book.apply(&update(
            BookAction::Snapshot,
            vec![lv("98", "1"), lv("100", "1"), lv("99", "1")],
            vec![lv("103", "1"), lv("101", "1"), lv("102", "1")],
        ))
        .unwrap();

        assert_eq!(book.levels(BookSide::Bid), vec![lv("100", "1"), lv("99", "1")]);
        assert_eq!(book.levels(BookSide::Ask), vec![lv("101", "1"), lv("102", "1")]);
    }

    #[test]
    fn invalid_level_leaves_book_untouched() {
        let mut book = sample_book();
        let before = book.clone();
        let err = book
            .apply(&update(
                BookAction::Diff,
                vec![lv("99", "5")],
                vec![lv("101", "-1")],
            ))
            .unwrap_err();
        assert!(matches!(err, OrderBookError::InvalidLevel { side: BookSide::Ask, .. }));
        assert_eq!(book, before);
    }

    #[test_case(BookSide::Bid, "99", "3", "1" ; "bid target inside")]
    #[test_case(BookSide::Bid, "100", "1", "1" ; "bid target at best")]
    #[test_case(BookSide::Bid, "96", "6", "0.5" ; "bid target past retained")]
    #[test_case(BookSide::Bid, "105", "0", "1" ; "bid target above best")]
    #[test_case(BookSide::Ask, "102.5", "3", "1" ; "ask target between levels")]
    #[test_case(BookSide::Ask, "105", "6", "0.5" ; "ask target past retained")]
    fn sum_volume_to_cases(side: BookSide, target: &str, volume: &str, fill: &str) {
        let walk = sample_book().sum_volume_to(side, dec(target));
        assert_eq!(walk.volume, dec(volume));
        assert_eq!(walk.fill_rate, dec(fill));
    }

    #[test]
    fn sum_volume_to_empty_side() {
        let book = OrderBook::new("BTC/USDT", 5);
        let walk = book.sum_volume_to(BookSide::Ask, dec("100"));
        assert_eq!(walk.volume, Decimal::ZERO);
        assert_eq!(walk.fill_rate, Decimal::ZERO);
    }

    #[test]
    fn avg_price_partial_last_level() {
        let fill = sample_book().avg_price(BookSide::Ask, dec("2")).unwrap();
        // 1 @ 101 + 1 @ 102
        assert_eq!(fill.avg_price, dec("101.5"));
        assert_eq!(fill.last_price, dec("102"));
        assert_eq!(fill.filled, dec("2"));
    }

    #[test]
    fn avg_price_exact_prefix() {
        let fill = sample_book().avg_price(BookSide::Bid, dec("3")).unwrap();
        // 1 @ 100 + 2 @ 99
        assert_eq!(fill.avg_price, dec("298") / dec("3"));
        assert_eq!(fill.last_price, dec("99"));
    }

    #[test]
    fn avg_price_runs_out() {
        let fill = sample_book().avg_price(BookSide::Bid, dec("100")).unwrap();
        assert_eq!(fill.filled, dec("6"));
        assert_eq!(fill.last_price, dec("98"));
    }

    #[test]
    fn avg_price_none_cases() {
        assert!(sample_book().avg_price(BookSide::Bid, Decimal::ZERO).is_none());
        assert!(OrderBook::new("X", 5).avg_price(BookSide::Bid, dec("1")).is_none());
    }

    #[test]
    fn store_uses_symbol_limit_on_snapshot() {
        let store = OrderBookStore::default();
        store.set_limit("BTC/USDT", 2);
        let book = store
            .apply(&update(
                BookAction::Snapshot,
                vec![lv("100", "1"), lv("99", "1"), lv("98", "1")],
                vec![],
            ))
            .unwrap();
        assert_eq!(book.depth(), 2);
        assert_eq!(book.len(BookSide::Bid), 2);
    }

    #[test]
    fn store_depth_follows_snapshot_size_without_limit() {
        let store = OrderBookStore::default();
        let book = store
            .apply(&update(
                BookAction::Snapshot,
                vec![lv("100", "1"), lv("99", "1")],
                vec![lv("101", "1")],
            ))
            .unwrap();
        assert_eq!(book.depth(), 2);

        let book = store
            .apply(&update(BookAction::Diff, vec![lv("98", "1")], vec![]))
            .unwrap();
        // 98 falls outside the retained window
        assert_eq!(book.levels(BookSide::Bid), vec![lv("100", "1"), lv("99", "1")]);
    }

    #[test]
    fn store_query_and_remove() {
        let store = OrderBookStore::default();
        store
            .apply(&update(BookAction::Diff, vec![lv("100", "1")], vec![]))
            .unwrap();

        let best = store.with_book("BTC/USDT", OrderBook::best_bid).flatten();
        assert_eq!(best, Some(lv("100", "1")));
        assert_eq!(store.symbols(), vec!["BTC/USDT".to_string()]);

        assert!(store.remove("BTC/USDT").is_some());
        assert!(store.snapshot("BTC/USDT").is_none());
    }

    #[test]
    fn store_rejects_invalid_without_creating_book() {
        let store = OrderBookStore::default();
        let result = store.apply(&update(BookAction::Snapshot, vec![lv("0", "1")], vec![]));
        assert!(result.is_err());
        assert!(store.symbols().is_empty());
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn arb_level() -> impl Strategy<Value = PriceLevel> {
        // Sizes of zero show up often enough to exercise removals.
        (1i64..50i64, prop_oneof![Just(0i64), 1i64..1000i64]).prop_map(|(price, size)| {
            PriceLevel::new(Decimal::new(price, 0), Decimal::new(size, 2))
        })
    }

    fn arb_update() -> impl Strategy<Value = (bool, Vec<PriceLevel>)> {
        (any::<bool>(), proptest::collection::vec(arb_level(), 0..10))
    }

    proptest! {
        #[test]
        fn levels_match_last_update(updates in proptest::collection::vec(arb_update(), 1..30)) {
            let mut book = OrderBook::new("BTC/USDT", 1000);
            let mut expected: HashMap<Decimal, Decimal> = HashMap::new();

            for (is_snapshot, bids) in updates {
                let action = if is_snapshot { BookAction::Snapshot } else { BookAction::Diff };
                if is_snapshot {
                    expected.clear();
                }
                for level in &bids {
                    if level.size.is_zero() {
                        expected.remove(&level.price);
                    } else {
                        expected.insert(level.price, level.size);
                    }
                }
                book.apply(&BookUpdate {
                    symbol: "BTC/USDT".to_string(),
                    action,
                    bids,
                    asks: vec![],
                    timestamp: None,
                    nonce: None,
                }).unwrap();
            }

            prop_assert_eq!(book.len(BookSide::Bid), expected.len());
            for price in 1i64..50i64 {
                let price = Decimal::new(price, 0);
                prop_assert_eq!(book.level(BookSide::Bid, price), expected.get(&price).copied());
            }
        }

        #[test]
        fn avg_price_uses_minimal_prefix(
            sizes in proptest::collection::vec(1i64..100i64, 1..20),
            want in 1i64..500i64,
        ) {
            let mut book = OrderBook::new("BTC/USDT", 100);
            let asks: Vec<_> = sizes
                .iter()
                .enumerate()
                .map(|(i, s)| PriceLevel::new(Decimal::from(100 + i), Decimal::from(*s)))
                .collect();
            book.apply(&BookUpdate {
                symbol: "BTC/USDT".to_string(),
                action: BookAction::Snapshot,
                bids: vec![],
                asks: asks.clone(),
                timestamp: None,
                nonce: None,
            }).unwrap();

            let want = Decimal::from(want);
            let fill = book.avg_price(BookSide::Ask, want).unwrap();

            let mut cumulative = Decimal::ZERO;
            let mut prefix_end = asks.len() - 1;
            for (i, level) in asks.iter().enumerate() {
                cumulative += level.size;
                if cumulative >= want {
                    prefix_end = i;
                    break;
                }
            }
            prop_assert_eq!(fill.last_price, asks[prefix_end].price);
            prop_assert!(fill.avg_price >= asks[0].price);
            prop_assert!(fill.avg_price <= fill.last_price);
            prop_assert_eq!(fill.filled, want.min(sizes.iter().copied().map(Decimal::from).sum()));
        }
    }
}
