//! Order-book reconstruction
//!
//! Turns the upstream snapshot/delta stream into a sorted, depth-trimmed book
//! per `(symbol, depth)`. Each book is a small state machine:
//!
//! ```text
//! Uninitialized --snapshot--> Synced --disconnect/reset--> Uninitialized
//! ```
//!
//! Deltas are only accepted in `Synced`. A message carrying the restart
//! sentinel update id replaces the book wholesale whatever its type.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{debug, info};

use relay_core::{BookKey, BookMessage, BookMessageType, BookStatus, BookView, WireLevel};

/// Reasons a message was not applied
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconstructError {
    #[error("{0} has no snapshot yet")]
    NotSynced(BookKey),

    #[error("stale update {update_id} for {key} (book is at {current})")]
    Stale {
        key: BookKey,
        update_id: u64,
        current: u64,
    },

    #[error("malformed level in {key}: {reason}")]
    Malformed { key: BookKey, reason: String },
}

/// What applying a message did to the book
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Ordinary snapshot replaced the book
    Snapshot,
    /// Restart sentinel (snapshot or delta) replaced the book
    Restart,
    /// Delta patched the book; `gap` is set when update ids were skipped
    Delta { gap: bool },
}

#[derive(Debug, Clone, PartialEq)]
struct Level {
    /// Original representation, used as the identity of the level
    price: String,
    /// Parsed price, used only for ordering
    price_value: f64,
    size: Decimal,
}

/// Orders levels numerically; distinct spellings of one price stay distinct
#[derive(Debug, Clone)]
struct PriceKey {
    value: f64,
    price: String,
}

impl PartialEq for PriceKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PriceKey {}

impl PartialOrd for PriceKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PriceKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.value
            .total_cmp(&other.value)
            .then_with(|| self.price.cmp(&other.price))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Bid,
    Ask,
}

/// One side of a book, ascending by price
#[derive(Debug, Clone)]
struct BookSide {
    side: Side,
    levels: BTreeMap<PriceKey, Decimal>,
}

impl BookSide {
    fn new(side: Side) -> Self {
        Self {
            side,
            levels: BTreeMap::new(),
        }
    }

    fn replace(&mut self, levels: Vec<Level>, depth: usize) {
        self.levels.clear();
        // Later duplicates win, same as applying them in order
        self.upsert_all(levels);
        self.trim(depth);
    }

    fn apply(&mut self, updates: Vec<Level>, depth: usize) {
        if updates.is_empty() {
            return;
        }
        self.upsert_all(updates);
        self.trim(depth);
    }

    fn upsert_all(&mut self, updates: Vec<Level>) {
        for update in updates {
            let key = PriceKey {
                value: update.price_value,
                price: update.price,
            };
            if update.size.is_zero() {
                self.levels.remove(&key);
            } else {
                self.levels.insert(key, update.size);
            }
        }
    }

    /// Drop levels furthest from the best price until `depth` remain
    fn trim(&mut self, depth: usize) {
        while self.levels.len() > depth {
            match self.side {
                Side::Bid => self.levels.pop_first(),
                Side::Ask => self.levels.pop_last(),
            };
        }
    }

    fn clear(&mut self) {
        self.levels.clear();
    }

    /// Levels from best to worst
    fn iter(&self) -> Box<dyn Iterator<Item = (&PriceKey, &Decimal)> + '_> {
        match self.side {
            Side::Bid => Box::new(self.levels.iter().rev()),
            Side::Ask => Box::new(self.levels.iter()),
        }
    }

    fn best(&self) -> Option<(&str, Decimal)> {
        self.iter().next().map(|(k, size)| (k.price.as_str(), *size))
    }

    fn to_wire(&self) -> Vec<WireLevel> {
        self.iter()
            .map(|(k, size)| WireLevel::new(k.price.clone(), size.to_string()))
            .collect()
    }
}

/// Reconstructed state of one `(symbol, depth)` book
#[derive(Debug, Clone)]
pub struct OrderBookState {
    key: BookKey,
    status: BookStatus,
    bids: BookSide,
    asks: BookSide,
    update_id: u64,
    sequence: u64,
    last_update_ts: Option<i64>,
}

impl OrderBookState {
    pub fn new(key: BookKey) -> Self {
        Self {
            key,
            status: BookStatus::Uninitialized,
            bids: BookSide::new(Side::Bid),
            asks: BookSide::new(Side::Ask),
            update_id: 0,
            sequence: 0,
            last_update_ts: None,
        }
    }

    pub fn key(&self) -> &BookKey {
        &self.key
    }

    pub fn status(&self) -> BookStatus {
        self.status
    }

    pub fn update_id(&self) -> u64 {
        self.update_id
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn last_update_ts(&self) -> Option<i64> {
        self.last_update_ts
    }

    /// Highest bid as `(price, size)`
    pub fn best_bid(&self) -> Option<(&str, Decimal)> {
        self.bids.best()
    }

    /// Lowest ask as `(price, size)`
    pub fn best_ask(&self) -> Option<(&str, Decimal)> {
        self.asks.best()
    }

    pub fn view(&self) -> BookView {
        BookView {
            symbol: self.key.symbol.clone(),
            depth: self.key.depth,
            status: self.status,
            update_id: self.update_id,
            sequence: self.sequence,
            timestamp: self.last_update_ts,
            bids: self.bids.to_wire(),
            asks: self.asks.to_wire(),
        }
    }

    fn replace(&mut self, bids: Vec<Level>, asks: Vec<Level>, message: &BookMessage) {
        let depth = self.key.depth.levels();
        self.bids.replace(bids, depth);
        self.asks.replace(asks, depth);
        self.status = BookStatus::Synced;
        self.stamp(message);
    }

    fn patch(&mut self, bids: Vec<Level>, asks: Vec<Level>, message: &BookMessage) {
        let depth = self.key.depth.levels();
        self.bids.apply(bids, depth);
        self.asks.apply(asks, depth);
        self.stamp(message);
    }

    fn stamp(&mut self, message: &BookMessage) {
        self.update_id = message.data.update_id;
        self.sequence = message.data.seq;
        if let Some(ts) = message.timestamp() {
            self.last_update_ts = Some(ts);
        }
    }

    fn reset(&mut self) {
        self.status = BookStatus::Uninitialized;
        self.bids.clear();
        self.asks.clear();
        self.update_id = 0;
        self.sequence = 0;
    }
}

/// Owner of every reconstructed book
#[derive(Debug, Default)]
pub struct Reconstructor {
    books: HashMap<BookKey, OrderBookState>,
}

impl Reconstructor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a book that is waiting for its first snapshot
    pub fn track(&mut self, key: BookKey) {
        self.books
            .entry(key.clone())
            .or_insert_with(|| OrderBookState::new(key));
    }

    /// Apply a snapshot or delta in arrival order
    pub fn apply(
        &mut self,
        key: &BookKey,
        message: &BookMessage,
    ) -> Result<ApplyOutcome, ReconstructError> {
        match message.message_type {
            BookMessageType::Snapshot => self.apply_snapshot(key, message),
            BookMessageType::Delta => self.apply_delta(key, message),
        }
    }

    /// Replace the book wholesale
    pub fn apply_snapshot(
        &mut self,
        key: &BookKey,
        message: &BookMessage,
    ) -> Result<ApplyOutcome, ReconstructError> {
        let bids = parse_levels(key, &message.data.bids)?;
        let asks = parse_levels(key, &message.data.asks)?;

        let book = self
            .books
            .entry(key.clone())
            .or_insert_with(|| OrderBookState::new(key.clone()));
        book.replace(bids, asks, message);

        if message.is_restart() {
            info!("[Reconstructor] Restart sentinel on {}, book replaced", key);
            Ok(ApplyOutcome::Restart)
        } else {
            debug!(
                "[Reconstructor] Snapshot {} applied to {}",
                message.data.update_id, key
            );
            Ok(ApplyOutcome::Snapshot)
        }
    }

    /// Upsert/delete levels on a synced book
    pub fn apply_delta(
        &mut self,
        key: &BookKey,
        message: &BookMessage,
    ) -> Result<ApplyOutcome, ReconstructError> {
        // After a restart the old levels are invalid; take the delta as the whole book
        if message.is_restart() {
            return self.apply_snapshot(key, message);
        }

        let book = match self.books.get_mut(key) {
            Some(book) if book.status == BookStatus::Synced => book,
            _ => return Err(ReconstructError::NotSynced(key.clone())),
        };

        let update_id = message.data.update_id;
        if update_id <= book.update_id {
            return Err(ReconstructError::Stale {
                key: key.clone(),
                update_id,
                current: book.update_id,
            });
        }

        let bids = parse_levels(key, &message.data.bids)?;
        let asks = parse_levels(key, &message.data.asks)?;
        let gap = update_id > book.update_id + 1;

        book.patch(bids, asks, message);
        Ok(ApplyOutcome::Delta { gap })
    }

    /// Read-only access to one book
    pub fn book(&self, key: &BookKey) -> Option<&OrderBookState> {
        self.books.get(key)
    }

    pub fn view(&self, key: &BookKey) -> Option<BookView> {
        self.books.get(key).map(OrderBookState::view)
    }

    /// Drop a book back to `Uninitialized`
    pub fn reset(&mut self, key: &BookKey) {
        if let Some(book) = self.books.get_mut(key) {
            book.reset();
        }
    }

    /// Reset every book, returning how many were synced
    pub fn reset_all(&mut self) -> usize {
        let mut synced = 0;
        for book in self.books.values_mut() {
            if book.status == BookStatus::Synced {
                synced += 1;
            }
            book.reset();
        }
        synced
    }

    /// Stop tracking a book
    pub fn remove(&mut self, key: &BookKey) -> bool {
        self.books.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.books.len()
    }

    pub fn is_empty(&self) -> bool {
        self.books.is_empty()
    }

    pub fn synced_count(&self) -> usize {
        self.books
            .values()
            .filter(|b| b.status == BookStatus::Synced)
            .count()
    }
}

fn parse_levels(key: &BookKey, levels: &[WireLevel]) -> Result<Vec<Level>, ReconstructError> {
    levels.iter().map(|level| parse_level(key, level)).collect()
}

fn parse_level(key: &BookKey, level: &WireLevel) -> Result<Level, ReconstructError> {
    let malformed = |reason: String| ReconstructError::Malformed {
        key: key.clone(),
        reason,
    };

    let price_value = level
        .price()
        .parse::<f64>()
        .ok()
        .filter(|p| p.is_finite())
        .ok_or_else(|| malformed(format!("price {:?}", level.price())))?;

    let size = Decimal::from_str(level.size())
        .or_else(|_| Decimal::from_scientific(level.size()))
        .map_err(|_| malformed(format!("size {:?}", level.size())))?;

    if size < Decimal::ZERO {
        return Err(malformed(format!("negative size {:?}", level.size())));
    }

    Ok(Level {
        price: level.price().to_string(),
        price_value,
        size,
    })
}
