//! Order-book keys and views
//!
//! A book is identified by `(symbol, depth)`. The same key names the upstream
//! channel (`orderbook.<depth>.<symbol>`), the reconstructed book, and the
//! cached snapshot served to new clients.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{RelayError, RelayResult};

/// Namespace prefix of order-book channels on the upstream feed
pub const TOPIC_NAMESPACE: &str = "orderbook";

/// Depth tiers offered by the upstream feed
pub const SUPPORTED_DEPTHS: [u32; 5] = [1, 50, 200, 500, 1000];

/// Number of raw price levels per side for a subscription tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct Depth(u32);

impl Depth {
    /// Validate a depth against the supported tiers
    pub fn new(levels: u32) -> RelayResult<Self> {
        if SUPPORTED_DEPTHS.contains(&levels) {
            Ok(Self(levels))
        } else {
            Err(RelayError::InvalidDepth(levels))
        }
    }

    pub fn get(self) -> u32 {
        self.0
    }

    /// Maximum number of levels kept per side
    pub fn levels(self) -> usize {
        self.0 as usize
    }
}

impl TryFrom<u32> for Depth {
    type Error = RelayError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Depth::new(value)
    }
}

impl From<Depth> for u32 {
    fn from(depth: Depth) -> Self {
        depth.0
    }
}

impl fmt::Display for Depth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique key for an order book: `(symbol, depth)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct BookKey {
    pub symbol: String,
    pub depth: Depth,
}

impl BookKey {
    /// Build a key, normalizing the symbol to upper case
    pub fn new(symbol: &str, depth: Depth) -> RelayResult<Self> {
        Ok(Self {
            symbol: normalize_symbol(symbol)?,
            depth,
        })
    }

    /// Build one key per distinct symbol, keeping request order
    pub fn for_symbols(symbols: &[String], depth: Depth) -> RelayResult<Vec<Self>> {
        let mut keys: Vec<Self> = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            let key = Self::new(symbol, depth)?;
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    /// Upstream channel name, e.g. `orderbook.50.BTCUSDT`
    pub fn topic(&self) -> String {
        format!("{}.{}.{}", TOPIC_NAMESPACE, self.depth, self.symbol)
    }

    /// Parse an upstream channel name back into a key
    pub fn from_topic(topic: &str) -> RelayResult<Self> {
        let mut parts = topic.splitn(3, '.');
        let (Some(namespace), Some(depth), Some(symbol)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(RelayError::InvalidTopic(topic.to_string()));
        };

        if namespace != TOPIC_NAMESPACE {
            return Err(RelayError::InvalidTopic(topic.to_string()));
        }

        let depth = depth
            .parse::<u32>()
            .map_err(|_| RelayError::InvalidTopic(topic.to_string()))?;

        Self::new(symbol, Depth::new(depth)?)
    }
}

impl fmt::Display for BookKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", TOPIC_NAMESPACE, self.depth, self.symbol)
    }
}

fn normalize_symbol(symbol: &str) -> RelayResult<String> {
    let trimmed = symbol.trim();
    let valid = !trimmed.is_empty()
        && trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

    if valid {
        Ok(trimmed.to_ascii_uppercase())
    } else {
        Err(RelayError::InvalidSymbol(symbol.to_string()))
    }
}

/// A price level as it appears on the wire: `[price, size]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireLevel(pub String, pub String);

impl WireLevel {
    pub fn new(price: impl Into<String>, size: impl Into<String>) -> Self {
        Self(price.into(), size.into())
    }

    pub fn price(&self) -> &str {
        &self.0
    }

    pub fn size(&self) -> &str {
        &self.1
    }
}

/// Synchronization state of a reconstructed book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookStatus {
    /// No snapshot applied yet (or reset after a disconnect)
    Uninitialized,
    /// A snapshot has been applied and deltas are accepted
    Synced,
}

/// Read-only view of a reconstructed book
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BookView {
    pub symbol: String,
    pub depth: Depth,
    pub status: BookStatus,
    pub update_id: u64,
    pub sequence: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    /// Best bid first
    pub bids: Vec<WireLevel>,
    /// Best ask first
    pub asks: Vec<WireLevel>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_validation() {
        assert_eq!(Depth::new(50).unwrap().levels(), 50);
        assert!(matches!(Depth::new(25), Err(RelayError::InvalidDepth(25))));

        let depth: Depth = serde_json::from_str("200").unwrap();
        assert_eq!(depth.get(), 200);
        assert!(serde_json::from_str::<Depth>("7").is_err());
    }

    #[test]
    fn test_topic_round_trip() {
        let key = BookKey::new("btcusdt", Depth::new(50).unwrap()).unwrap();
        assert_eq!(key.symbol, "BTCUSDT");
        assert_eq!(key.topic(), "orderbook.50.BTCUSDT");
        assert_eq!(BookKey::from_topic("orderbook.50.BTCUSDT").unwrap(), key);
    }

    #[test]
    fn test_option_symbols_keep_dashes() {
        let key = BookKey::from_topic("orderbook.500.BTC-27DEC24-100000-C").unwrap();
        assert_eq!(key.symbol, "BTC-27DEC24-100000-C");
        assert_eq!(key.depth.get(), 500);
    }

    #[test]
    fn test_invalid_topics() {
        assert!(BookKey::from_topic("tickers.BTCUSDT").is_err());
        assert!(BookKey::from_topic("orderbook.50").is_err());
        assert!(BookKey::from_topic("orderbook.abc.BTCUSDT").is_err());
        assert!(matches!(
            BookKey::from_topic("orderbook.30.BTCUSDT"),
            Err(RelayError::InvalidDepth(30))
        ));
    }

    #[test]
    fn test_for_symbols_dedups() {
        let depth = Depth::new(1).unwrap();
        let symbols = vec!["ethusdt".to_string(), "BTCUSDT".to_string(), "ETHUSDT".to_string()];
        let keys = BookKey::for_symbols(&symbols, depth).unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].symbol, "ETHUSDT");
        assert_eq!(keys[1].symbol, "BTCUSDT");

        assert!(BookKey::for_symbols(&["".to_string()], depth).is_err());
        assert!(BookKey::for_symbols(&["BTC USDT".to_string()], depth).is_err());
    }

    #[test]
    fn test_wire_level_is_a_pair() {
        let level: WireLevel = serde_json::from_str(r#"["100.5","2"]"#).unwrap();
        assert_eq!(level.price(), "100.5");
        assert_eq!(level.size(), "2");
        assert_eq!(serde_json::to_string(&level).unwrap(), r#"["100.5","2"]"#);
    }
}
