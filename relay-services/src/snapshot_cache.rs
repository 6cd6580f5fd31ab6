//! Last snapshot per book, replayed to clients that subscribe late

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use relay_core::BookKey;

/// A snapshot frame exactly as it will be sent to a client
#[derive(Debug, Clone)]
pub struct CachedSnapshot {
    pub text: Arc<str>,
    pub update_id: u64,
    pub cached_at: DateTime<Utc>,
}

/// Most recent snapshot text keyed by `(symbol, depth)`
#[derive(Debug, Default)]
pub struct SnapshotCache {
    entries: HashMap<BookKey, CachedSnapshot>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the entry for `key`
    pub fn store(&mut self, key: BookKey, text: Arc<str>, update_id: u64) {
        self.entries.insert(
            key,
            CachedSnapshot {
                text,
                update_id,
                cached_at: Utc::now(),
            },
        );
    }

    pub fn get(&self, key: &BookKey) -> Option<&CachedSnapshot> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &BookKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
