//! Relay health metrics
//!
//! Counters are atomics so HTTP handlers can read them without going through
//! the relay event loop.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Upstream silence after which the connection is reported stale
pub const STALE_THRESHOLD_SECS: u64 = 60;

/// Default period of the health log line
pub const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(60);

fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Health metrics for the upstream connection and reconstructed books
#[derive(Debug, Default)]
pub struct RelayMetrics {
    connected: AtomicBool,
    last_message_epoch_ms: AtomicU64,
    message_count: AtomicU64,
    gap_count: AtomicU64,
    restart_count: AtomicU64,
    rejected_count: AtomicU64,
    disconnect_count: AtomicU64,
    active_books: AtomicUsize,
    synced_books: AtomicUsize,
    connected_clients: AtomicUsize,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_connected(&self, connected: bool) {
        let was = self.connected.swap(connected, Ordering::SeqCst);
        if was && !connected {
            self.disconnect_count.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn record_message(&self) {
        self.last_message_epoch_ms
            .store(now_epoch_ms(), Ordering::SeqCst);
        self.message_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_gap(&self) {
        self.gap_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_restart(&self) {
        self.restart_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_rejected(&self) {
        self.rejected_count.fetch_add(1, Ordering::SeqCst);
    }

    /// `active` counts every followed book, `synced` only those holding a snapshot
    pub fn set_books(&self, active: usize, synced: usize) {
        self.active_books.store(active, Ordering::SeqCst);
        self.synced_books.store(synced, Ordering::SeqCst);
    }

    pub fn set_connected_clients(&self, count: usize) {
        self.connected_clients.store(count, Ordering::SeqCst);
    }

    pub fn get_health(&self) -> RelayHealth {
        let connected = self.connected.load(Ordering::SeqCst);
        let last_ms = self.last_message_epoch_ms.load(Ordering::SeqCst);
        let active_books = self.active_books.load(Ordering::SeqCst);

        let last_message_time = if last_ms > 0 {
            DateTime::from_timestamp(
                (last_ms / 1000) as i64,
                ((last_ms % 1000) * 1_000_000) as u32,
            )
        } else {
            None
        };

        let is_stale = if connected && last_ms > 0 {
            now_epoch_ms().saturating_sub(last_ms) > STALE_THRESHOLD_SECS * 1000
        } else {
            !connected
        };

        RelayHealth {
            connected,
            last_message_time,
            message_count: self.message_count.load(Ordering::SeqCst),
            gap_count: self.gap_count.load(Ordering::SeqCst),
            restart_count: self.restart_count.load(Ordering::SeqCst),
            rejected_count: self.rejected_count.load(Ordering::SeqCst),
            disconnect_count: self.disconnect_count.load(Ordering::SeqCst),
            active_books,
            synced_books: self.synced_books.load(Ordering::SeqCst),
            connected_clients: self.connected_clients.load(Ordering::SeqCst),
            is_stale,
            // With nothing subscribed the connector is idle by choice
            healthy: active_books == 0 || !is_stale,
        }
    }
}

/// Point-in-time health report
#[derive(Debug, Clone, Serialize)]
pub struct RelayHealth {
    pub connected: bool,
    pub last_message_time: Option<DateTime<Utc>>,
    pub message_count: u64,
    pub gap_count: u64,
    pub restart_count: u64,
    pub rejected_count: u64,
    pub disconnect_count: u64,
    pub active_books: usize,
    pub synced_books: usize,
    pub connected_clients: usize,
    pub is_stale: bool,
    pub healthy: bool,
}

/// Log a health line every `period`
pub fn spawn_health_logger(metrics: Arc<RelayMetrics>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        // First tick fires immediately
        interval.tick().await;

        loop {
            interval.tick().await;
            let health = metrics.get_health();
            if health.healthy {
                info!(
                    "[Health] upstream connected={} msgs={} gaps={} restarts={} books={}/{} synced clients={}",
                    health.connected,
                    health.message_count,
                    health.gap_count,
                    health.restart_count,
                    health.synced_books,
                    health.active_books,
                    health.connected_clients
                );
            } else {
                warn!(
                    "[Health] upstream stale (connected={}, last message {:?}), {} book(s) waiting",
                    health.connected, health.last_message_time, health.active_books
                );
            }
        }
    })
}
