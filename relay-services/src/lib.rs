//! Relay services for the order-book relay
//!
//! This crate reconstructs books from the upstream feed, caches their
//! snapshots, and fans frames out to subscribed WebSocket clients.

pub mod health;
pub mod reconstructor;
pub mod relay;
pub mod snapshot_cache;
pub mod websocket;

pub use health::{spawn_health_logger, RelayHealth, RelayMetrics, HEALTH_LOG_INTERVAL};
pub use reconstructor::{ApplyOutcome, OrderBookState, ReconstructError, Reconstructor};
pub use relay::{BookRelay, RelayEvent, RelayHandle};
pub use snapshot_cache::{CachedSnapshot, SnapshotCache};
pub use websocket::{
    ClientId, ClientSender, SubscriptionManager, WebSocketState, DEFAULT_CLIENT_QUEUE_CAPACITY,
};
