//! Upstream order-book feed integration
//!
//! Maintains one WebSocket connection to the exchange feed, tracks the active
//! `(symbol, depth)` subscriptions and forwards book messages to the relay.

pub mod backoff;
pub mod websocket;

pub use backoff::{Backoff, BackoffConfig};
pub use websocket::{BookFeed, UpstreamConfig, UpstreamConnector, UpstreamUpdate, DEFAULT_UPSTREAM_URL};
