//! WebSocket infrastructure for browser clients
//!
//! This module provides the per-connection handler and the subscription
//! bookkeeping used by the relay loop.

mod handler;
mod subscription;

pub use handler::{WebSocketState, DEFAULT_CLIENT_QUEUE_CAPACITY};
pub use subscription::{ClientId, ClientSender, SubscriptionManager};
