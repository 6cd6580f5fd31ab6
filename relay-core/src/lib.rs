//! Core types for the order-book relay
//!
//! This crate defines the shared data structures used across the relay:
//! book keys and depth tiers, the upstream feed wire format, and the
//! downstream client protocol.

pub mod book;
pub mod error;
pub mod upstream;
pub mod websocket;

pub use book::{BookKey, BookStatus, BookView, Depth, WireLevel, SUPPORTED_DEPTHS, TOPIC_NAMESPACE};
pub use error::{RelayError, RelayResult};
pub use upstream::{
    retag_as_snapshot, BookData, BookMessage, BookMessageType, ControlMessage, UpstreamFrame,
    UpstreamOp, UpstreamRequest, RESTART_UPDATE_ID,
};
pub use websocket::{ClientMessage, ErrorCode, ServerMessage};
