//! Downstream WebSocket protocol
//!
//! These types define the messages exchanged between the relay and its
//! browser clients. Book data itself is forwarded as the upstream text and has
//! no type here.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::book::Depth;
use crate::error::{RelayError, RelayResult};

// ============================================================================
// Client -> Server Messages
// ============================================================================

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Subscribe to order books for a set of symbols at one depth
    Subscribe {
        symbols: Vec<String>,
        /// Validated at the edge, see [`Depth::new`]
        depth: u32,
    },
    /// Unsubscribe from order books
    Unsubscribe { symbols: Vec<String>, depth: u32 },
    /// Ping to keep connection alive
    Ping {
        #[serde(default)]
        timestamp: Option<i64>,
    },
}

impl ClientMessage {
    pub fn parse(text: &str) -> RelayResult<Self> {
        serde_json::from_str(text).map_err(|e| RelayError::parse(format!("Invalid JSON: {}", e)))
    }
}

// ============================================================================
// Server -> Client Messages
// ============================================================================

/// Control messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Subscription confirmed
    Subscribed { symbols: Vec<String>, depth: Depth },
    /// Unsubscription confirmed
    Unsubscribed { symbols: Vec<String>, depth: Depth },
    /// Error message
    Error { code: ErrorCode, message: String },
    /// Pong response to client ping
    Pong {
        /// Echo back client timestamp
        #[serde(skip_serializing_if = "Option::is_none")]
        client_timestamp: Option<i64>,
        server_timestamp: i64,
    },
}

impl ServerMessage {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code,
            message: message.into(),
        }
    }

    /// Serialize into the shared text form queued to clients
    pub fn to_text(&self) -> RelayResult<Arc<str>> {
        Ok(Arc::from(serde_json::to_string(self)?))
    }
}

/// Error codes for WebSocket errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Invalid message format
    InvalidMessage,
    /// Depth outside the supported tiers
    InvalidDepth,
    /// Empty or malformed symbol
    InvalidSymbol,
    /// Internal server error
    InternalError,
}

impl From<&RelayError> for ErrorCode {
    fn from(err: &RelayError) -> Self {
        match err {
            RelayError::Parse(_) => ErrorCode::InvalidMessage,
            RelayError::InvalidDepth(_) => ErrorCode::InvalidDepth,
            RelayError::InvalidSymbol(_) => ErrorCode::InvalidSymbol,
            _ => ErrorCode::InternalError,
        }
    }
}
