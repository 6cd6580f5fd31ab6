//! Error types for the relay

use thiserror::Error;

/// Relay-wide error type
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unsupported depth {0} (expected one of 1, 50, 200, 500, 1000)")]
    InvalidDepth(u32),

    #[error("Invalid symbol: {0:?}")]
    InvalidSymbol(String),

    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl RelayError {
    pub fn parse(msg: impl Into<String>) -> Self {
        RelayError::Parse(msg.into())
    }

    pub fn network(msg: impl Into<String>) -> Self {
        RelayError::Network(msg.into())
    }

    pub fn channel_closed(msg: impl Into<String>) -> Self {
        RelayError::ChannelClosed(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        RelayError::Config(msg.into())
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Parse(err.to_string())
    }
}

/// Result type alias for relay operations
pub type RelayResult<T> = Result<T, RelayError>;
