//! Server configuration from environment variables

use std::env;
use std::time::Duration;

use relay_core::{RelayError, RelayResult};
use relay_services::DEFAULT_CLIENT_QUEUE_CAPACITY;
use relay_upstream::{BackoffConfig, UpstreamConfig};
use url::Url;

/// Default HTTP/WebSocket listen port
pub const DEFAULT_SERVER_PORT: u16 = 3001;

/// Runtime configuration of the relay binary
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub server_port: u16,
    pub upstream: UpstreamConfig,
    /// Capacity of each client's outgoing queue
    pub client_queue_capacity: usize,
}

impl RelayConfig {
    /// Load configuration from the process environment
    ///
    /// Recognized variables:
    /// - UPSTREAM_WS_URL
    /// - SERVER_PORT
    /// - HEARTBEAT_INTERVAL_SECS, STALE_TIMEOUT_SECS
    /// - RECONNECT_BASE_MS, RECONNECT_MAX_MS, RECONNECT_JITTER
    /// - CLIENT_QUEUE_CAPACITY
    pub fn from_env() -> RelayResult<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> RelayResult<Self> {
        let defaults = UpstreamConfig::default();
        let backoff_defaults = BackoffConfig::default();

        let url = match lookup("UPSTREAM_WS_URL") {
            Some(raw) => validate_ws_url(raw.trim())?,
            None => defaults.url,
        };

        let heartbeat_interval = match parse_var::<u64>(&lookup, "HEARTBEAT_INTERVAL_SECS")? {
            Some(secs) => Duration::from_secs(positive("HEARTBEAT_INTERVAL_SECS", secs)?),
            None => defaults.heartbeat_interval,
        };
        let stale_timeout = match parse_var::<u64>(&lookup, "STALE_TIMEOUT_SECS")? {
            Some(secs) => Duration::from_secs(positive("STALE_TIMEOUT_SECS", secs)?),
            None => defaults.stale_timeout,
        };

        let base = match parse_var::<u64>(&lookup, "RECONNECT_BASE_MS")? {
            Some(ms) => Duration::from_millis(positive("RECONNECT_BASE_MS", ms)?),
            None => backoff_defaults.base,
        };
        let max = match parse_var::<u64>(&lookup, "RECONNECT_MAX_MS")? {
            Some(ms) => Duration::from_millis(ms),
            None => backoff_defaults.max,
        };
        if max < base {
            return Err(RelayError::config(format!(
                "RECONNECT_MAX_MS ({}ms) is below RECONNECT_BASE_MS ({}ms)",
                max.as_millis(),
                base.as_millis()
            )));
        }

        let jitter = parse_var::<f64>(&lookup, "RECONNECT_JITTER")?
            .unwrap_or(backoff_defaults.jitter);
        if !(0.0..=1.0).contains(&jitter) {
            return Err(RelayError::config(format!(
                "RECONNECT_JITTER must be within [0, 1], got {}",
                jitter
            )));
        }

        let client_queue_capacity = match parse_var::<usize>(&lookup, "CLIENT_QUEUE_CAPACITY")? {
            Some(capacity) => positive("CLIENT_QUEUE_CAPACITY", capacity)?,
            None => DEFAULT_CLIENT_QUEUE_CAPACITY,
        };

        Ok(Self {
            server_port: parse_var(&lookup, "SERVER_PORT")?.unwrap_or(DEFAULT_SERVER_PORT),
            upstream: UpstreamConfig {
                url,
                heartbeat_interval,
                stale_timeout,
                backoff: BackoffConfig {
                    base,
                    max,
                    jitter,
                    ..backoff_defaults
                },
                ..defaults
            },
            client_queue_capacity,
        })
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> RelayResult<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| RelayError::config(format!("{} = {:?}: {}", name, raw, e))),
        None => Ok(None),
    }
}

fn positive<T: PartialOrd + Default + std::fmt::Display>(name: &str, value: T) -> RelayResult<T> {
    if value > T::default() {
        Ok(value)
    } else {
        Err(RelayError::config(format!("{} must be positive, got {}", name, value)))
    }
}

fn validate_ws_url(raw: &str) -> RelayResult<String> {
    let url = Url::parse(raw)
        .map_err(|e| RelayError::config(format!("UPSTREAM_WS_URL = {:?}: {}", raw, e)))?;

    match url.scheme() {
        "ws" | "wss" => Ok(raw.to_string()),
        scheme => Err(RelayError::config(format!(
            "UPSTREAM_WS_URL must use ws or wss, got {}",
            scheme
        ))),
    }
}
