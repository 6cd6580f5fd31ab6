//! Upstream WebSocket connector
//!
//! Owns the single connection to the exchange feed. The active subscription
//! set outlives individual connections, so every reconnect re-subscribes to
//! everything that was active before the drop.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval_at, sleep, Instant};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, error, info, warn};

use relay_core::{
    BookKey, BookMessage, Depth, RelayError, RelayResult, UpstreamFrame, UpstreamOp,
    UpstreamRequest,
};

use crate::backoff::{Backoff, BackoffConfig};

/// Public linear-contract stream
pub const DEFAULT_UPSTREAM_URL: &str = "wss://stream.bybit.com/v5/public/linear";

/// Heartbeat interval expected by the upstream
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

/// Silence after which the connection is considered dead
const STALE_TIMEOUT: Duration = Duration::from_secs(30);

/// Upstream limit on channel args per request
const MAX_ARGS_PER_REQUEST: usize = 10;

// ============================================================================
// Updates (sent to the relay)
// ============================================================================

/// Update emitted by the connector
#[derive(Debug, Clone)]
pub enum UpstreamUpdate {
    /// Order-book message, parsed alongside its original text
    Book { message: BookMessage, raw: Arc<str> },
    /// Connection state change
    ConnectionState {
        connected: bool,
        error: Option<String>,
    },
}

/// Subscription surface of a book feed
#[async_trait]
pub trait BookFeed: Send + Sync {
    /// Subscribe to keys, returning the ones that were not active yet
    async fn subscribe_keys(&self, keys: Vec<BookKey>) -> RelayResult<Vec<BookKey>>;

    /// Unsubscribe from keys, returning the ones that were active
    async fn unsubscribe_keys(&self, keys: Vec<BookKey>) -> RelayResult<Vec<BookKey>>;
}

// ============================================================================
// Connector
// ============================================================================

/// Configuration for [`UpstreamConnector`]
#[derive(Clone, Debug)]
pub struct UpstreamConfig {
    pub url: String,
    pub heartbeat_interval: Duration,
    pub stale_timeout: Duration,
    pub backoff: BackoffConfig,
    /// Capacity of the update channel to the relay
    pub update_buffer: usize,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_UPSTREAM_URL.to_string(),
            heartbeat_interval: HEARTBEAT_INTERVAL,
            stale_timeout: STALE_TIMEOUT,
            backoff: BackoffConfig::default(),
            update_buffer: 4096,
        }
    }
}

/// Commands sent to the connection task
#[derive(Debug)]
enum ConnectorCommand {
    Subscribe(Vec<BookKey>),
    Unsubscribe(Vec<BookKey>),
}

/// Why a connection session ended
#[derive(Debug)]
enum SessionEnd {
    Closed(String),
    Stale,
    Failed(RelayError),
    /// Connector or relay went away; stop reconnecting
    Shutdown,
}

/// Upstream feed connector
pub struct UpstreamConnector {
    config: UpstreamConfig,
    /// Handed to the connection task on start
    update_tx: Option<mpsc::Sender<UpstreamUpdate>>,
    /// Currently active book keys
    subscriptions: Arc<RwLock<HashSet<BookKey>>>,
    /// Command sender to the connection task
    command_tx: Option<mpsc::UnboundedSender<ConnectorCommand>>,
}

impl UpstreamConnector {
    /// Create a new connector and the receiver for its updates
    pub fn new(config: UpstreamConfig) -> (Self, mpsc::Receiver<UpstreamUpdate>) {
        let (update_tx, update_rx) = mpsc::channel(config.update_buffer.max(1));

        (
            Self {
                config,
                update_tx: Some(update_tx),
                subscriptions: Arc::new(RwLock::new(HashSet::new())),
                command_tx: None,
            },
            update_rx,
        )
    }

    /// Spawn the connection task
    /// Note: Connection is lazy - it only connects once a subscription exists
    pub fn start(&mut self) -> RelayResult<()> {
        let update_tx = self
            .update_tx
            .take()
            .ok_or_else(|| RelayError::config("upstream connector already started"))?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        self.command_tx = Some(command_tx);

        let config = self.config.clone();
        let subscriptions = Arc::clone(&self.subscriptions);

        tokio::spawn(async move {
            Self::connection_loop(config, update_tx, command_rx, subscriptions).await;
        });

        Ok(())
    }

    /// Subscribe to order books for `symbols` at `depth`
    pub async fn subscribe(&self, symbols: &[String], depth: Depth) -> RelayResult<Vec<BookKey>> {
        let keys = BookKey::for_symbols(symbols, depth)?;
        self.subscribe_keys(keys).await
    }

    /// Unsubscribe from order books for `symbols` at `depth`
    pub async fn unsubscribe(&self, symbols: &[String], depth: Depth) -> RelayResult<Vec<BookKey>> {
        let keys = BookKey::for_symbols(symbols, depth)?;
        self.unsubscribe_keys(keys).await
    }

    /// Snapshot of the active subscription set, sorted
    pub async fn active_subscriptions(&self) -> Vec<BookKey> {
        let subs = self.subscriptions.read().await;
        let mut keys: Vec<BookKey> = subs.iter().cloned().collect();
        keys.sort();
        keys
    }

    fn send_command(&self, command: ConnectorCommand) -> RelayResult<()> {
        match &self.command_tx {
            Some(tx) => tx
                .send(command)
                .map_err(|_| RelayError::channel_closed("upstream connection task")),
            // Not started yet; the active set is sent on first connect
            None => Ok(()),
        }
    }

    /// Main connection loop with reconnection logic
    async fn connection_loop(
        config: UpstreamConfig,
        update_tx: mpsc::Sender<UpstreamUpdate>,
        mut command_rx: mpsc::UnboundedReceiver<ConnectorCommand>,
        subscriptions: Arc<RwLock<HashSet<BookKey>>>,
    ) {
        let has_subscriptions = !subscriptions.read().await.is_empty();
        if !has_subscriptions {
            info!("[Upstream] Waiting for subscriptions before connecting...");
            loop {
                match command_rx.recv().await {
                    Some(ConnectorCommand::Subscribe(_)) => break,
                    Some(ConnectorCommand::Unsubscribe(_)) => {}
                    None => {
                        info!("[Upstream] Command channel closed, exiting");
                        return;
                    }
                }
            }
        }

        let mut backoff = Backoff::new(config.backoff.clone());

        loop {
            info!("[Upstream] Connecting to {}", config.url);

            match connect_async(config.url.as_str()).await {
                Ok((ws_stream, _)) => {
                    info!("[Upstream] Connected successfully");
                    backoff.reset();

                    let connected = UpstreamUpdate::ConnectionState {
                        connected: true,
                        error: None,
                    };
                    if update_tx.send(connected).await.is_err() {
                        return;
                    }

                    let end = Self::run_session(
                        &config,
                        ws_stream,
                        &update_tx,
                        &mut command_rx,
                        &subscriptions,
                    )
                    .await;

                    let error = match end {
                        SessionEnd::Shutdown => {
                            info!("[Upstream] Connector dropped, closing connection");
                            return;
                        }
                        SessionEnd::Closed(reason) => {
                            info!("[Upstream] Connection closed: {}", reason);
                            None
                        }
                        SessionEnd::Stale => {
                            warn!(
                                "[Upstream] No message for {:?}, forcing reconnect",
                                config.stale_timeout
                            );
                            Some("upstream went silent".to_string())
                        }
                        SessionEnd::Failed(e) => {
                            error!("[Upstream] Connection error: {}", e);
                            Some(e.to_string())
                        }
                    };

                    let disconnected = UpstreamUpdate::ConnectionState {
                        connected: false,
                        error,
                    };
                    if update_tx.send(disconnected).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    error!("[Upstream] Connection failed: {}", e);
                    let failed = UpstreamUpdate::ConnectionState {
                        connected: false,
                        error: Some(e.to_string()),
                    };
                    if update_tx.send(failed).await.is_err() {
                        return;
                    }
                }
            }

            let delay = backoff.next_delay();
            info!(
                "[Upstream] Reconnecting in {:?} (attempt {})",
                delay,
                backoff.attempt()
            );
            sleep(delay).await;
        }
    }

    /// Drive one connection until it closes, fails, goes stale or is shut down
    async fn run_session<S>(
        config: &UpstreamConfig,
        ws_stream: S,
        update_tx: &mpsc::Sender<UpstreamUpdate>,
        command_rx: &mut mpsc::UnboundedReceiver<ConnectorCommand>,
        subscriptions: &Arc<RwLock<HashSet<BookKey>>>,
    ) -> SessionEnd
    where
        S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
    {
        let (mut write, mut read) = ws_stream.split();

        // Commands are queued under the write lock, so everything drained here
        // is already reflected in the set read under the same read lock
        let active: Vec<BookKey> = {
            let subs = subscriptions.read().await;
            while command_rx.try_recv().is_ok() {}
            let mut keys: Vec<BookKey> = subs.iter().cloned().collect();
            keys.sort();
            keys
        };

        if !active.is_empty() {
            info!("[Upstream] Subscribing to {} book(s)", active.len());
            if let Err(e) = Self::send_chunked(&mut write, UpstreamOp::Subscribe, &active).await {
                return SessionEnd::Failed(e);
            }
        }

        let mut heartbeat = interval_at(
            Instant::now() + config.heartbeat_interval,
            config.heartbeat_interval,
        );
        let watchdog = sleep(config.stale_timeout);
        tokio::pin!(watchdog);

        loop {
            tokio::select! {
                // Handle incoming messages
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            watchdog.as_mut().reset(Instant::now() + config.stale_timeout);
                            if let Some(update) = Self::handle_message(text.as_str()) {
                                if update_tx.send(update).await.is_err() {
                                    return SessionEnd::Shutdown;
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            watchdog.as_mut().reset(Instant::now() + config.stale_timeout);
                            if let Err(e) = write.send(Message::Pong(data)).await {
                                return SessionEnd::Failed(RelayError::network(e.to_string()));
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let reason = frame
                                .map(|f| format!("{} {}", u16::from(f.code), f.reason.as_str()))
                                .unwrap_or_else(|| "closed by server".to_string());
                            return SessionEnd::Closed(reason);
                        }
                        Some(Ok(_)) => {
                            watchdog.as_mut().reset(Instant::now() + config.stale_timeout);
                        }
                        Some(Err(e)) => {
                            return SessionEnd::Failed(RelayError::network(e.to_string()));
                        }
                        None => {
                            return SessionEnd::Closed("stream ended".to_string());
                        }
                    }
                }

                // Handle outgoing commands
                cmd = command_rx.recv() => {
                    let result = match cmd {
                        Some(ConnectorCommand::Subscribe(keys)) => {
                            Self::send_chunked(&mut write, UpstreamOp::Subscribe, &keys).await
                        }
                        Some(ConnectorCommand::Unsubscribe(keys)) => {
                            Self::send_chunked(&mut write, UpstreamOp::Unsubscribe, &keys).await
                        }
                        None => return SessionEnd::Shutdown,
                    };
                    if let Err(e) = result {
                        return SessionEnd::Failed(e);
                    }
                }

                // Keepalive
                _ = heartbeat.tick() => {
                    if let Err(e) = Self::send_request(&mut write, &UpstreamRequest::ping()).await {
                        return SessionEnd::Failed(e);
                    }
                    debug!("[Upstream] Sent heartbeat");
                }

                _ = &mut watchdog => {
                    return SessionEnd::Stale;
                }
            }
        }
    }

    /// Parse an incoming text frame; control frames are only logged
    fn handle_message(text: &str) -> Option<UpstreamUpdate> {
        match UpstreamFrame::parse(text) {
            Ok(UpstreamFrame::Book(message)) => Some(UpstreamUpdate::Book {
                message,
                raw: Arc::from(text),
            }),
            Ok(UpstreamFrame::Control(control)) => {
                if control.is_pong() {
                    debug!("[Upstream] Heartbeat acknowledged");
                } else if control.success == Some(false) {
                    warn!(
                        "[Upstream] {} rejected: {}",
                        control.op,
                        control.ret_msg.as_deref().unwrap_or("no reason given")
                    );
                } else {
                    debug!("[Upstream] {} acknowledged", control.op);
                }
                None
            }
            Err(e) => {
                warn!("[Upstream] Dropping malformed message: {}", e);
                None
            }
        }
    }

    async fn send_chunked<W>(write: &mut W, op: UpstreamOp, keys: &[BookKey]) -> RelayResult<()>
    where
        W: Sink<Message, Error = WsError> + Unpin,
    {
        for chunk in keys.chunks(MAX_ARGS_PER_REQUEST) {
            let request = match op {
                UpstreamOp::Unsubscribe => UpstreamRequest::unsubscribe(chunk),
                _ => UpstreamRequest::subscribe(chunk),
            };
            Self::send_request(write, &request).await?;
            debug!("[Upstream] Sent {:?} for {} channel(s)", op, chunk.len());
        }
        Ok(())
    }

    async fn send_request<W>(write: &mut W, request: &UpstreamRequest) -> RelayResult<()>
    where
        W: Sink<Message, Error = WsError> + Unpin,
    {
        let json = request.to_json()?;
        write
            .send(Message::text(json))
            .await
            .map_err(|e| RelayError::network(e.to_string()))
    }
}

#[async_trait]
impl BookFeed for UpstreamConnector {
    async fn subscribe_keys(&self, keys: Vec<BookKey>) -> RelayResult<Vec<BookKey>> {
        let mut subs = self.subscriptions.write().await;
        let added: Vec<BookKey> = keys
            .into_iter()
            .filter(|key| subs.insert(key.clone()))
            .collect();

        if added.is_empty() {
            debug!("[Upstream] All requested books already subscribed");
            return Ok(added);
        }

        info!("[Upstream] Subscribing to {} new book(s)", added.len());
        // Queued under the write lock; a reconnect drains under the read lock
        self.send_command(ConnectorCommand::Subscribe(added.clone()))?;
        Ok(added)
    }

    async fn unsubscribe_keys(&self, keys: Vec<BookKey>) -> RelayResult<Vec<BookKey>> {
        let mut subs = self.subscriptions.write().await;
        let removed: Vec<BookKey> = keys.into_iter().filter(|key| subs.remove(key)).collect();

        if removed.is_empty() {
            return Ok(removed);
        }

        info!("[Upstream] Unsubscribing from {} book(s)", removed.len());
        self.send_command(ConnectorCommand::Unsubscribe(removed.clone()))?;
        Ok(removed)
    }
}

impl std::fmt::Debug for UpstreamConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConnector")
            .field("config", &self.config)
            .field("started", &self.command_tx.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_book_frames_become_updates() {
        let text = r#"{"topic":"orderbook.50.BTCUSDT","type":"delta","data":{"b":[["1","2"]],"u":5}}"#;
        match UpstreamConnector::handle_message(text) {
            Some(UpstreamUpdate::Book { message, raw }) => {
                assert_eq!(message.data.update_id, 5);
                assert_eq!(&*raw, text);
            }
            other => panic!("unexpected update: {:?}", other),
        }
    }

    #[test]
    fn test_control_and_garbage_frames_are_swallowed() {
        assert!(UpstreamConnector::handle_message(r#"{"op":"pong"}"#).is_none());
        assert!(UpstreamConnector::handle_message(
            r#"{"success":false,"ret_msg":"already subscribed","op":"subscribe"}"#
        )
        .is_none());
        assert!(UpstreamConnector::handle_message("garbage").is_none());
    }

    #[tokio::test]
    async fn test_subscribe_dedups_before_start() {
        let (connector, _updates) = UpstreamConnector::new(UpstreamConfig::default());
        let depth = Depth::new(50).unwrap();

        let added = connector
            .subscribe(&["btcusdt".to_string(), "ETHUSDT".to_string()], depth)
            .await
            .unwrap();
        assert_eq!(added.len(), 2);

        let added = connector
            .subscribe(&["BTCUSDT".to_string()], depth)
            .await
            .unwrap();
        assert!(added.is_empty());

        let removed = connector
            .unsubscribe(&["SOLUSDT".to_string(), "ETHUSDT".to_string()], depth)
            .await
            .unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].symbol, "ETHUSDT");

        let active = connector.active_subscriptions().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].topic(), "orderbook.50.BTCUSDT");
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (mut connector, _updates) = UpstreamConnector::new(UpstreamConfig::default());
        connector.start().unwrap();
        assert!(connector.start().is_err());
    }
}
