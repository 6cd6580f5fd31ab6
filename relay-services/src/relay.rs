//! Relay event loop
//!
//! A single task owns the reconstructor, the snapshot cache and the client
//! subscriptions. Upstream updates and client events are both consumed here,
//! so every client queue sees a book's frames in upstream order, with the
//! cached snapshot ahead of any delta broadcast after it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use relay_core::{
    retag_as_snapshot, BookKey, BookMessage, BookMessageType, BookView, Depth, RelayError,
    RelayResult, ServerMessage,
};
use relay_upstream::{BookFeed, UpstreamUpdate};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::health::{RelayHealth, RelayMetrics};
use crate::reconstructor::{ApplyOutcome, ReconstructError, Reconstructor};
use crate::snapshot_cache::SnapshotCache;
use crate::websocket::{ClientId, ClientSender, SubscriptionManager};

/// Capacity of the client event channel
const EVENT_BUFFER: usize = 1024;

/// Requests handled by the relay loop
#[derive(Debug)]
pub enum RelayEvent {
    /// A client connected; frames for it go to `tx`
    Connected { client_id: ClientId, tx: ClientSender },
    /// Validated subscribe request
    Subscribe {
        client_id: ClientId,
        depth: Depth,
        keys: Vec<BookKey>,
    },
    /// Validated unsubscribe request
    Unsubscribe {
        client_id: ClientId,
        depth: Depth,
        keys: Vec<BookKey>,
    },
    /// The client's connection ended
    Disconnected { client_id: ClientId },
    /// Read the current reconstructed book
    BookQuery {
        key: BookKey,
        reply: oneshot::Sender<Option<BookView>>,
    },
}

/// Cloneable handle for talking to a running [`BookRelay`]
#[derive(Debug, Clone)]
pub struct RelayHandle {
    events_tx: mpsc::Sender<RelayEvent>,
    next_client_id: Arc<AtomicU64>,
    metrics: Arc<RelayMetrics>,
}

impl RelayHandle {
    /// Generate a new unique client ID
    pub fn new_client_id(&self) -> ClientId {
        ClientId(self.next_client_id.fetch_add(1, Ordering::SeqCst))
    }

    pub async fn send(&self, event: RelayEvent) -> RelayResult<()> {
        self.events_tx
            .send(event)
            .await
            .map_err(|_| RelayError::channel_closed("relay event loop stopped"))
    }

    /// Current state of a reconstructed book, `None` if nobody follows it
    pub async fn book_view(&self, key: BookKey) -> RelayResult<Option<BookView>> {
        let (reply, rx) = oneshot::channel();
        self.send(RelayEvent::BookQuery { key, reply }).await?;
        rx.await
            .map_err(|_| RelayError::channel_closed("relay dropped book query"))
    }

    pub fn metrics(&self) -> Arc<RelayMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn health(&self) -> RelayHealth {
        self.metrics.get_health()
    }
}

/// Owner of all relay state
pub struct BookRelay<F: BookFeed> {
    feed: Arc<F>,
    reconstructor: Reconstructor,
    cache: SnapshotCache,
    clients: SubscriptionManager,
    metrics: Arc<RelayMetrics>,
    events_rx: mpsc::Receiver<RelayEvent>,
}

impl<F: BookFeed> BookRelay<F> {
    pub fn new(feed: Arc<F>) -> (Self, RelayHandle) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let metrics = Arc::new(RelayMetrics::new());

        let relay = Self {
            feed,
            reconstructor: Reconstructor::new(),
            cache: SnapshotCache::new(),
            clients: SubscriptionManager::new(),
            metrics: Arc::clone(&metrics),
            events_rx,
        };
        let handle = RelayHandle {
            events_tx,
            next_client_id: Arc::new(AtomicU64::new(1)),
            metrics,
        };

        (relay, handle)
    }

    /// Run until every [`RelayHandle`] is dropped
    pub async fn run(mut self, mut upstream_rx: mpsc::Receiver<UpstreamUpdate>) {
        info!("[Relay] Event loop started");
        let mut upstream_open = true;

        loop {
            tokio::select! {
                update = upstream_rx.recv(), if upstream_open => match update {
                    Some(update) => self.handle_upstream(update),
                    None => {
                        warn!("[Relay] Upstream channel closed, no more book data");
                        upstream_open = false;
                    }
                },
                event = self.events_rx.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
            }
        }

        info!("[Relay] Event loop stopped");
    }

    fn handle_upstream(&mut self, update: UpstreamUpdate) {
        match update {
            UpstreamUpdate::Book { message, raw } => self.handle_book_message(message, raw),
            UpstreamUpdate::ConnectionState { connected, error } => {
                self.metrics.set_connected(connected);
                if connected {
                    info!("[Relay] Upstream connected");
                } else {
                    let reset = self.reconstructor.reset_all();
                    warn!(
                        "[Relay] Upstream disconnected ({}), {} book(s) awaiting snapshot",
                        error.as_deref().unwrap_or("closed"),
                        reset
                    );
                }
            }
        }
        self.publish_book_counts();
    }

    fn handle_book_message(&mut self, message: BookMessage, raw: Arc<str>) {
        self.metrics.record_message();

        let key = match message.key() {
            Ok(key) => key,
            Err(e) => {
                warn!("[Relay] Dropping book message: {}", e);
                return;
            }
        };

        // Late frames after the last client left
        if !self.clients.has_any_subscribers(&key) {
            debug!("[Relay] No subscribers for {}, dropping message", key);
            return;
        }

        match self.reconstructor.apply(&key, &message) {
            Ok(ApplyOutcome::Snapshot) => {
                self.cache
                    .store(key.clone(), Arc::clone(&raw), message.data.update_id);
                self.clients.broadcast(&key, raw);
            }
            Ok(ApplyOutcome::Restart) => {
                self.metrics.record_restart();
                let text = match message.message_type {
                    BookMessageType::Snapshot => raw,
                    BookMessageType::Delta => match retag_as_snapshot(&raw) {
                        Ok(text) => Arc::from(text),
                        Err(e) => {
                            error!("[Relay] Failed to retag restart of {}: {}", key, e);
                            raw
                        }
                    },
                };
                self.cache
                    .store(key.clone(), Arc::clone(&text), message.data.update_id);
                self.clients.broadcast(&key, text);
            }
            Ok(ApplyOutcome::Delta { gap }) => {
                if gap {
                    self.metrics.record_gap();
                    warn!(
                        "[Relay] Update id gap on {} (now at {})",
                        key, message.data.update_id
                    );
                }
                self.clients.broadcast(&key, raw);
            }
            Err(e @ ReconstructError::Malformed { .. }) => {
                self.metrics.record_rejected();
                warn!("[Relay] Rejected message: {}", e);
            }
            Err(e) => {
                self.metrics.record_rejected();
                debug!("[Relay] Rejected message: {}", e);
            }
        }
    }

    async fn handle_event(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Connected { client_id, tx } => {
                self.clients.add_client(client_id, tx);
            }
            RelayEvent::Subscribe {
                client_id,
                depth,
                keys,
            } => self.subscribe_client(client_id, depth, keys).await,
            RelayEvent::Unsubscribe {
                client_id,
                depth,
                keys,
            } => {
                let orphaned = self.clients.unsubscribe(client_id, &keys);
                let symbols = keys.into_iter().map(|k| k.symbol).collect();
                self.send_control(client_id, &ServerMessage::Unsubscribed { symbols, depth });
                self.release(orphaned).await;
            }
            RelayEvent::Disconnected { client_id } => {
                let orphaned = self.clients.remove_client(client_id);
                self.release(orphaned).await;
            }
            RelayEvent::BookQuery { key, reply } => {
                // Receiver may have given up
                let _ = reply.send(self.reconstructor.view(&key));
            }
        }

        self.metrics
            .set_connected_clients(self.clients.total_clients());
        self.publish_book_counts();
    }

    async fn subscribe_client(&mut self, client_id: ClientId, depth: Depth, keys: Vec<BookKey>) {
        let first = self.clients.subscribe(client_id, &keys);
        for key in &first {
            self.reconstructor.track(key.clone());
        }

        let symbols = keys.iter().map(|k| k.symbol.clone()).collect();
        self.send_control(client_id, &ServerMessage::Subscribed { symbols, depth });

        for key in &keys {
            if let Some(cached) = self.cache.get(key) {
                debug!(
                    "[Relay] Replaying cached snapshot {} of {} to {}",
                    cached.update_id, key, client_id
                );
                self.clients.send_to(client_id, Arc::clone(&cached.text));
            }
        }

        if first.is_empty() {
            return;
        }

        info!(
            "[Relay] {} new book(s) requested by {}",
            first.len(),
            client_id
        );
        if let Err(e) = self.feed.subscribe_keys(first).await {
            error!("[Relay] Upstream subscribe failed: {}", e);
        }
    }

    /// Stop following books nobody subscribes to anymore
    async fn release(&mut self, orphaned: Vec<BookKey>) {
        if orphaned.is_empty() {
            return;
        }

        for key in &orphaned {
            self.reconstructor.remove(key);
        }

        info!("[Relay] Releasing {} book(s)", orphaned.len());
        if let Err(e) = self.feed.unsubscribe_keys(orphaned).await {
            error!("[Relay] Upstream unsubscribe failed: {}", e);
        }
    }

    fn publish_book_counts(&self) {
        // Books awaiting a snapshot still count as followed
        self.metrics
            .set_books(self.reconstructor.len(), self.reconstructor.synced_count());
    }

    fn send_control(&self, client_id: ClientId, message: &ServerMessage) {
        match message.to_text() {
            Ok(text) => {
                self.clients.send_to(client_id, text);
            }
            Err(e) => error!("[Relay] Failed to serialize control message: {}", e),
        }
    }
}
