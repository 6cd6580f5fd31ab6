//! Subscription manager for WebSocket connections
//!
//! Tracks which clients want which books and queues text frames to them.
//! Owned by the relay event loop, so plain maps are enough.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use relay_core::BookKey;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

/// Unique identifier for a WebSocket client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Outgoing queue of a client; frames are shared between subscribers
pub type ClientSender = mpsc::Sender<Arc<str>>;

struct ClientEntry {
    tx: ClientSender,
    keys: HashSet<BookKey>,
}

/// Manages subscriptions and message fan-out
#[derive(Default)]
pub struct SubscriptionManager {
    /// Map of book key -> set of subscribed client IDs
    subscriptions: HashMap<BookKey, HashSet<ClientId>>,
    /// Map of client ID -> queue and subscribed keys
    clients: HashMap<ClientId, ClientEntry>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connected client and its outgoing queue
    pub fn add_client(&mut self, client_id: ClientId, tx: ClientSender) {
        self.clients.insert(
            client_id,
            ClientEntry {
                tx,
                keys: HashSet::new(),
            },
        );
        debug!("Client {} registered", client_id);
    }

    /// Register client subscriptions, returning keys that gained their first subscriber
    pub fn subscribe(&mut self, client_id: ClientId, keys: &[BookKey]) -> Vec<BookKey> {
        let Some(entry) = self.clients.get_mut(&client_id) else {
            warn!("Subscribe from unknown client {}", client_id);
            return Vec::new();
        };

        let mut first = Vec::new();
        for key in keys {
            entry.keys.insert(key.clone());

            let clients = self.subscriptions.entry(key.clone()).or_default();
            if clients.is_empty() {
                first.push(key.clone());
            }
            clients.insert(client_id);
        }

        debug!("Client {} subscribed to {} book(s)", client_id, keys.len());
        first
    }

    /// Remove client subscriptions, returning keys that lost their last subscriber
    pub fn unsubscribe(&mut self, client_id: ClientId, keys: &[BookKey]) -> Vec<BookKey> {
        if let Some(entry) = self.clients.get_mut(&client_id) {
            for key in keys {
                entry.keys.remove(key);
            }
        }

        let orphaned = self.detach(client_id, keys.iter());
        debug!("Client {} unsubscribed from {} book(s)", client_id, keys.len());
        orphaned
    }

    /// Remove all subscriptions for a client (on disconnect)
    pub fn remove_client(&mut self, client_id: ClientId) -> Vec<BookKey> {
        let Some(entry) = self.clients.remove(&client_id) else {
            return Vec::new();
        };

        let orphaned = self.detach(client_id, entry.keys.iter());
        info!("Client {} disconnected, removed all subscriptions", client_id);
        orphaned
    }

    fn detach<'a>(
        &mut self,
        client_id: ClientId,
        keys: impl Iterator<Item = &'a BookKey>,
    ) -> Vec<BookKey> {
        let mut orphaned = Vec::new();
        for key in keys {
            if let Some(clients) = self.subscriptions.get_mut(key) {
                if clients.remove(&client_id) && clients.is_empty() {
                    self.subscriptions.remove(key);
                    orphaned.push(key.clone());
                }
            }
        }
        orphaned.sort();
        orphaned
    }

    /// Check if a client is subscribed to a specific book
    pub fn is_subscribed(&self, client_id: ClientId, key: &BookKey) -> bool {
        self.clients
            .get(&client_id)
            .map(|entry| entry.keys.contains(key))
            .unwrap_or(false)
    }

    /// Get the number of subscribers for a book
    pub fn subscriber_count(&self, key: &BookKey) -> usize {
        self.subscriptions
            .get(key)
            .map(|clients| clients.len())
            .unwrap_or(0)
    }

    /// Check if any clients are subscribed to a given book
    pub fn has_any_subscribers(&self, key: &BookKey) -> bool {
        self.subscriber_count(key) > 0
    }

    /// Queue a frame to one client
    pub fn send_to(&self, client_id: ClientId, text: Arc<str>) -> bool {
        match self.clients.get(&client_id) {
            Some(entry) => Self::enqueue(client_id, &entry.tx, text),
            None => false,
        }
    }

    /// Queue a frame to every subscriber of a book, returning how many accepted it
    pub fn broadcast(&self, key: &BookKey, text: Arc<str>) -> usize {
        let Some(subscribers) = self.subscriptions.get(key) else {
            return 0;
        };

        subscribers
            .iter()
            .filter(|client_id| {
                self.clients
                    .get(client_id)
                    .map(|entry| Self::enqueue(**client_id, &entry.tx, text.clone()))
                    .unwrap_or(false)
            })
            .count()
    }

    fn enqueue(client_id: ClientId, tx: &ClientSender, text: Arc<str>) -> bool {
        match tx.try_send(text) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Client {} queue full, dropping message", client_id);
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Client {} queue closed", client_id);
                false
            }
        }
    }

    /// Get total number of books with at least one subscriber
    pub fn total_subscriptions(&self) -> usize {
        self.subscriptions.len()
    }

    /// Get total number of connected clients
    pub fn total_clients(&self) -> usize {
        self.clients.len()
    }
}

impl std::fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("total_subscriptions", &self.total_subscriptions())
            .field("total_clients", &self.total_clients())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::Depth;

    fn key(symbol: &str) -> BookKey {
        BookKey::new(symbol, Depth::new(50).unwrap()).unwrap()
    }

    fn client(manager: &mut SubscriptionManager, id: u64, capacity: usize) -> (ClientId, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(capacity);
        let client_id = ClientId(id);
        manager.add_client(client_id, tx);
        (client_id, rx)
    }

    #[test]
    fn test_first_and_last_subscriber() {
        let mut manager = SubscriptionManager::new();
        let (a, _rx_a) = client(&mut manager, 1, 8);
        let (b, _rx_b) = client(&mut manager, 2, 8);
        let btc = key("BTCUSDT");
        let eth = key("ETHUSDT");

        assert_eq!(manager.subscribe(a, &[btc.clone(), eth.clone()]), vec![btc.clone(), eth.clone()]);
        assert!(manager.subscribe(b, &[btc.clone()]).is_empty());
        assert_eq!(manager.subscriber_count(&btc), 2);

        assert!(manager.unsubscribe(a, &[btc.clone()]).is_empty());
        assert!(!manager.is_subscribed(a, &btc));
        assert!(manager.is_subscribed(a, &eth));

        assert_eq!(manager.remove_client(b), vec![btc.clone()]);
        assert_eq!(manager.remove_client(a), vec![eth.clone()]);
        assert_eq!(manager.total_subscriptions(), 0);
        assert_eq!(manager.total_clients(), 0);
    }

    #[test]
    fn test_unsubscribe_without_subscription_is_noop() {
        let mut manager = SubscriptionManager::new();
        let (a, _rx) = client(&mut manager, 1, 8);
        let (b, _rx_b) = client(&mut manager, 2, 8);
        let btc = key("BTCUSDT");

        manager.subscribe(b, &[btc.clone()]);
        assert!(manager.unsubscribe(a, &[btc.clone()]).is_empty());
        assert_eq!(manager.subscriber_count(&btc), 1);
    }

    #[test]
    fn test_unknown_client_cannot_subscribe() {
        let mut manager = SubscriptionManager::new();
        assert!(manager.subscribe(ClientId(9), &[key("BTCUSDT")]).is_empty());
        assert!(!manager.has_any_subscribers(&key("BTCUSDT")));
    }

    #[test]
    fn test_broadcast_only_reaches_subscribers() {
        let mut manager = SubscriptionManager::new();
        let (a, mut rx_a) = client(&mut manager, 1, 8);
        let (_b, mut rx_b) = client(&mut manager, 2, 8);
        let btc = key("BTCUSDT");
        manager.subscribe(a, &[btc.clone()]);

        assert_eq!(manager.broadcast(&btc, Arc::from("frame")), 1);
        assert_eq!(rx_a.try_recv().unwrap().as_ref(), "frame");
        assert!(rx_b.try_recv().is_err());
        assert_eq!(manager.broadcast(&key("ETHUSDT"), Arc::from("x")), 0);
    }

    #[test]
    fn test_full_queue_drops_for_that_client_only() {
        let mut manager = SubscriptionManager::new();
        let (slow, _rx_slow) = client(&mut manager, 1, 1);
        let (fast, mut rx_fast) = client(&mut manager, 2, 8);
        let btc = key("BTCUSDT");
        manager.subscribe(slow, &[btc.clone()]);
        manager.subscribe(fast, &[btc.clone()]);

        assert_eq!(manager.broadcast(&btc, Arc::from("1")), 2);
        assert_eq!(manager.broadcast(&btc, Arc::from("2")), 1);
        assert_eq!(rx_fast.try_recv().unwrap().as_ref(), "1");
        assert_eq!(rx_fast.try_recv().unwrap().as_ref(), "2");
    }
}
