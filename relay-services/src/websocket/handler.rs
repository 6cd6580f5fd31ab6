//! WebSocket connection handler
//!
//! Handles individual client connections: parses and validates requests,
//! forwards them to the relay loop, and drains the client's outgoing queue
//! into the socket.

use std::fmt::Display;
use std::sync::Arc;

use chrono::Utc;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use relay_core::{BookKey, ClientMessage, Depth, ErrorCode, RelayError, RelayResult, ServerMessage};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::subscription::ClientId;
use crate::relay::{RelayEvent, RelayHandle};

/// Default capacity of a client's outgoing queue
pub const DEFAULT_CLIENT_QUEUE_CAPACITY: usize = 256;

/// Shared state for WebSocket handlers
#[derive(Debug, Clone)]
pub struct WebSocketState {
    relay: RelayHandle,
    client_queue_capacity: usize,
}

impl WebSocketState {
    pub fn new(relay: RelayHandle, client_queue_capacity: usize) -> Self {
        Self {
            relay,
            client_queue_capacity: client_queue_capacity.max(1),
        }
    }

    pub fn relay(&self) -> &RelayHandle {
        &self.relay
    }

    /// Handle a new WebSocket connection until either side closes it
    pub async fn handle_connection<S, E>(&self, socket: S)
    where
        S: Stream<Item = Result<Message, E>> + Sink<Message> + Send + 'static,
        <S as Sink<Message>>::Error: Display + Send,
        E: Display + Send,
    {
        let client_id = self.relay.new_client_id();
        info!("[WS] New connection: {}", client_id);

        let (outgoing_tx, mut outgoing_rx) =
            mpsc::channel::<Arc<str>>(self.client_queue_capacity);

        let connected = RelayEvent::Connected {
            client_id,
            tx: outgoing_tx.clone(),
        };
        if self.relay.send(connected).await.is_err() {
            warn!("[WS] Relay stopped, refusing {}", client_id);
            return;
        }

        let (mut ws_sender, mut ws_receiver) = socket.split();

        // Task: Send outgoing messages to WebSocket
        let mut send_task = tokio::spawn(async move {
            while let Some(text) = outgoing_rx.recv().await {
                if let Err(e) = ws_sender.send(Message::text(text.to_string())).await {
                    debug!("[WS] Send to {} failed: {}", client_id, e);
                    break;
                }
            }
        });

        // Task: Receive and process incoming messages
        let recv_task = async {
            while let Some(result) = ws_receiver.next().await {
                let msg = match result {
                    Ok(msg) => msg,
                    Err(e) => {
                        debug!("[WS] Error for {}: {}", client_id, e);
                        break;
                    }
                };

                if !self.handle_message(client_id, msg, &outgoing_tx).await {
                    break;
                }
            }
        };

        // Wait for either task to complete (connection closed)
        tokio::select! {
            _ = &mut send_task => {}
            _ = recv_task => {}
        }
        send_task.abort();

        // Relay may already be gone during shutdown
        let _ = self
            .relay
            .send(RelayEvent::Disconnected { client_id })
            .await;
        info!("[WS] Connection closed: {}", client_id);
    }

    /// Handle one incoming frame; returns false when the connection should end
    async fn handle_message(
        &self,
        client_id: ClientId,
        msg: Message,
        outgoing_tx: &mpsc::Sender<Arc<str>>,
    ) -> bool {
        match msg {
            Message::Text(text) => {
                if let Err(e) = self.handle_text(client_id, text.as_str(), outgoing_tx).await {
                    warn!("[WS] Error handling message from {}: {}", client_id, e);
                    let reply = ServerMessage::error(ErrorCode::from(&e), e.to_string());
                    Self::reply(outgoing_tx, &reply).await;
                }
                true
            }
            Message::Binary(_) => {
                let reply =
                    ServerMessage::error(ErrorCode::InvalidMessage, "Binary messages not supported");
                Self::reply(outgoing_tx, &reply).await;
                true
            }
            Message::Close(_) => {
                debug!("[WS] {} sent close", client_id);
                false
            }
            // Ping/Pong frames are answered by the transport
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => true,
        }
    }

    async fn handle_text(
        &self,
        client_id: ClientId,
        text: &str,
        outgoing_tx: &mpsc::Sender<Arc<str>>,
    ) -> RelayResult<()> {
        match ClientMessage::parse(text)? {
            ClientMessage::Subscribe { symbols, depth } => {
                let (depth, keys) = validate_request(&symbols, depth)?;
                self.relay
                    .send(RelayEvent::Subscribe {
                        client_id,
                        depth,
                        keys,
                    })
                    .await
            }
            ClientMessage::Unsubscribe { symbols, depth } => {
                let (depth, keys) = validate_request(&symbols, depth)?;
                self.relay
                    .send(RelayEvent::Unsubscribe {
                        client_id,
                        depth,
                        keys,
                    })
                    .await
            }
            ClientMessage::Ping { timestamp } => {
                let pong = ServerMessage::Pong {
                    client_timestamp: timestamp,
                    server_timestamp: Utc::now().timestamp_millis(),
                };
                Self::reply(outgoing_tx, &pong).await;
                Ok(())
            }
        }
    }

    async fn reply(outgoing_tx: &mpsc::Sender<Arc<str>>, message: &ServerMessage) {
        match message.to_text() {
            Ok(text) => {
                // Closed only while the connection is shutting down
                let _ = outgoing_tx.send(text).await;
            }
            Err(e) => warn!("[WS] Failed to serialize reply: {}", e),
        }
    }
}

/// Validate symbols and depth before anything reaches the relay
fn validate_request(symbols: &[String], depth: u32) -> RelayResult<(Depth, Vec<BookKey>)> {
    let depth = Depth::new(depth)?;
    if symbols.is_empty() {
        return Err(RelayError::InvalidSymbol("empty symbol list".to_string()));
    }
    let keys = BookKey::for_symbols(symbols, depth)?;
    Ok((depth, keys))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn symbols(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_validate_request() {
        let (depth, keys) = validate_request(&symbols(&["btcusdt", "BTCUSDT", "ethusdt"]), 50).unwrap();
        assert_eq!(depth.get(), 50);
        let names: Vec<&str> = keys.iter().map(|k| k.symbol.as_str()).collect();
        assert_eq!(names, vec!["BTCUSDT", "ETHUSDT"]);
    }

    #[test]
    fn test_validate_request_rejects_bad_input() {
        assert!(matches!(
            validate_request(&symbols(&["BTCUSDT"]), 30),
            Err(RelayError::InvalidDepth(30))
        ));
        assert!(matches!(
            validate_request(&[], 50),
            Err(RelayError::InvalidSymbol(_))
        ));
        assert!(matches!(
            validate_request(&symbols(&["BTC/USDT"]), 50),
            Err(RelayError::InvalidSymbol(_))
        ));
    }
}
