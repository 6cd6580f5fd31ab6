//! WebSocket route handler
//!
//! Upgrades the connection and adapts axum's socket to the tungstenite
//! message type the connection handler works with.

use axum::{
    extract::{
        ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{stream, SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tracing::info;

use crate::AppState;

/// Create WebSocket routes
pub fn routes() -> Router<AppState> {
    Router::new().route("/ws", get(ws_handler))
}

/// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    info!("[WS] Upgrade request received");
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle an established WebSocket connection
async fn handle_socket(socket: WebSocket, state: AppState) {
    let socket = socket
        .map(|result| result.map(into_tungstenite))
        .with_flat_map(|msg: Message| stream::iter(into_axum(msg).map(Ok)));

    state.ws_state.handle_connection(socket).await;
}

fn into_tungstenite(msg: AxumMessage) -> Message {
    match msg {
        AxumMessage::Text(text) => Message::text(text.as_str().to_owned()),
        AxumMessage::Binary(data) => Message::Binary(data),
        AxumMessage::Ping(data) => Message::Ping(data),
        AxumMessage::Pong(data) => Message::Pong(data),
        AxumMessage::Close(_) => Message::Close(None),
    }
}

/// Raw frames have no axum counterpart and are dropped
fn into_axum(msg: Message) -> Option<AxumMessage> {
    match msg {
        Message::Text(text) => Some(AxumMessage::Text(text.as_str().to_owned().into())),
        Message::Binary(data) => Some(AxumMessage::Binary(data)),
        Message::Ping(data) => Some(AxumMessage::Ping(data)),
        Message::Pong(data) => Some(AxumMessage::Pong(data)),
        Message::Close(_) => Some(AxumMessage::Close(None)),
        Message::Frame(_) => None,
    }
}
