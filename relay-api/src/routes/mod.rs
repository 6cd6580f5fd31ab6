//! API route definitions

mod books;
mod health;
pub mod ws;

use axum::Router;

use crate::AppState;

/// Create all API routes
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .merge(books::routes())
        .merge(health::routes())
}

/// Create WebSocket routes (separate from API)
pub fn ws_routes() -> Router<AppState> {
    ws::routes()
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use async_trait::async_trait;
    use relay_core::{BookKey, RelayResult};
    use relay_services::{BookRelay, WebSocketState};
    use relay_upstream::BookFeed;
    use tokio::sync::mpsc;

    use crate::AppState;

    struct IdleFeed;

    #[async_trait]
    impl BookFeed for IdleFeed {
        async fn subscribe_keys(&self, keys: Vec<BookKey>) -> RelayResult<Vec<BookKey>> {
            Ok(keys)
        }

        async fn unsubscribe_keys(&self, keys: Vec<BookKey>) -> RelayResult<Vec<BookKey>> {
            Ok(keys)
        }
    }

    /// State backed by a running relay with no upstream traffic
    pub fn app_state() -> AppState {
        let (relay, handle) = BookRelay::new(Arc::new(IdleFeed));
        let (upstream_tx, upstream_rx) = mpsc::channel(1);
        tokio::spawn(async move {
            // Keep the upstream channel open for the relay's lifetime
            let _upstream_tx = upstream_tx;
            relay.run(upstream_rx).await;
        });

        AppState {
            ws_state: Arc::new(WebSocketState::new(handle.clone(), 16)),
            relay: handle,
        }
    }
}
