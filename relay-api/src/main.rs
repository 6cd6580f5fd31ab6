//! Order-Book Relay Server
//!
//! Maintains order books from an upstream exchange feed and relays them to
//! browser clients over WebSocket.

mod config;
mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    http::{header, Method},
    Router,
};
use relay_services::{
    spawn_health_logger, BookRelay, RelayHandle, WebSocketState, HEALTH_LOG_INTERVAL,
};
use relay_upstream::UpstreamConnector;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::RelayConfig;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub ws_state: Arc<WebSocketState>,
    pub relay: RelayHandle,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env.local file
    if let Err(e) = dotenvy::from_filename(".env.local") {
        // Not an error if the file doesn't exist
        if !matches!(e, dotenvy::Error::Io(_)) {
            eprintln!("Warning: Failed to load .env.local: {}", e);
        }
    }

    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,relay_api=debug")),
        )
        .init();

    info!("Starting order-book relay");

    let config = RelayConfig::from_env()?;
    info!("Upstream feed: {}", config.upstream.url);

    // Connects lazily once the first book is requested
    let (mut connector, updates) = UpstreamConnector::new(config.upstream.clone());
    connector.start()?;
    let connector = Arc::new(connector);

    let (relay, relay_handle) = BookRelay::new(Arc::clone(&connector));
    tokio::spawn(relay.run(updates));
    spawn_health_logger(relay_handle.metrics(), HEALTH_LOG_INTERVAL);

    let state = AppState {
        ws_state: Arc::new(WebSocketState::new(
            relay_handle.clone(),
            config.client_queue_capacity,
        )),
        relay: relay_handle,
    };

    // Configure CORS for frontend
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    // Build router
    let app = Router::new()
        .nest("/api", routes::api_routes())
        .merge(routes::ws_routes())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    info!("Server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        // Without a signal handler, run until killed
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
