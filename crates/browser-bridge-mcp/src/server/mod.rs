//! Axum host adapter.
//!
//! Thin shim between the runtime-agnostic bridge core and a real HTTP
//! server: routing, WebSocket upgrades, and SSE response plumbing. All
//! protocol semantics live in [`crate::bridge`].

pub mod http;
pub mod ws;

use std::sync::Arc;

use axum::Router;
use axum::routing::{any, get};
use tower_http::trace::TraceLayer;

use crate::bridge::Bridge;

/// Build the HTTP router for the bridge.
#[must_use]
pub fn create_router(bridge: Arc<Bridge>) -> Router {
    Router::new()
        .route("/", any(http::handle_mcp))
        .route("/ws", get(ws::websocket_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(bridge)
}

/// Run the bridge over HTTP until ctrl-c, then shut it down gracefully.
///
/// # Errors
///
/// Returns error on bind or server failure.
pub async fn run_http(bridge: Arc<Bridge>, host: &str, port: u16) -> anyhow::Result<()> {
    let router = create_router(Arc::clone(&bridge));

    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    tracing::info!(addr = %listener.local_addr()?, "Bridge listening");

    axum::serve(listener, router).with_graceful_shutdown(shutdown_signal(bridge)).await?;

    tracing::info!("HTTP server shut down");
    Ok(())
}

async fn shutdown_signal(bridge: Arc<Bridge>) {
    tokio::signal::ctrl_c().await.expect("Failed to install CTRL+C handler");
    tracing::info!("Received shutdown signal");
    bridge.close().await;
}
