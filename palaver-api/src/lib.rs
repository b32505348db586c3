//! Signaling transport binding for palaver.
//!
//! Maps the WebSocket request/acknowledgement protocol and the
//! persistent-connection lifecycle onto the session hub in
//! `palaver-core`.

pub mod health;
pub mod ws;

use std::sync::Arc;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

use palaver_core::SessionHub;

/// Shared state for all HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<SessionHub>,
}

/// Build the HTTP router: the signaling WebSocket plus a liveness probe.
pub fn create_router(hub: Arc<SessionHub>) -> Router {
    Router::new()
        .route("/api/ws", get(ws::websocket_handler))
        .merge(health::create_health_router())
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { hub })
}
