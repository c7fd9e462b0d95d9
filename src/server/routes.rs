// src/server/routes.rs
//! Axum router configuration
//!
//! The wire surface is deliberately small: the three blob methods on
//! `/{kind}/{digest}` plus the status page. Compression stays off - blob
//! bodies are opaque binary and usually already compressed by the client.

use crate::server::handlers::{blobs, status};
use crate::server::ServerState;
use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Build the application router
pub fn create_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/status", get(status::status))
        .route(
            "/{kind}/{digest}",
            get(blobs::get_blob)
                .head(blobs::head_blob)
                .put(blobs::put_blob),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
