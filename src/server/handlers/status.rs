// src/server/handlers/status.rs
//! Status endpoint

use crate::server::{MetricsSnapshot, ServerState};
use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

/// Status document returned by `GET /status`
#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    /// Bytes currently accounted for in the index
    pub curr_size: i64,
    /// Configured size budget in bytes
    pub max_size: i64,
    /// Number of indexed blobs
    pub num_files: usize,
    #[serde(flatten)]
    pub metrics: MetricsSnapshot,
}

/// GET /status
pub async fn status(State(state): State<Arc<ServerState>>) -> Json<StatusResponse> {
    let (curr_size, num_files) = state.cache.stats();
    Json(StatusResponse {
        curr_size,
        max_size: state.cache.max_size(),
        num_files,
        metrics: state.metrics.snapshot(),
    })
}
