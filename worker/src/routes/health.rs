//! Health-check endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

/// `GET /api/health`: liveness check.
///
/// Reports version, uptime, whether the worker runs in oneshot mode, and how
/// long it has gone without a heartbeat.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": crate::WORKER_VERSION,
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "oneshot": state.config.server.oneshot,
        "idle_secs": state.liveness.idle_for().as_secs(),
    }))
}
