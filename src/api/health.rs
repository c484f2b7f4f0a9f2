//! Health and metrics endpoints.

use crate::state::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use tracing::warn;

/// Liveness: 200 whenever the process is up.
pub async fn liveness() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Readiness: pings the event store and the queue substrate; 503 on any
/// failure.
pub async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    let db_ok = state.store.ping().is_ok();
    let queue_ok = state.streams.ping().is_ok();
    if db_ok && queue_ok {
        (
            StatusCode::OK,
            Json(json!({ "status": "ready", "db": "ok", "queue": "ok" })),
        )
    } else {
        warn!(db_ok, queue_ok, "Readiness check failed");
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "unavailable",
                "db": if db_ok { "ok" } else { "error" },
                "queue": if queue_ok { "ok" } else { "error" },
            })),
        )
    }
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics_handle.render()
}
