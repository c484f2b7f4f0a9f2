//! Decision query endpoints.

use crate::error::ApiError;
use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
pub struct DecisionListQuery {
    pub event_id: Option<String>,
    pub model: Option<String>,
    pub symbol: Option<String>,
    pub status: Option<String>,
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

pub async fn list_decisions(
    State(state): State<AppState>,
    Query(query): Query<DecisionListQuery>,
) -> Result<Json<Value>, ApiError> {
    let rows = state.store.list_decisions(
        query.event_id.as_deref(),
        query.model.as_deref(),
        query.symbol.as_deref(),
        query.status.as_deref(),
        query.limit.min(100),
        query.offset,
    )?;
    Ok(Json(json!({ "items": rows })))
}

pub async fn decisions_for_event(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if state.store.get_event(&event_id)?.is_none() {
        return Err(ApiError::not_found("Event", &event_id));
    }
    let rows = state.store.decisions_for_event(&event_id)?;
    Ok(Json(json!({ "event_id": event_id, "decisions": rows })))
}
