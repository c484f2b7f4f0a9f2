//! Event query endpoints.

use crate::error::ApiError;
use crate::state::AppState;
use crate::store::EventFilter;
use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
pub struct EventListQuery {
    pub status: Option<String>,
    pub symbol: Option<String>,
    pub source: Option<String>,
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

pub async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<EventListQuery>,
) -> Result<Json<Value>, ApiError> {
    let filter = EventFilter {
        status: query.status,
        symbol: query.symbol,
        source: query.source,
        limit: query.limit.min(100),
        offset: query.offset,
    };
    let (items, total) = state.store.list_events(&filter)?;
    Ok(Json(json!({
        "items": items,
        "total": total,
        "limit": if filter.limit == 0 { 50 } else { filter.limit },
        "offset": filter.offset,
    })))
}

pub async fn get_event(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let event = state
        .store
        .get_event(&event_id)?
        .ok_or_else(|| ApiError::not_found("Event", &event_id))?;
    let timeline = state.store.get_timeline(&event_id)?;
    let enrichment = state.store.get_enrichment(&event_id)?;
    let decisions = state.store.decisions_for_event(&event_id)?;
    Ok(Json(json!({
        "event": event,
        "timeline": timeline,
        "enrichment": enrichment,
        "decisions": decisions,
    })))
}

/// Stage + duration view computed from the timeline.
pub async fn get_event_status(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let view = state
        .store
        .event_status_view(&event_id)?
        .ok_or_else(|| ApiError::not_found("Event", &event_id))?;
    Ok(Json(serde_json::to_value(view).unwrap_or(Value::Null)))
}
