//! DLQ management endpoints.

use crate::error::ApiError;
use crate::models::DlqStage;
use crate::state::AppState;
use crate::store::{DlqFilter, DlqRow, DLQ_SUMMARY_ERROR_LEN};
use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
pub struct DlqListQuery {
    /// Canonical stage or a legacy alias (enrichment, evaluation).
    pub stage: Option<String>,
    pub reason_code: Option<String>,
    pub event_id: Option<String>,
    pub resolved: Option<bool>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn summarize(row: &DlqRow) -> Value {
    let error_message: String = row.error_message.chars().take(DLQ_SUMMARY_ERROR_LEN).collect();
    json!({
        "id": row.id,
        "event_id": row.event_id,
        "stage": row.stage,
        "reason_code": row.reason_code,
        "error_message": error_message,
        "retry_count": row.retry_count,
        "created_at": row.created_at,
        "resolved_at": row.resolved_at,
    })
}

pub async fn list_dlq(
    State(state): State<AppState>,
    Query(query): Query<DlqListQuery>,
) -> Result<Json<Value>, ApiError> {
    let stage = match &query.stage {
        Some(raw) => Some(DlqStage::parse(raw).ok_or_else(|| {
            ApiError::bad_request(format!(
                "Invalid stage '{raw}' (expected enqueue|enrich|evaluate|publish)"
            ))
        })?),
        None => None,
    };
    let filter = DlqFilter {
        stage,
        reason_code: query.reason_code,
        event_id: query.event_id,
        resolved: query.resolved,
        since: query.since,
        until: query.until,
        limit: query.limit.min(100),
        offset: query.offset,
    };
    let (rows, total) = state.store.list_dlq(&filter)?;
    let items: Vec<Value> = rows.iter().map(summarize).collect();
    Ok(Json(json!({
        "items": items,
        "total": total,
        "limit": if filter.limit == 0 { 50 } else { filter.limit },
        "offset": filter.offset,
    })))
}

pub async fn get_dlq(
    State(state): State<AppState>,
    Path(dlq_id): Path<String>,
) -> Result<Json<DlqRow>, ApiError> {
    let entry = state
        .store
        .get_dlq(&dlq_id)?
        .ok_or_else(|| ApiError::not_found("DLQ entry", &dlq_id))?;
    Ok(Json(entry))
}

pub async fn retry_dlq(
    State(state): State<AppState>,
    Path(dlq_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let outcome = state.dlq.retry(&dlq_id).await?;
    Ok(Json(serde_json::to_value(outcome).unwrap_or(Value::Null)))
}

#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    pub resolution_note: String,
}

pub async fn resolve_dlq(
    State(state): State<AppState>,
    Path(dlq_id): Path<String>,
    Json(request): Json<ResolveRequest>,
) -> Result<Json<Value>, ApiError> {
    let resolved_at = state.dlq.resolve(&dlq_id, &request.resolution_note)?;
    Ok(Json(json!({
        "id": dlq_id,
        "status": "resolved",
        "resolved_at": resolved_at,
    })))
}
