//! Signal ingress.

use crate::error::ApiError;
use crate::models::{DlqStage, EventStatus, SignalSubmission};
use crate::state::AppState;
use crate::store::{NewDlqEntry, NewEvent};
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde_json::{json, Value};
use std::time::Instant;
use tracing::{error, info};
use uuid::Uuid;

/// POST /api/v1/signals
///
/// Validates, persists the event with a RECEIVED timeline entry, produces to
/// the pending stream and appends ENQUEUED. A repeated X-Idempotency-Key
/// returns the original event_id; the same key with a different body is a
/// conflict.
pub async fn submit_signal(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    let started = Instant::now();
    let received_at = Utc::now();

    let signal: SignalSubmission = serde_json::from_value(body.clone())
        .map_err(|e| ApiError::bad_request(format!("Invalid signal payload: {e}")))?;
    let field_errors = signal.validate();
    if !field_errors.is_empty() {
        return Err(ApiError::validation(
            "Signal failed validation",
            json!(field_errors),
        ));
    }

    let raw_payload = serde_json::to_value(&signal).unwrap_or(body);
    let idempotency_key = headers
        .get("x-idempotency-key")
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string())
        .filter(|s| !s.is_empty());

    if let Some(key) = &idempotency_key {
        if let Some(existing) = state.store.find_by_idempotency_key(key)? {
            if existing.raw_payload == raw_payload {
                info!(event_id = %existing.event_id, "Duplicate signal suppressed by idempotency key");
                return Ok((
                    StatusCode::OK,
                    Json(json!({
                        "event_id": existing.event_id,
                        "status": existing.status.as_str().to_uppercase(),
                        "received_at": existing.received_at,
                    })),
                ));
            }
            return Err(ApiError::conflict(
                "Idempotency key already used with a different payload",
            ));
        }
    }

    let event_id = Uuid::new_v4().to_string();
    metrics::increment_counter!(
        "lens_signals_received_total",
        "source" => signal.source.clone(),
        "symbol" => signal.symbol.clone(),
        "event_type" => signal.event_type.clone(),
    );
    info!(
        event_id,
        stage = "RECEIVED",
        stage_status = "started",
        symbol = %signal.symbol,
        "Signal received"
    );

    state.store.insert_event(&NewEvent {
        event_id: event_id.clone(),
        idempotency_key: idempotency_key.clone(),
        event_type: signal.event_type.clone(),
        symbol: signal.symbol.clone(),
        signal_direction: signal.signal_direction.clone(),
        entry_price: signal.entry_price,
        size: signal.size,
        liquidation_price: signal.liquidation_price,
        ts_utc: signal.ts_utc.clone(),
        source: signal.source.clone(),
        feature_profile: Some(
            signal
                .feature_profile
                .clone()
                .unwrap_or_else(|| state.config.feature_profile.clone()),
        ),
        received_at,
        raw_payload: raw_payload.clone(),
    })?;

    if let Err(e) = state.producer.enqueue_signal(&event_id, &raw_payload) {
        error!(event_id, error = %e, "Failed to enqueue signal");
        let _ = state
            .store
            .transition(&event_id, EventStatus::Failed, "FAILED", None);
        let _ = state.store.insert_dlq(&NewDlqEntry {
            event_id: Some(event_id.clone()),
            stage: DlqStage::Enqueue,
            reason_code: "queue_error".into(),
            error_message: format!("{e:#}"),
            payload: raw_payload,
            retry_count: 0,
        });
        return Err(ApiError::queue("Failed to enqueue signal"));
    }
    state.store.append_timeline(&event_id, "ENQUEUED", None)?;

    metrics::increment_counter!(
        "lens_signals_enqueued_total",
        "symbol" => signal.symbol.clone(),
    );
    metrics::histogram!(
        "lens_enqueue_duration_seconds",
        started.elapsed().as_secs_f64(),
    );
    info!(event_id, stage = "ENQUEUED", stage_status = "completed", "Signal enqueued");

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "event_id": event_id,
            "status": "ENQUEUED",
            "received_at": received_at.to_rfc3339(),
        })),
    ))
}
