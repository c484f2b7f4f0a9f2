//! Dead-letter queue manager: stage-aware retry and manual resolution.
//!
//! Retry re-enqueues according to the failed stage; publish retries
//! reconstruct the decision from the stored payload, persist it so the audit
//! trail gets a durable row, mark the event published and broadcast it.

use crate::error::ApiError;
use crate::models::{DecisionBroadcast, DlqStage, EventStatus};
use crate::publisher::SubscriptionHub;
use crate::queue::QueueProducer;
use crate::store::{DlqRow, EventStore, NewDecision};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, serde::Serialize)]
pub struct RetryOutcome {
    pub id: String,
    pub status: &'static str,
    pub message: String,
    pub retry_count: i64,
}

pub struct DlqManager {
    store: Arc<EventStore>,
    producer: QueueProducer,
    hub: Arc<SubscriptionHub>,
}

impl DlqManager {
    pub fn new(store: Arc<EventStore>, producer: QueueProducer, hub: Arc<SubscriptionHub>) -> Self {
        Self {
            store,
            producer,
            hub,
        }
    }

    pub async fn retry(&self, dlq_id: &str) -> Result<RetryOutcome, ApiError> {
        let entry = self
            .store
            .get_dlq(dlq_id)?
            .ok_or_else(|| ApiError::not_found("DLQ entry", dlq_id))?;
        if entry.resolved_at.is_some() {
            return Err(ApiError::bad_request("Cannot retry a resolved DLQ entry"));
        }
        let stage = DlqStage::parse(&entry.stage).ok_or_else(|| {
            ApiError::internal(format!("DLQ entry has unknown stage: {}", entry.stage))
        })?;

        let retry_count = self.store.dlq_mark_retry(dlq_id)?;

        match stage {
            DlqStage::Enqueue | DlqStage::Enrich => {
                let event_id = require_event_id(&entry, stage)?;
                self.store.set_status_unchecked(
                    &event_id,
                    EventStatus::Queued,
                    "RETRY_SCHEDULED",
                    Some(json!({ "source": "dlq_retry", "stage": stage.as_str() })),
                )?;
                self.producer
                    .enqueue_signal(&event_id, &entry.payload)
                    .map_err(|e| ApiError::queue(format!("Re-enqueue failed: {e:#}")))?;
            }
            DlqStage::Evaluate => {
                let event_id = require_event_id(&entry, stage)?;
                self.store.set_status_unchecked(
                    &event_id,
                    EventStatus::Enriched,
                    "RETRY_SCHEDULED",
                    Some(json!({ "source": "dlq_retry", "stage": stage.as_str() })),
                )?;
                self.producer
                    .enqueue_enriched(&event_id, &entry.payload)
                    .map_err(|e| ApiError::queue(format!("Re-enqueue failed: {e:#}")))?;
            }
            DlqStage::Publish => self.retry_publish(&entry)?,
        }

        info!(
            dlq_id,
            stage = stage.as_str(),
            retry_count,
            "DLQ entry re-enqueued"
        );
        Ok(RetryOutcome {
            id: entry.id,
            status: "retrying",
            message: format!("Entry re-enqueued for {} processing", stage.as_str()),
            retry_count,
        })
    }

    /// Reconstruct the decision from the stored payload and complete the
    /// publish stage: durable decision row, published status, broadcast.
    fn retry_publish(&self, entry: &DlqRow) -> Result<(), ApiError> {
        let payload = &entry.payload;
        let event_id = require_event_id(entry, DlqStage::Publish)?;
        let model = payload
            .get("model")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ApiError::bad_request("Publish payload missing model"))?
            .to_string();

        let decision = payload
            .get("decision")
            .and_then(|v| v.as_str())
            .unwrap_or("IGNORE")
            .to_string();
        let confidence = payload
            .get("confidence")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0)
            .clamp(0.0, 1.0);
        let reasons = payload
            .get("reasons")
            .filter(|v| v.is_array())
            .cloned()
            .unwrap_or_else(|| json!(["dlq_retry"]));
        let decision_payload = json!({
            "decision": decision,
            "confidence": confidence,
            "entry_plan": payload.get("entry_plan").cloned().unwrap_or(Value::Null),
            "risk_plan": payload.get("risk_plan").cloned().unwrap_or(Value::Null),
            "size_pct": payload.get("size_pct").cloned().unwrap_or(Value::Null),
            "reasons": reasons,
        });

        self.store.insert_decision(&NewDecision {
            event_id: event_id.clone(),
            model_name: model.clone(),
            model_version: None,
            prompt_version: None,
            prompt_hash: None,
            decision: decision.clone(),
            confidence,
            entry_plan: payload.get("entry_plan").filter(|v| !v.is_null()).cloned(),
            risk_plan: payload.get("risk_plan").filter(|v| !v.is_null()).cloned(),
            size_pct: payload.get("size_pct").and_then(|v| v.as_f64()),
            reasons: decision_payload["reasons"].clone(),
            decision_payload: decision_payload.clone(),
            latency_ms: 0,
            tokens_in: 0,
            tokens_out: 0,
            status: "ok".to_string(),
            error_code: None,
            error_message: None,
            raw_response: None,
        })?;

        self.store.set_status_unchecked(
            &event_id,
            EventStatus::Published,
            "PUBLISHED",
            Some(json!({ "source": "dlq_retry", "model": model })),
        )?;

        let event = self.store.get_event(&event_id)?;
        let (symbol, event_type) = event
            .map(|e| (e.symbol, e.event_type))
            .unwrap_or_else(|| ("unknown".to_string(), "OPEN_SIGNAL".to_string()));
        let subscribers = self.hub.broadcast(&DecisionBroadcast {
            event_id: event_id.clone(),
            symbol,
            event_type,
            model,
            decision: decision_payload,
            published_at: Utc::now(),
        });
        if subscribers == 0 {
            warn!(event_id = %event_id, "DLQ publish retry broadcast reached no subscribers");
        }
        Ok(())
    }

    pub fn resolve(&self, dlq_id: &str, note: &str) -> Result<String, ApiError> {
        if note.trim().is_empty() {
            return Err(ApiError::bad_request("resolution_note must not be empty"));
        }
        let entry = self
            .store
            .get_dlq(dlq_id)?
            .ok_or_else(|| ApiError::not_found("DLQ entry", dlq_id))?;
        if entry.resolved_at.is_some() {
            return Err(ApiError::bad_request("DLQ entry is already resolved"));
        }
        let resolved_at = self.store.dlq_resolve(dlq_id, note)?;
        info!(dlq_id, "DLQ entry resolved");
        Ok(resolved_at)
    }
}

fn require_event_id(entry: &DlqRow, stage: DlqStage) -> Result<String, ApiError> {
    entry.event_id.clone().ok_or_else(|| {
        ApiError::bad_request(format!("No event_id for {} retry", stage.as_str()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SignalSubmission;
    use crate::queue::StreamStore;
    use crate::store::{NewDlqEntry, NewEvent};
    use tokio::sync::mpsc;

    struct Harness {
        _dir: tempfile::TempDir,
        store: Arc<EventStore>,
        streams: Arc<StreamStore>,
        hub: Arc<SubscriptionHub>,
        manager: DlqManager,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(EventStore::new(dir.path().join("s.db").to_str().unwrap()).unwrap());
        let streams = Arc::new(
            StreamStore::new(dir.path().join("q.db").to_str().unwrap(), 60).unwrap(),
        );
        let hub = Arc::new(SubscriptionHub::new(16));
        let manager = DlqManager::new(
            store.clone(),
            QueueProducer::new(streams.clone()),
            hub.clone(),
        );
        Harness {
            _dir: dir,
            store,
            streams,
            hub,
            manager,
        }
    }

    fn insert_event(store: &EventStore, event_id: &str) {
        let signal = SignalSubmission {
            event_type: "OPEN_SIGNAL".into(),
            symbol: "BTC".into(),
            signal_direction: "long".into(),
            entry_price: 42000.0,
            size: 0.1,
            liquidation_price: None,
            ts_utc: Utc::now().to_rfc3339(),
            source: "s1".into(),
            feature_profile: None,
        };
        store
            .insert_event(&NewEvent {
                event_id: event_id.into(),
                idempotency_key: None,
                event_type: signal.event_type.clone(),
                symbol: signal.symbol.clone(),
                signal_direction: signal.signal_direction.clone(),
                entry_price: signal.entry_price,
                size: signal.size,
                liquidation_price: None,
                ts_utc: signal.ts_utc.clone(),
                source: signal.source.clone(),
                feature_profile: None,
                received_at: Utc::now(),
                raw_payload: serde_json::to_value(&signal).unwrap(),
            })
            .unwrap();
    }

    #[tokio::test]
    async fn enrich_retry_requeues_to_pending() {
        let h = harness();
        insert_event(&h.store, "E");
        let id = h
            .store
            .insert_dlq(&NewDlqEntry {
                event_id: Some("E".into()),
                stage: DlqStage::Enrich,
                reason_code: "provider_error".into(),
                error_message: "boom".into(),
                payload: json!({ "symbol": "BTC" }),
                retry_count: 5,
            })
            .unwrap();

        let outcome = h.manager.retry(&id).await.unwrap();
        assert_eq!(outcome.status, "retrying");
        assert_eq!(outcome.retry_count, 6);
        assert_eq!(h.streams.len("signals:pending").unwrap(), 1);
    }

    #[tokio::test]
    async fn evaluate_retry_requeues_to_enriched() {
        let h = harness();
        insert_event(&h.store, "E");
        let id = h
            .store
            .insert_dlq(&NewDlqEntry {
                event_id: Some("E".into()),
                stage: DlqStage::Evaluate,
                reason_code: "no_successful_decisions".into(),
                error_message: "boom".into(),
                payload: json!({ "event_id": "E" }),
                retry_count: 0,
            })
            .unwrap();
        h.manager.retry(&id).await.unwrap();
        assert_eq!(h.streams.len("signals:enriched").unwrap(), 1);
        assert_eq!(h.streams.len("signals:pending").unwrap(), 0);
    }

    #[tokio::test]
    async fn publish_retry_persists_decision_and_broadcasts() {
        let h = harness();
        insert_event(&h.store, "E");
        let (tx, mut rx) = mpsc::channel(8);
        h.hub.register(tx).unwrap();

        let id = h
            .store
            .insert_dlq(&NewDlqEntry {
                event_id: Some("E".into()),
                stage: DlqStage::Publish,
                reason_code: "broadcast_failed".into(),
                error_message: "boom".into(),
                payload: json!({
                    "event_id": "E",
                    "model": "chatgpt",
                    "decision": "FOLLOW_ENTER",
                    "confidence": 0.7,
                    "reasons": ["r"],
                }),
                retry_count: 0,
            })
            .unwrap();

        let outcome = h.manager.retry(&id).await.unwrap();
        assert_eq!(outcome.retry_count, 1);

        let event = h.store.get_event("E").unwrap().unwrap();
        assert_eq!(event.status, EventStatus::Published);

        let decisions = h.store.decisions_for_event("E").unwrap();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].decision, "FOLLOW_ENTER");
        assert_eq!(decisions[0].status, "ok");

        let timeline = h.store.get_timeline("E").unwrap();
        let published = timeline.iter().find(|t| t.status == "PUBLISHED").unwrap();
        assert_eq!(
            published.details.as_ref().unwrap()["source"],
            json!("dlq_retry")
        );

        let message: Value =
            serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(message["type"], json!("decision"));
        assert_eq!(message["model"], json!("chatgpt"));
        assert_eq!(message["symbol"], json!("BTC"));
    }

    #[tokio::test]
    async fn resolved_entry_cannot_be_retried() {
        let h = harness();
        let id = h
            .store
            .insert_dlq(&NewDlqEntry {
                event_id: Some("E".into()),
                stage: DlqStage::Enrich,
                reason_code: "x".into(),
                error_message: "m".into(),
                payload: json!({}),
                retry_count: 0,
            })
            .unwrap();
        h.manager.resolve(&id, "fixed upstream").unwrap();
        let err = h.manager.retry(&id).await.unwrap_err();
        assert_eq!(err.status, axum::http::StatusCode::BAD_REQUEST);
        // Resolving twice is also rejected.
        assert!(h.manager.resolve(&id, "again").is_err());
    }

    #[tokio::test]
    async fn empty_resolution_note_rejected() {
        let h = harness();
        let id = h
            .store
            .insert_dlq(&NewDlqEntry {
                event_id: None,
                stage: DlqStage::Enqueue,
                reason_code: "x".into(),
                error_message: "m".into(),
                payload: json!({}),
                retry_count: 0,
            })
            .unwrap();
        assert!(h.manager.resolve(&id, "   ").is_err());
    }
}
