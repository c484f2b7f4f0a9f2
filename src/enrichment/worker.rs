//! Enrichment worker: consumes pending signals, validates, enriches and
//! forwards to the evaluation stream.

use super::{EnrichmentService, SignalValidator};
use crate::models::{DlqStage, EventStatus, SignalSubmission};
use crate::queue::{ProcessError, QueueProducer, StreamProcessor, PENDING_STREAM};
use crate::store::{EventStore, NewEnrichment};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

pub struct EnrichmentWorker {
    validator: SignalValidator,
    service: Arc<EnrichmentService>,
    store: Arc<EventStore>,
    producer: QueueProducer,
    default_profile: String,
}

impl EnrichmentWorker {
    pub fn new(
        validator: SignalValidator,
        service: Arc<EnrichmentService>,
        store: Arc<EventStore>,
        producer: QueueProducer,
        default_profile: String,
    ) -> Self {
        Self {
            validator,
            service,
            store,
            producer,
            default_profile,
        }
    }

    async fn mark_rejected(
        &self,
        event_id: &str,
        signal: &SignalSubmission,
        rejection: &super::validator::Rejection,
    ) -> Result<(), ProcessError> {
        self.store
            .transition(
                event_id,
                EventStatus::Rejected,
                "REJECTED",
                Some(json!({
                    "reason": rejection.message,
                    "reason_code": rejection.reason_code,
                    "symbol": signal.symbol,
                    "details": rejection.details,
                })),
            )
            .map_err(|e| ProcessError::retryable("db_error", format!("{e:#}")))?;
        metrics::increment_counter!(
            "lens_signals_rejected_total",
            "reason" => rejection.reason_code,
        );
        warn!(
            event_id,
            reason = rejection.reason_code,
            "Signal rejected before enrichment"
        );
        Ok(())
    }
}

#[async_trait]
impl StreamProcessor for EnrichmentWorker {
    fn stream(&self) -> &'static str {
        PENDING_STREAM
    }

    fn group(&self) -> &'static str {
        "enrichment-workers"
    }

    fn stage(&self) -> DlqStage {
        DlqStage::Enrich
    }

    async fn process(&self, event_id: &str, payload: Value) -> Result<(), ProcessError> {
        let started = Instant::now();
        let signal: SignalSubmission = serde_json::from_value(payload)
            .map_err(|e| ProcessError::fatal("bad_payload", format!("Signal decode failed: {e}")))?;

        // Early gate: age + drift. Hard failures ack; provider errors retry.
        let validation = self
            .validator
            .validate(&signal)
            .await
            .map_err(|e| ProcessError::retryable("provider_error", e.to_string()))?;
        if let Some(rejection) = &validation.rejection {
            return self.mark_rejected(event_id, &signal, rejection).await;
        }

        let event = self
            .store
            .get_event(event_id)
            .map_err(|e| ProcessError::retryable("db_error", format!("{e:#}")))?
            .ok_or_else(|| {
                ProcessError::fatal("event_not_found", format!("Event not found: {event_id}"))
            })?;

        let profile = event
            .feature_profile
            .clone()
            .unwrap_or_else(|| self.default_profile.clone());

        let outcome = self.service.enrich(event_id, &signal, &profile).await;

        // Total provider failure: nothing to hand downstream, retry instead.
        if outcome.market_data.is_none() {
            return Err(ProcessError::retryable(
                "provider_error",
                format!(
                    "Market data unavailable: {}",
                    outcome.quality_flags.provider_errors.join("; ")
                ),
            ));
        }

        let duration_ms = started.elapsed().as_millis() as i64;
        let status = if outcome.success {
            EventStatus::Enriched
        } else {
            warn!(
                event_id,
                errors = ?outcome.quality_flags.provider_errors,
                missing = ?outcome.quality_flags.missing,
                "Enrichment completed with issues"
            );
            EventStatus::EnrichmentPartial
        };

        let enrichment = NewEnrichment {
            event_id: event_id.to_string(),
            feature_profile: profile.clone(),
            provider: self.service.provider().name().to_string(),
            market_data: outcome.market_data.clone(),
            ta_data: outcome.ta_data.clone(),
            derivs_data: outcome.derivs_data.clone(),
            constraints: outcome.constraints.clone(),
            data_timestamps: outcome.data_timestamps.clone(),
            quality_flags: outcome.quality_flags.to_json(),
            enriched_payload: outcome.enriched_payload.clone(),
            enriched_at: Utc::now(),
            enrichment_duration_ms: duration_ms,
        };
        self.store
            .insert_enrichment(
                &enrichment,
                status,
                json!({
                    "duration_ms": duration_ms,
                    "profile": profile.clone(),
                    "success": outcome.success,
                    "quality_flags": outcome.quality_flags.to_json(),
                }),
            )
            .map_err(|e| ProcessError::retryable("db_error", format!("{e:#}")))?;

        // Produce downstream only after the enrichment commit.
        self.producer
            .enqueue_enriched(event_id, &outcome.enriched_payload)
            .map_err(|e| ProcessError::retryable("queue_error", format!("{e:#}")))?;

        metrics::increment_counter!(
            "lens_signals_enriched_total",
            "symbol" => signal.symbol.clone(),
            "profile" => profile,
        );
        metrics::histogram!(
            "lens_enrichment_duration_seconds",
            started.elapsed().as_secs_f64(),
        );

        info!(
            event_id,
            stage = "ENRICHMENT",
            stage_status = "completed",
            duration_ms,
            success = outcome.success,
            "Signal enriched"
        );
        Ok(())
    }
}
