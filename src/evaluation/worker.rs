//! Evaluation worker: fans an enriched payload out to every enabled model in
//! parallel, persists one decision row per attempt (failures included), then
//! publishes successful decisions and closes out the event.

use super::adapter::{ModelAdapter, ModelResponse, ModelStatus};
use super::factory::{
    create_adapter, fallback_decision, normalize_decision_output, validate_decision_output,
};
use crate::models::{DecisionBroadcast, DlqStage, EventStatus};
use crate::publisher::SubscriptionHub;
use crate::queue::{ProcessError, StreamProcessor, ENRICHED_STREAM};
use crate::registry::{LlmConfigRegistry, PromptRegistry};
use crate::store::{EventStore, LlmConfigRow, NewDecision};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

pub type AdapterFactory =
    dyn Fn(&LlmConfigRow) -> anyhow::Result<Arc<dyn ModelAdapter>> + Send + Sync;

struct EvalInner {
    store: Arc<EventStore>,
    configs: Arc<LlmConfigRegistry>,
    prompts: Arc<PromptRegistry>,
    hub: Arc<SubscriptionHub>,
    /// Static fallback when the registry has no enabled models.
    fallback_models: Vec<String>,
    adapter_factory: Box<AdapterFactory>,
    /// model_name -> (config fingerprint, adapter). Rebuilt when the config
    /// changes; otherwise the adapter and its HTTP client are reused.
    adapters: Mutex<HashMap<String, (String, Arc<dyn ModelAdapter>)>>,
}

pub struct EvaluationWorker {
    inner: Arc<EvalInner>,
}

struct EvalResult {
    model: String,
    ok: bool,
    decision: Value,
}

impl EvaluationWorker {
    pub fn new(
        store: Arc<EventStore>,
        configs: Arc<LlmConfigRegistry>,
        prompts: Arc<PromptRegistry>,
        hub: Arc<SubscriptionHub>,
        fallback_models: Vec<String>,
    ) -> Self {
        Self {
            inner: Arc::new(EvalInner {
                store,
                configs,
                prompts,
                hub,
                fallback_models,
                adapter_factory: Box::new(|cfg| create_adapter(cfg)),
                adapters: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Swap the adapter factory; used by tests to inject stub adapters.
    pub fn with_adapter_factory(
        store: Arc<EventStore>,
        configs: Arc<LlmConfigRegistry>,
        prompts: Arc<PromptRegistry>,
        hub: Arc<SubscriptionHub>,
        fallback_models: Vec<String>,
        factory: Box<AdapterFactory>,
    ) -> Self {
        Self {
            inner: Arc::new(EvalInner {
                store,
                configs,
                prompts,
                hub,
                fallback_models,
                adapter_factory: factory,
                adapters: Mutex::new(HashMap::new()),
            }),
        }
    }
}

impl EvalInner {
    fn adapter_for(&self, cfg: &LlmConfigRow) -> anyhow::Result<Arc<dyn ModelAdapter>> {
        let fingerprint = format!("{}|{}|{}", cfg.provider, cfg.model_id, cfg.api_key);
        {
            let adapters = self.adapters.lock();
            if let Some((cached_fp, adapter)) = adapters.get(&cfg.model_name) {
                if *cached_fp == fingerprint {
                    return Ok(adapter.clone());
                }
            }
        }
        let adapter = (self.adapter_factory)(cfg)?;
        self.adapters
            .lock()
            .insert(cfg.model_name.clone(), (fingerprint, adapter.clone()));
        Ok(adapter)
    }

    #[allow(clippy::too_many_arguments)]
    fn persist_failure(
        &self,
        event_id: &str,
        model: &str,
        model_version: Option<&str>,
        prompt_version: Option<&str>,
        prompt_hash: Option<&str>,
        status: &str,
        error_code: Option<&str>,
        error_message: Option<&str>,
        raw_response: Option<&str>,
        latency_ms: i64,
    ) {
        let fallback = fallback_decision(model);
        let row = NewDecision {
            event_id: event_id.to_string(),
            model_name: model.to_string(),
            model_version: model_version.map(String::from),
            prompt_version: prompt_version.map(String::from),
            prompt_hash: prompt_hash.map(String::from),
            decision: "IGNORE".to_string(),
            confidence: 0.0,
            entry_plan: None,
            risk_plan: None,
            size_pct: Some(0.0),
            reasons: fallback["reasons"].clone(),
            decision_payload: fallback,
            latency_ms,
            tokens_in: 0,
            tokens_out: 0,
            status: status.to_string(),
            error_code: error_code.map(String::from),
            error_message: error_message.map(String::from),
            raw_response: raw_response.map(String::from),
        };
        if let Err(e) = self.store.insert_decision(&row) {
            error!(event_id, model, error = %e, "Failed to persist failure decision row");
        }
        metrics::increment_counter!(
            "lens_model_requests_total",
            "model" => model.to_string(),
            "status" => status.to_string(),
        );
    }

    /// Evaluate one model. Every exit path writes a decision row.
    async fn evaluate_model(&self, event_id: &str, payload: &Value, model: &str) -> EvalResult {
        let failed = |decision: Value| EvalResult {
            model: model.to_string(),
            ok: false,
            decision,
        };

        let Some(cfg) = self.configs.get(model).await else {
            warn!(event_id, model, "Model has no usable config");
            self.persist_failure(
                event_id,
                model,
                None,
                None,
                None,
                "invalid_config",
                Some("not_configured"),
                Some("No enabled configuration for model"),
                None,
                0,
            );
            return failed(fallback_decision(model));
        };

        let adapter = match self.adapter_for(&cfg) {
            Ok(a) => a,
            Err(e) => {
                let message = format!("{e:#}");
                self.persist_failure(
                    event_id,
                    model,
                    Some(cfg.model_id.as_str()),
                    None,
                    None,
                    "invalid_config",
                    Some("bad_provider"),
                    Some(message.as_str()),
                    None,
                    0,
                );
                return failed(fallback_decision(model));
            }
        };

        let constraints = payload.get("constraints").cloned().unwrap_or_else(|| json!({}));
        let rendered = match self.prompts.render(model, payload, &constraints).await {
            Ok(r) => r,
            Err(e) => {
                let message = format!("{e:#}");
                self.persist_failure(
                    event_id,
                    model,
                    Some(cfg.model_id.as_str()),
                    None,
                    None,
                    "invalid_config",
                    Some("prompt_error"),
                    Some(message.as_str()),
                    None,
                    0,
                );
                return failed(fallback_decision(model));
            }
        };

        let started = Instant::now();
        let response: ModelResponse = adapter.evaluate(&rendered.text).await;
        metrics::histogram!(
            "lens_evaluation_duration_seconds",
            started.elapsed().as_secs_f64(),
            "model" => model.to_string(),
        );
        metrics::counter!(
            "lens_model_tokens_total",
            response.tokens_in as u64,
            "model" => model.to_string(), "direction" => "in",
        );
        metrics::counter!(
            "lens_model_tokens_total",
            response.tokens_out as u64,
            "model" => model.to_string(), "direction" => "out",
        );

        if !response.status.is_success() {
            self.persist_failure(
                event_id,
                model,
                Some(response.model_version.as_str()),
                Some(rendered.version_id.as_str()),
                Some(rendered.hash.as_str()),
                response.status.db_status(),
                response.error_code.as_deref(),
                response.error_message.as_deref(),
                response.raw_text.as_deref(),
                response.latency_ms,
            );
            return failed(fallback_decision(model));
        }

        let parsed = response.parsed.clone().unwrap_or(Value::Null);
        let (valid, schema_errors) = validate_decision_output(&parsed);
        if !valid {
            warn!(event_id, model, errors = ?schema_errors, "Model output failed schema validation");
            let message = schema_errors.join("; ");
            self.persist_failure(
                event_id,
                model,
                Some(response.model_version.as_str()),
                Some(rendered.version_id.as_str()),
                Some(rendered.hash.as_str()),
                ModelStatus::SchemaError.db_status(),
                Some("schema_validation"),
                Some(message.as_str()),
                response.raw_text.as_deref(),
                response.latency_ms,
            );
            return failed(fallback_decision(model));
        }

        let normalized = normalize_decision_output(&parsed);
        let row = NewDecision {
            event_id: event_id.to_string(),
            model_name: model.to_string(),
            model_version: Some(response.model_version.clone()),
            prompt_version: Some(rendered.version_id.clone()),
            prompt_hash: Some(rendered.hash.clone()),
            decision: normalized["decision"].as_str().unwrap_or("IGNORE").to_string(),
            confidence: normalized["confidence"].as_f64().unwrap_or(0.0),
            entry_plan: Some(normalized["entry_plan"].clone()).filter(|v| !v.is_null()),
            risk_plan: Some(normalized["risk_plan"].clone()).filter(|v| !v.is_null()),
            size_pct: normalized["size_pct"].as_f64(),
            reasons: normalized["reasons"].clone(),
            decision_payload: normalized.clone(),
            latency_ms: response.latency_ms,
            tokens_in: response.tokens_in,
            tokens_out: response.tokens_out,
            status: "ok".to_string(),
            error_code: None,
            error_message: None,
            // Raw text is kept only on error paths.
            raw_response: None,
        };
        if let Err(e) = self.store.insert_decision(&row) {
            error!(event_id, model, error = %e, "Failed to persist decision row");
            return failed(normalized);
        }

        metrics::increment_counter!(
            "lens_model_requests_total",
            "model" => model.to_string(), "status" => "ok",
        );
        metrics::increment_counter!(
            "lens_signals_evaluated_total",
            "model" => model.to_string(),
            "decision" => row.decision.clone(),
        );

        EvalResult {
            model: model.to_string(),
            ok: true,
            decision: normalized,
        }
    }
}

#[async_trait]
impl StreamProcessor for EvaluationWorker {
    fn stream(&self) -> &'static str {
        ENRICHED_STREAM
    }

    fn group(&self) -> &'static str {
        "evaluation-workers"
    }

    fn stage(&self) -> DlqStage {
        DlqStage::Evaluate
    }

    async fn process(&self, event_id: &str, payload: Value) -> Result<(), ProcessError> {
        let started = Instant::now();
        let inner = self.inner.clone();

        let event = inner
            .store
            .get_event(event_id)
            .map_err(|e| ProcessError::retryable("db_error", format!("{e:#}")))?
            .ok_or_else(|| {
                ProcessError::fatal("event_not_found", format!("Event not found: {event_id}"))
            })?;

        let mut models = inner.configs.enabled_models().await;
        if models.is_empty() {
            models = inner.fallback_models.clone();
        }
        if models.is_empty() {
            return Err(ProcessError::retryable(
                "no_models_configured",
                "No AI models are enabled or configured",
            ));
        }

        // One task per model; a per-task failure is a value in the result
        // list, never a control-flow error that cancels siblings.
        let payload = Arc::new(payload);
        let handles: Vec<_> = models
            .iter()
            .map(|model| {
                let inner = inner.clone();
                let payload = payload.clone();
                let event_id = event_id.to_string();
                let model = model.clone();
                tokio::spawn(async move {
                    inner.evaluate_model(&event_id, &payload, &model).await
                })
            })
            .collect();

        let mut results: Vec<EvalResult> = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(join_err) => {
                    error!(event_id, error = %join_err, "Model evaluation task panicked");
                }
            }
        }

        let successes: Vec<&EvalResult> = results.iter().filter(|r| r.ok).collect();
        if successes.is_empty() {
            return Err(ProcessError::retryable(
                "no_successful_decisions",
                format!("All {} model evaluations failed", results.len()),
            ));
        }

        let all_models: Vec<&str> = results.iter().map(|r| r.model.as_str()).collect();
        let duration_ms = started.elapsed().as_millis() as i64;
        inner
            .store
            .transition(
                event_id,
                EventStatus::Evaluated,
                "EVALUATED",
                Some(json!({ "models": all_models, "duration_ms": duration_ms })),
            )
            .map_err(|e| ProcessError::retryable("db_error", format!("{e:#}")))?;

        // Publish each successful decision; fan-out never blocks on slow
        // subscribers (the hub evicts them instead).
        for result in &successes {
            let fanout_started = Instant::now();
            let subscribers = inner.hub.broadcast(&DecisionBroadcast {
                event_id: event_id.to_string(),
                symbol: event.symbol.clone(),
                event_type: event.event_type.clone(),
                model: result.model.clone(),
                decision: result.decision.clone(),
                published_at: Utc::now(),
            });
            metrics::histogram!(
                "lens_ws_fanout_duration_seconds",
                fanout_started.elapsed().as_secs_f64(),
            );
            metrics::increment_counter!(
                "lens_signals_published_total",
                "model" => result.model.clone(),
            );
            info!(
                event_id,
                stage = "PUBLISHED",
                stage_status = "completed",
                model = %result.model,
                subscribers,
                "Decision published"
            );
        }

        let published_models: Vec<&str> = successes.iter().map(|r| r.model.as_str()).collect();
        inner
            .store
            .transition(
                event_id,
                EventStatus::Published,
                "PUBLISHED",
                Some(json!({ "models": published_models })),
            )
            .map_err(|e| ProcessError::retryable("db_error", format!("{e:#}")))?;

        if let Ok(received) = DateTime::parse_from_rfc3339(&event.received_at) {
            let e2e = (Utc::now() - received.with_timezone(&Utc)).num_milliseconds();
            metrics::histogram!("lens_e2e_duration_seconds", e2e as f64 / 1000.0);
        }

        info!(
            event_id,
            stage = "EVALUATION",
            stage_status = "completed",
            models = successes.len(),
            duration_ms,
            "Evaluation completed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SignalSubmission;
    use crate::store::NewEvent;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct ScriptedAdapter {
        name: String,
        response: ModelResponse,
    }

    #[async_trait]
    impl ModelAdapter for ScriptedAdapter {
        fn model_name(&self) -> &str {
            &self.name
        }
        fn model_version(&self) -> &str {
            "scripted-v1"
        }
        fn is_configured(&self) -> bool {
            true
        }
        async fn evaluate(&self, _prompt: &str) -> ModelResponse {
            self.response.clone()
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        store: Arc<EventStore>,
        hub: Arc<SubscriptionHub>,
        worker: EvaluationWorker,
    }

    async fn harness(responses: HashMap<String, ModelResponse>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(EventStore::new(dir.path().join("s.db").to_str().unwrap()).unwrap());

        let prompts_dir = dir.path().join("prompts");
        std::fs::create_dir(&prompts_dir).unwrap();
        std::fs::write(
            prompts_dir.join("core_decision_v1.md"),
            "Signal: {enriched_event}\nRules: {constraints}",
        )
        .unwrap();
        for model in responses.keys() {
            std::fs::write(
                prompts_dir.join(format!("{model}_wrapper_v1.md")),
                "{core_prompt}",
            )
            .unwrap();
        }

        let configs = Arc::new(LlmConfigRegistry::new(
            store.clone(),
            Duration::from_secs(300),
        ));
        configs.initialize();
        for model in responses.keys() {
            configs
                .upsert(&LlmConfigRow {
                    model_name: model.clone(),
                    enabled: true,
                    provider: "openai".into(),
                    api_key: "sk-test".into(),
                    model_id: "gpt-4o".into(),
                    timeout_ms: 1000,
                    max_tokens: 256,
                    validation_status: None,
                    last_validated_at: None,
                })
                .await
                .unwrap();
        }

        let prompts = Arc::new(PromptRegistry::new(
            store.clone(),
            Duration::from_secs(300),
            &prompts_dir,
        ));
        prompts.initialize().await.unwrap();

        let hub = Arc::new(SubscriptionHub::new(16));
        let worker = EvaluationWorker::with_adapter_factory(
            store.clone(),
            configs,
            prompts,
            hub.clone(),
            vec![],
            Box::new(move |cfg| {
                let response = responses
                    .get(&cfg.model_name)
                    .expect("scripted response")
                    .clone();
                Ok(Arc::new(ScriptedAdapter {
                    name: cfg.model_name.clone(),
                    response,
                }) as Arc<dyn ModelAdapter>)
            }),
        );
        Harness {
            _dir: dir,
            store,
            hub,
            worker,
        }
    }

    fn insert_event(store: &EventStore, event_id: &str) {
        let signal = SignalSubmission {
            event_type: "OPEN_SIGNAL".into(),
            symbol: "BTC".into(),
            signal_direction: "long".into(),
            entry_price: 42000.5,
            size: 0.1,
            liquidation_price: Some(38000.0),
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
                liquidation_price: signal.liquidation_price,
                ts_utc: signal.ts_utc.clone(),
                source: signal.source.clone(),
                feature_profile: None,
                received_at: Utc::now(),
                raw_payload: serde_json::to_value(&signal).unwrap(),
            })
            .unwrap();
    }

    fn ok_response(model: &str) -> ModelResponse {
        ModelResponse::success(
            model,
            "scripted-v1",
            json!({
                "decision": "FOLLOW_ENTER",
                "confidence": 0.8,
                "reasons": ["bullish_trend"],
                "size_pct": 15,
            }),
            "raw".into(),
            12,
            100,
            20,
        )
    }

    fn timeout_response(model: &str) -> ModelResponse {
        ModelResponse::failure(
            model,
            "scripted-v1",
            ModelStatus::Timeout,
            "timeout",
            "Evaluation exceeded 1000ms",
            1000,
            None,
        )
    }

    fn payload(event_id: &str) -> Value {
        json!({
            "event_id": event_id,
            "symbol": "BTC",
            "event_type": "OPEN_SIGNAL",
            "constraints": { "max_leverage": 10 },
        })
    }

    #[tokio::test]
    async fn partial_model_failure_still_publishes() {
        let h = harness(HashMap::from([
            ("chatgpt".to_string(), ok_response("chatgpt")),
            ("gemini".to_string(), timeout_response("gemini")),
        ]))
        .await;
        insert_event(&h.store, "E1");
        let (tx, mut rx) = mpsc::channel(8);
        h.hub.register(tx).unwrap();

        h.worker.process("E1", payload("E1")).await.unwrap();

        // Exactly two decision rows, one ok and one timeout fallback.
        let decisions = h.store.decisions_for_event("E1").unwrap();
        assert_eq!(decisions.len(), 2);
        let ok_row = decisions.iter().find(|d| d.status == "ok").unwrap();
        assert_eq!(ok_row.model_name, "chatgpt");
        assert_eq!(ok_row.decision, "FOLLOW_ENTER");
        assert!(ok_row.prompt_version.as_deref().unwrap().contains("chatgpt_v1_core_v1"));
        let failed_row = decisions.iter().find(|d| d.status == "timeout").unwrap();
        assert_eq!(failed_row.model_name, "gemini");
        assert_eq!(failed_row.decision, "IGNORE");
        assert_eq!(failed_row.confidence, 0.0);

        // Event reached published with the full timeline.
        let event = h.store.get_event("E1").unwrap().unwrap();
        assert_eq!(event.status, EventStatus::Published);
        let statuses: Vec<String> = h
            .store
            .get_timeline("E1")
            .unwrap()
            .into_iter()
            .map(|t| t.status)
            .collect();
        assert_eq!(statuses, vec!["RECEIVED", "EVALUATED", "PUBLISHED"]);

        // Unfiltered subscriber got exactly one decision (the success).
        let first: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(first["model"], json!("chatgpt"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn all_failures_fail_the_message() {
        let h = harness(HashMap::from([(
            "chatgpt".to_string(),
            timeout_response("chatgpt"),
        )]))
        .await;
        insert_event(&h.store, "E1");

        let err = h.worker.process("E1", payload("E1")).await.unwrap_err();
        assert!(err.retryable);
        assert_eq!(err.reason_code, "no_successful_decisions");

        // The failed attempt still produced an audit row.
        let decisions = h.store.decisions_for_event("E1").unwrap();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].status, "timeout");
        // And the event did not advance.
        let event = h.store.get_event("E1").unwrap().unwrap();
        assert_eq!(event.status, EventStatus::Queued);
    }

    #[tokio::test]
    async fn schema_invalid_output_becomes_fallback_row() {
        let bad = ModelResponse::success(
            "chatgpt",
            "scripted-v1",
            json!({ "decision": "BUY", "confidence": 2.0, "reasons": [] }),
            "raw-bad".into(),
            10,
            5,
            5,
        );
        let h = harness(HashMap::from([("chatgpt".to_string(), bad)])).await;
        insert_event(&h.store, "E1");

        let err = h.worker.process("E1", payload("E1")).await.unwrap_err();
        assert_eq!(err.reason_code, "no_successful_decisions");

        let decisions = h.store.decisions_for_event("E1").unwrap();
        assert_eq!(decisions.len(), 1);
        let row = &decisions[0];
        assert_eq!(row.status, "schema_error");
        assert_eq!(row.decision, "IGNORE");
        assert_eq!(row.raw_response.as_deref(), Some("raw-bad"));
        let reasons: Vec<String> =
            serde_json::from_value(row.reasons.clone()).unwrap();
        assert!(reasons.contains(&"model_error_chatgpt".to_string()));
        assert!(reasons.contains(&"fallback_decision".to_string()));
    }

    #[tokio::test]
    async fn missing_event_is_fatal() {
        let h = harness(HashMap::from([(
            "chatgpt".to_string(),
            ok_response("chatgpt"),
        )]))
        .await;
        let err = h.worker.process("ghost", payload("ghost")).await.unwrap_err();
        assert!(!err.retryable);
        assert_eq!(err.reason_code, "event_not_found");
    }
}
