//! End-to-end pipeline tests: real HTTP server, real stores and streams on
//! temp databases, stub market-data provider and scripted AI adapters.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use futures_util::{SinkExt, StreamExt};
use lens_backend::{
    api,
    auth::Authenticator,
    config::{AuthMode, Config},
    dlq::DlqManager,
    enrichment::{EnrichmentService, EnrichmentWorker, ProfileRegistry, SignalValidator},
    evaluation::{EvaluationWorker, ModelAdapter, ModelResponse, ModelStatus},
    models::EventStatus,
    providers::{
        Candle, FundingRate, MarketDataProvider, OpenInterest, OrderBook, ProviderError,
        ProviderResult, Ticker,
    },
    publisher::SubscriptionHub,
    queue::{ConsumerLoop, QueueProducer, RetryPolicy, StreamStore},
    registry::{LlmConfigRegistry, PromptRegistry},
    state::AppState,
    store::{EventStore, LlmConfigRow},
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message as WsMessage;

struct StubProvider {
    mid: f64,
    ticker_calls: AtomicUsize,
    fail_ticker: AtomicBool,
}

impl StubProvider {
    fn new(mid: f64) -> Self {
        Self {
            mid,
            ticker_calls: AtomicUsize::new(0),
            fail_ticker: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl MarketDataProvider for StubProvider {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn ticker(&self, symbol: &str) -> ProviderResult<Ticker> {
        self.ticker_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_ticker.load(Ordering::SeqCst) {
            return Err(ProviderError::new("stub", Some(503), "ticker down"));
        }
        Ok(Ticker {
            symbol: symbol.to_string(),
            mid: self.mid,
            bid: self.mid - 1.0,
            ask: self.mid + 1.0,
            spread_bps: 2.0 / self.mid * 10_000.0,
            timestamp: Utc::now(),
        })
    }

    async fn candles(
        &self,
        _symbol: &str,
        interval: &str,
        limit: usize,
    ) -> ProviderResult<Vec<Candle>> {
        let step = match interval {
            "15m" => 900,
            "4h" => 14_400,
            _ => 3600,
        };
        let now = Utc::now();
        Ok((0..limit)
            .map(|i| {
                let offset = (limit - 1 - i) as i64;
                let close = self.mid - offset as f64 * 0.5;
                Candle {
                    timestamp: now - ChronoDuration::seconds(offset * step),
                    open: close - 0.5,
                    high: close + 2.0,
                    low: close - 2.0,
                    close,
                    volume: 100.0,
                }
            })
            .collect())
    }

    async fn orderbook(&self, symbol: &str, _depth: usize) -> ProviderResult<OrderBook> {
        Ok(OrderBook {
            symbol: symbol.to_string(),
            bids: Vec::new(),
            asks: Vec::new(),
            timestamp: Utc::now(),
        })
    }

    async fn funding_rate(&self, symbol: &str) -> ProviderResult<FundingRate> {
        Ok(FundingRate {
            symbol: symbol.to_string(),
            rate: 0.0001,
            predicted_rate: Some(0.0001),
            timestamp: Utc::now(),
        })
    }

    async fn open_interest(&self, symbol: &str) -> ProviderResult<OpenInterest> {
        Ok(OpenInterest {
            symbol: symbol.to_string(),
            oi_usd: 1_000_000.0,
            oi_contracts: Some(25.0),
            timestamp: Utc::now(),
        })
    }

    async fn mark_price(&self, _symbol: &str) -> ProviderResult<f64> {
        Ok(self.mid)
    }

    async fn day_volume(&self, _symbol: &str) -> ProviderResult<f64> {
        Ok(5_000_000.0)
    }
}

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

fn ok_response(model: &str) -> ModelResponse {
    ModelResponse::success(
        model,
        "scripted-v1",
        json!({
            "decision": "FOLLOW_ENTER",
            "confidence": 0.8,
            "reasons": ["bullish_trend", "good_rr_ratio"],
            "entry_plan": { "type": "limit", "offset_bps": -5 },
            "risk_plan": { "stop_method": "atr", "atr_multiple": 2.0 },
            "size_pct": 15,
        }),
        "raw".into(),
        10,
        120,
        40,
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

struct TestApp {
    base_url: String,
    ws_url: String,
    state: AppState,
    provider: Arc<StubProvider>,
    client: reqwest::Client,
    _shutdown: watch::Sender<bool>,
    _dir: tempfile::TempDir,
}

async fn spawn_app(
    mid: f64,
    responses: HashMap<String, ModelResponse>,
    auth_mode: AuthMode,
) -> TestApp {
    let dir = tempfile::tempdir().unwrap();

    let prompts_dir = dir.path().join("prompts");
    std::fs::create_dir(&prompts_dir).unwrap();
    std::fs::write(
        prompts_dir.join("core_decision_v1.md"),
        "Evaluate: {enriched_event}\nConstraints: {constraints}",
    )
    .unwrap();
    for model in responses.keys() {
        std::fs::write(
            prompts_dir.join(format!("{model}_wrapper_v1.md")),
            "{core_prompt}",
        )
        .unwrap();
    }

    let mut config = Config::from_env();
    config.auth.mode = auth_mode;
    config.auth.psk_submit = Some("submit-tok".into());
    config.auth.psk_read = Some("read-tok".into());
    config.auth.psk_admin = Some("admin-tok".into());
    config.ws_enabled = true;
    config.ws_max_connections = 16;
    config.feature_profile = "crypto_perps_v1".into();

    let store = Arc::new(EventStore::new(dir.path().join("s.db").to_str().unwrap()).unwrap());
    let streams =
        Arc::new(StreamStore::new(dir.path().join("q.db").to_str().unwrap(), 60).unwrap());
    let producer = QueueProducer::new(streams.clone());
    let hub = Arc::new(SubscriptionHub::new(config.ws_max_connections));

    let llm_configs = Arc::new(LlmConfigRegistry::new(
        store.clone(),
        Duration::from_secs(300),
    ));
    llm_configs.initialize();
    for model in responses.keys() {
        llm_configs
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

    let auth = Arc::new(Authenticator::new(config.auth.clone()));
    let dlq = Arc::new(DlqManager::new(
        store.clone(),
        producer.clone(),
        hub.clone(),
    ));

    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .build_recorder()
        .handle();

    let config = Arc::new(config);
    let state = AppState {
        config: config.clone(),
        store: store.clone(),
        streams: streams.clone(),
        producer: producer.clone(),
        hub: hub.clone(),
        llm_configs: llm_configs.clone(),
        prompts: prompts.clone(),
        auth,
        dlq,
        metrics_handle,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let provider = Arc::new(StubProvider::new(mid));
    let profiles = Arc::new(ProfileRegistry::builtin());
    let policy = RetryPolicy {
        max_retries: 1,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(4),
    };
    let block = Duration::from_millis(100);
    let grace = Duration::from_secs(2);

    {
        let provider: Arc<dyn MarketDataProvider> = provider.clone();
        let service = Arc::new(EnrichmentService::new(provider.clone(), profiles.clone()));
        let validator = SignalValidator::new(provider, 300, 200.0);
        let worker = Arc::new(EnrichmentWorker::new(
            validator,
            service,
            store.clone(),
            producer.clone(),
            config.feature_profile.clone(),
        ));
        let consumer = ConsumerLoop::new(
            streams.clone(),
            store.clone(),
            worker,
            policy,
            "enrich-test".into(),
            10,
            block,
            true,
            shutdown_rx.clone(),
            grace,
        );
        tokio::spawn(consumer.run());
    }

    {
        let responses = responses.clone();
        let worker = Arc::new(EvaluationWorker::with_adapter_factory(
            store.clone(),
            llm_configs.clone(),
            prompts.clone(),
            hub.clone(),
            vec![],
            Box::new(move |cfg| {
                let response = responses.get(&cfg.model_name).expect("scripted").clone();
                Ok(Arc::new(ScriptedAdapter {
                    name: cfg.model_name.clone(),
                    response,
                }) as Arc<dyn ModelAdapter>)
            }),
        ));
        let consumer = ConsumerLoop::new(
            streams.clone(),
            store.clone(),
            worker,
            policy,
            "evaluate-test".into(),
            10,
            block,
            true,
            shutdown_rx.clone(),
            grace,
        );
        tokio::spawn(consumer.run());
    }

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = api::router(state.clone(), None);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestApp {
        base_url: format!("http://{addr}"),
        ws_url: format!("ws://{addr}/api/v1/ws"),
        state,
        provider,
        client: reqwest::Client::new(),
        _shutdown: shutdown_tx,
        _dir: dir,
    }
}

fn signal_body(entry_price: f64, ts: chrono::DateTime<Utc>) -> Value {
    json!({
        "event_type": "OPEN_SIGNAL",
        "symbol": "BTC",
        "signal_direction": "long",
        "entry_price": entry_price,
        "size": 0.1,
        "liquidation_price": 38000.00,
        "ts_utc": ts.to_rfc3339(),
        "source": "s1",
    })
}

async fn wait_for_status(app: &TestApp, event_id: &str, expected: EventStatus) {
    for _ in 0..100 {
        if let Some(event) = app.state.store.get_event(event_id).unwrap() {
            if event.status == expected {
                return;
            }
            assert!(
                !(event.status.is_terminal() && event.status != expected),
                "event settled in {:?} while waiting for {:?}",
                event.status,
                expected
            );
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for {expected:?}");
}

#[tokio::test]
async fn happy_path_signal_reaches_published() {
    let app = spawn_app(
        42000.0,
        HashMap::from([("chatgpt".to_string(), ok_response("chatgpt"))]),
        AuthMode::None,
    )
    .await;

    let response = app
        .client
        .post(format!("{}/api/v1/signals", app.base_url))
        .json(&signal_body(42000.50, Utc::now()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], json!("ENQUEUED"));
    let event_id = body["event_id"].as_str().unwrap().to_string();

    wait_for_status(&app, &event_id, EventStatus::Published).await;

    let status: Value = app
        .client
        .get(format!("{}/api/v1/events/{event_id}/status", app.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["status"], json!("published"));
    let stages: Vec<String> = status["timeline"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["status"].as_str().unwrap().to_string())
        .collect();
    let expected = ["RECEIVED", "ENQUEUED", "ENRICHED", "EVALUATED", "PUBLISHED"];
    let mut cursor = 0;
    for stage in &stages {
        if cursor < expected.len() && stage == expected[cursor] {
            cursor += 1;
        }
    }
    assert_eq!(cursor, expected.len(), "timeline {stages:?} out of order");

    let decisions = app.state.store.decisions_for_event(&event_id).unwrap();
    assert!(!decisions.is_empty());
    assert!(decisions.iter().any(|d| d.status == "ok"
        && ["FOLLOW_ENTER", "IGNORE", "FOLLOW_EXIT", "HOLD", "TIGHTEN_STOP"]
            .contains(&d.decision.as_str())));
}

#[tokio::test]
async fn drift_beyond_threshold_rejects_without_decisions() {
    // Current mid 50000 vs entry 45000: ~1111 bps > 200 bps.
    let app = spawn_app(
        50000.0,
        HashMap::from([("chatgpt".to_string(), ok_response("chatgpt"))]),
        AuthMode::None,
    )
    .await;

    let body: Value = app
        .client
        .post(format!("{}/api/v1/signals", app.base_url))
        .json(&signal_body(45000.0, Utc::now()))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let event_id = body["event_id"].as_str().unwrap().to_string();

    wait_for_status(&app, &event_id, EventStatus::Rejected).await;

    let timeline = app.state.store.get_timeline(&event_id).unwrap();
    let rejected = timeline.iter().find(|t| t.status == "REJECTED").unwrap();
    let reason = rejected.details.as_ref().unwrap()["reason"]
        .as_str()
        .unwrap()
        .to_lowercase();
    assert!(reason.contains("drift"));

    assert!(app.state.store.decisions_for_event(&event_id).unwrap().is_empty());
    // Rejection acks; nothing dead-letters.
    let (_, dlq_total) = app.state.store.list_dlq(&Default::default()).unwrap();
    assert_eq!(dlq_total, 0);
}

#[tokio::test]
async fn stale_signal_rejects_before_any_price_fetch() {
    let app = spawn_app(
        42000.0,
        HashMap::from([("chatgpt".to_string(), ok_response("chatgpt"))]),
        AuthMode::None,
    )
    .await;

    let body: Value = app
        .client
        .post(format!("{}/api/v1/signals", app.base_url))
        .json(&signal_body(42000.0, Utc::now() - ChronoDuration::seconds(600)))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let event_id = body["event_id"].as_str().unwrap().to_string();

    wait_for_status(&app, &event_id, EventStatus::Rejected).await;

    let timeline = app.state.store.get_timeline(&event_id).unwrap();
    let rejected = timeline.iter().find(|t| t.status == "REJECTED").unwrap();
    let reason = rejected.details.as_ref().unwrap()["reason"]
        .as_str()
        .unwrap()
        .to_lowercase();
    assert!(reason.contains("old"));
    // The age gate fired before any drift fetch.
    assert_eq!(app.provider.ticker_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn idempotency_key_suppresses_duplicates() {
    let app = spawn_app(
        50000.0,
        HashMap::from([("chatgpt".to_string(), ok_response("chatgpt"))]),
        AuthMode::None,
    )
    .await;
    // Reject quickly so the pipeline noise stays out of the assertion.
    let body = signal_body(45000.0, Utc::now());

    let first = app
        .client
        .post(format!("{}/api/v1/signals", app.base_url))
        .header("X-Idempotency-Key", "abc")
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), 201);
    let first_body: Value = first.json().await.unwrap();

    let second = app
        .client
        .post(format!("{}/api/v1/signals", app.base_url))
        .header("X-Idempotency-Key", "abc")
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), 200);
    let second_body: Value = second.json().await.unwrap();
    assert_eq!(first_body["event_id"], second_body["event_id"]);

    let (_, total) = app
        .state
        .store
        .list_events(&Default::default())
        .unwrap();
    assert_eq!(total, 1);
    // Only one message was produced on pending.
    assert_eq!(app.state.streams.len("signals:pending").unwrap(), 1);

    // Same key, different body: conflict.
    let conflict = app
        .client
        .post(format!("{}/api/v1/signals", app.base_url))
        .header("X-Idempotency-Key", "abc")
        .json(&signal_body(46000.0, Utc::now()))
        .send()
        .await
        .unwrap();
    assert_eq!(conflict.status(), 409);
}

#[tokio::test]
async fn partial_model_failure_publishes_single_decision_to_subscribers() {
    let app = spawn_app(
        42000.0,
        HashMap::from([
            ("chatgpt".to_string(), ok_response("chatgpt")),
            ("gemini".to_string(), timeout_response("gemini")),
        ]),
        AuthMode::None,
    )
    .await;

    let (mut ws, _) = tokio_tungstenite::connect_async(app.ws_url.as_str()).await.unwrap();
    ws.send(WsMessage::Text(
        json!({ "action": "subscribe", "filters": {} }).to_string(),
    ))
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let body: Value = app
        .client
        .post(format!("{}/api/v1/signals", app.base_url))
        .json(&signal_body(42000.0, Utc::now()))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let event_id = body["event_id"].as_str().unwrap().to_string();
    wait_for_status(&app, &event_id, EventStatus::Published).await;

    let decisions = app.state.store.decisions_for_event(&event_id).unwrap();
    assert_eq!(decisions.len(), 2);
    let ok_row = decisions.iter().find(|d| d.status == "ok").unwrap();
    assert_eq!(ok_row.model_name, "chatgpt");
    let timeout_row = decisions.iter().find(|d| d.status == "timeout").unwrap();
    assert_eq!(timeout_row.model_name, "gemini");
    assert_eq!(timeout_row.decision, "IGNORE");
    assert_eq!(timeout_row.confidence, 0.0);

    // Exactly one decision message arrives (the successful model's).
    let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("decision frame")
        .unwrap()
        .unwrap();
    let message: Value = serde_json::from_str(frame.to_text().unwrap()).unwrap();
    assert_eq!(message["type"], json!("decision"));
    assert_eq!(message["model"], json!("chatgpt"));
    assert_eq!(message["event_id"], json!(event_id));
    assert_eq!(message["symbol"], json!("BTC"));
    assert!(message["decision"]["confidence"].as_f64().unwrap() >= 0.0);

    let extra = tokio::time::timeout(Duration::from_millis(500), ws.next()).await;
    assert!(extra.is_err(), "unexpected second decision frame");
}

#[tokio::test]
async fn ws_control_protocol_ping_and_unknown_action() {
    let app = spawn_app(42000.0, HashMap::new(), AuthMode::None).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(app.ws_url.as_str()).await.unwrap();

    ws.send(WsMessage::Text(json!({ "type": "ping" }).to_string()))
        .await
        .unwrap();
    let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let message: Value = serde_json::from_str(frame.to_text().unwrap()).unwrap();
    assert_eq!(message["type"], json!("pong"));

    ws.send(WsMessage::Text(
        json!({ "action": "self_destruct" }).to_string(),
    ))
    .await
    .unwrap();
    let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let message: Value = serde_json::from_str(frame.to_text().unwrap()).unwrap();
    assert_eq!(message["type"], json!("error"));
    assert_eq!(message["code"], json!("INVALID_ACTION"));

    // The connection stays open after an unknown action.
    ws.send(WsMessage::Text(json!({ "type": "ping" }).to_string()))
        .await
        .unwrap();
    let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(frame.to_text().unwrap().contains("pong"));
}

#[tokio::test]
async fn provider_outage_dead_letters_after_retries() {
    let app = spawn_app(
        42000.0,
        HashMap::from([("chatgpt".to_string(), ok_response("chatgpt"))]),
        AuthMode::None,
    )
    .await;
    app.provider.fail_ticker.store(true, Ordering::SeqCst);

    let body: Value = app
        .client
        .post(format!("{}/api/v1/signals", app.base_url))
        .json(&signal_body(42000.0, Utc::now()))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let event_id = body["event_id"].as_str().unwrap().to_string();

    wait_for_status(&app, &event_id, EventStatus::Dlq).await;
    let (rows, total) = app.state.store.list_dlq(&Default::default()).unwrap();
    assert_eq!(total, 1);
    assert_eq!(rows[0].stage, "enrich");
    assert_eq!(rows[0].event_id.as_deref(), Some(event_id.as_str()));
}

#[tokio::test]
async fn psk_scopes_are_enforced() {
    let app = spawn_app(
        42000.0,
        HashMap::from([("chatgpt".to_string(), ok_response("chatgpt"))]),
        AuthMode::Psk,
    )
    .await;
    let signals_url = format!("{}/api/v1/signals", app.base_url);
    let events_url = format!("{}/api/v1/events", app.base_url);
    let body = signal_body(42000.0, Utc::now());

    // No token: 401.
    let r = app.client.post(&signals_url).json(&body).send().await.unwrap();
    assert_eq!(r.status(), 401);
    let envelope: Value = r.json().await.unwrap();
    assert_eq!(envelope["error"]["code"], json!("UNAUTHORIZED"));

    // Read token cannot submit: 403.
    let r = app
        .client
        .post(&signals_url)
        .bearer_auth("read-tok")
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(r.status(), 403);

    // Submit token can submit but not read.
    let r = app
        .client
        .post(&signals_url)
        .bearer_auth("submit-tok")
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(r.status(), 201);
    let r = app
        .client
        .get(&events_url)
        .bearer_auth("submit-tok")
        .send()
        .await
        .unwrap();
    assert_eq!(r.status(), 403);

    // Read token reads; admin token satisfies everything.
    let r = app
        .client
        .get(&events_url)
        .bearer_auth("read-tok")
        .send()
        .await
        .unwrap();
    assert_eq!(r.status(), 200);
    let r = app
        .client
        .get(&events_url)
        .bearer_auth("admin-tok")
        .send()
        .await
        .unwrap();
    assert_eq!(r.status(), 200);
}

#[tokio::test]
async fn dlq_publish_retry_round_trips_through_the_api() {
    let app = spawn_app(
        42000.0,
        HashMap::from([("chatgpt".to_string(), ok_response("chatgpt"))]),
        AuthMode::None,
    )
    .await;

    // Seed an event and a publish-stage DLQ entry the way a failed broadcast
    // would have left them.
    let body: Value = app
        .client
        .post(format!("{}/api/v1/signals", app.base_url))
        .json(&signal_body(42000.0, Utc::now()))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let event_id = body["event_id"].as_str().unwrap().to_string();
    wait_for_status(&app, &event_id, EventStatus::Published).await;

    let dlq_id = app
        .state
        .store
        .insert_dlq(&lens_backend::store::NewDlqEntry {
            event_id: Some(event_id.clone()),
            stage: lens_backend::models::DlqStage::Publish,
            reason_code: "broadcast_failed".into(),
            error_message: "socket gone".into(),
            payload: json!({
                "event_id": event_id,
                "model": "chatgpt",
                "decision": "FOLLOW_ENTER",
                "confidence": 0.7,
                "reasons": ["r"],
            }),
            retry_count: 0,
        })
        .unwrap();

    let before = app.state.store.decisions_for_event(&event_id).unwrap().len();
    let response = app
        .client
        .post(format!("{}/api/v1/dlq/{dlq_id}/retry", app.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let outcome: Value = response.json().await.unwrap();
    assert_eq!(outcome["retry_count"], json!(1));

    let event = app.state.store.get_event(&event_id).unwrap().unwrap();
    assert_eq!(event.status, EventStatus::Published);
    let after = app.state.store.decisions_for_event(&event_id).unwrap().len();
    assert_eq!(after, before + 1);
    let timeline = app.state.store.get_timeline(&event_id).unwrap();
    assert!(timeline.iter().any(|t| t.status == "PUBLISHED"
        && t.details
            .as_ref()
            .map(|d| d["source"] == json!("dlq_retry"))
            .unwrap_or(false)));
}
