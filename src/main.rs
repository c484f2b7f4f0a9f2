//! Signal Lens backend.
//!
//! One process, three long-lived tasks: the HTTP/WebSocket server, the
//! enrichment worker loop and the evaluation worker loop. Workers block on
//! the stream substrate and spawn a task per message; shutdown drains
//! in-flight work inside a bounded grace window.

use anyhow::{Context, Result};
use clap::Parser;
use lens_backend::{
    api,
    auth::Authenticator,
    config::Config,
    dlq::DlqManager,
    enrichment::{EnrichmentService, EnrichmentWorker, ProfileRegistry, SignalValidator},
    evaluation::EvaluationWorker,
    middleware::{logging::request_logging, RateLimitConfig, RateLimiter},
    observability,
    providers::{HyperliquidProvider, MarketDataProvider},
    publisher::SubscriptionHub,
    queue::{ConsumerLoop, QueueProducer, RetryPolicy, StreamStore, ENRICHED_STREAM, PENDING_STREAM},
    registry::{LlmConfigRegistry, PromptRegistry},
    state::AppState,
    store::EventStore,
};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::{net::TcpListener, sync::watch};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "lens", about = "Trading-signal evaluation pipeline")]
struct Cli {
    /// Listen address, e.g. 0.0.0.0:3000
    #[arg(long, env = "BIND_ADDR")]
    bind: Option<String>,

    /// Event store path
    #[arg(long, env = "DB_PATH")]
    db: Option<String>,

    /// Queue substrate path
    #[arg(long, env = "QUEUE_DB_PATH")]
    queue_db: Option<String>,
}

fn load_env() {
    let _ = dotenv::dotenv();
    // Also try the crate directory when launched from elsewhere.
    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }
    if let Some(db) = cli.db {
        config.db_path = db;
    }
    if let Some(queue_db) = cli.queue_db {
        config.queue_db_path = queue_db;
    }

    let log_json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    observability::init_tracing(log_json);
    let metrics_handle = observability::init_metrics()?;

    info!("🚀 Signal Lens starting");

    let db_path = Config::resolve_data_path(&config.db_path);
    let queue_db_path = Config::resolve_data_path(&config.queue_db_path);
    let store = Arc::new(EventStore::new(&db_path)?);
    let streams = Arc::new(StreamStore::new(&queue_db_path, config.visibility_timeout_s)?);
    info!(db = %db_path, queue = %queue_db_path, "📊 Stores opened");

    let producer = QueueProducer::new(streams.clone());
    let hub = Arc::new(SubscriptionHub::new(config.ws_max_connections));

    let registry_ttl = Duration::from_secs(config.registry_ttl_s);
    let llm_configs = Arc::new(LlmConfigRegistry::new(store.clone(), registry_ttl));
    llm_configs.initialize();
    let prompts = Arc::new(PromptRegistry::new(
        store.clone(),
        registry_ttl,
        Config::resolve_data_path(&config.prompts_dir),
    ));
    prompts
        .initialize()
        .await
        .context("Prompt registry initialization failed")?;

    let auth = Arc::new(Authenticator::new(config.auth.clone()));
    let dlq = Arc::new(DlqManager::new(
        store.clone(),
        producer.clone(),
        hub.clone(),
    ));

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

    // Shutdown propagation: workers exit at the next read boundary, the
    // server stops accepting, in-flight tasks get the grace window.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    let provider: Arc<dyn MarketDataProvider> = Arc::new(HyperliquidProvider::new(
        config.provider_base_url.clone(),
        config.provider_timeout_ms,
        config.asset_ctx_ttl_ms,
    ));
    let profiles = Arc::new(match &config.profile_path {
        Some(path) => ProfileRegistry::with_overrides(&Config::resolve_data_path(path))?,
        None => ProfileRegistry::builtin(),
    });

    let retry_policy = RetryPolicy {
        max_retries: config.retry_max,
        base_delay: Duration::from_millis(config.retry_base_delay_ms),
        max_delay: Duration::from_millis(config.retry_max_delay_ms),
    };
    let grace = Duration::from_secs(config.shutdown_grace_s);
    let block = Duration::from_millis(config.consumer_block_ms);

    // Enrichment worker loop.
    {
        let service = Arc::new(EnrichmentService::new(provider.clone(), profiles.clone()));
        let validator = SignalValidator::new(
            provider.clone(),
            config.max_signal_age_s,
            config.max_price_drift_bps,
        );
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
            retry_policy,
            format!("enrich-{}", std::process::id()),
            config.consumer_batch_size,
            block,
            config.dlq_enabled,
            shutdown_rx.clone(),
            grace,
        );
        tokio::spawn(consumer.run());
    }

    // Evaluation worker loop.
    {
        let worker = Arc::new(EvaluationWorker::new(
            store.clone(),
            llm_configs.clone(),
            prompts.clone(),
            hub.clone(),
            config.ai_models.clone(),
        ));
        let consumer = ConsumerLoop::new(
            streams.clone(),
            store.clone(),
            worker,
            retry_policy,
            format!("evaluate-{}", std::process::id()),
            config.consumer_batch_size,
            block,
            config.dlq_enabled,
            shutdown_rx.clone(),
            grace,
        );
        tokio::spawn(consumer.run());
    }

    // Queue depth gauges.
    {
        let streams = streams.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for stream in [PENDING_STREAM, ENRICHED_STREAM] {
                            if let Ok(depth) = streams.len(stream) {
                                metrics::gauge!("lens_queue_depth", depth as f64, "stream" => stream);
                            }
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    // Ingress rate limiter + periodic cleanup.
    let rate_limiter = config.rate_limit_enabled.then(|| {
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig {
            per_min: config.rate_limit_per_min,
            burst: config.rate_limit_burst,
            window: Duration::from_secs(60),
        }));
        let cleanup = limiter.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(120));
            loop {
                tokio::select! {
                    _ = ticker.tick() => cleanup.cleanup(),
                    _ = shutdown.changed() => break,
                }
            }
        });
        limiter
    });

    let app = api::router(state, rate_limiter).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .layer(axum::middleware::from_fn(request_logging)),
    );

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "🎯 API server listening");

    let mut shutdown = shutdown_rx.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown.changed().await;
    })
    .await
    .context("Server error")?;

    // Give worker loops their grace window before the process exits.
    tokio::time::sleep(grace).await;
    info!("Signal Lens stopped");
    Ok(())
}
