//! Generic consumer loop over the stream substrate.
//!
//! Each worker implements `StreamProcessor`; the loop handles delivery,
//! per-message task spawning, retry with exponential backoff and jitter, and
//! DLQ capture once retries are exhausted. The source message is always acked
//! after a failure is re-enqueued or dead-lettered, so the substrate never
//! redelivers something the policy already routed.

use crate::models::{DlqStage, EventStatus};
use crate::queue::{QueueProducer, StreamEntry, StreamStore, DLQ_STREAM};
use crate::store::{EventStore, NewDlqEntry};
use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Processing failure with routing information.
#[derive(Debug)]
pub struct ProcessError {
    pub reason_code: String,
    pub message: String,
    pub retryable: bool,
}

impl ProcessError {
    pub fn retryable(reason_code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            reason_code: reason_code.into(),
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(reason_code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            reason_code: reason_code.into(),
            message: message.into(),
            retryable: false,
        }
    }
}

impl From<anyhow::Error> for ProcessError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable("internal_error", format!("{err:#}"))
    }
}

impl std::fmt::Display for ProcessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.reason_code, self.message)
    }
}

/// A stage worker's message handler.
#[async_trait]
pub trait StreamProcessor: Send + Sync + 'static {
    fn stream(&self) -> &'static str;
    fn group(&self) -> &'static str;
    fn stage(&self) -> DlqStage;

    /// Process one message. `Ok(())` acks; errors are routed per retryability.
    async fn process(&self, event_id: &str, payload: Value) -> Result<(), ProcessError>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Exponential backoff `base * 2^n` capped at max_delay, with ±25% jitter.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let base = self.base_delay.as_millis() as f64;
        let cap = self.max_delay.as_millis() as f64;
        let exp = base * 2f64.powi(retry_count.min(16) as i32);
        let delay = exp.min(cap);
        let jitter = delay * 0.25 * (2.0 * rand::thread_rng().gen::<f64>() - 1.0);
        Duration::from_millis((delay + jitter).max(0.0) as u64)
    }
}

pub struct ConsumerLoop<P: StreamProcessor> {
    streams: Arc<StreamStore>,
    store: Arc<EventStore>,
    producer: QueueProducer,
    processor: Arc<P>,
    policy: RetryPolicy,
    consumer_name: String,
    batch_size: usize,
    block: Duration,
    dlq_enabled: bool,
    shutdown: watch::Receiver<bool>,
    grace: Duration,
}

impl<P: StreamProcessor> ConsumerLoop<P> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        streams: Arc<StreamStore>,
        store: Arc<EventStore>,
        processor: Arc<P>,
        policy: RetryPolicy,
        consumer_name: String,
        batch_size: usize,
        block: Duration,
        dlq_enabled: bool,
        shutdown: watch::Receiver<bool>,
        grace: Duration,
    ) -> Self {
        let producer = QueueProducer::new(streams.clone());
        Self {
            streams,
            store,
            producer,
            processor,
            policy,
            consumer_name,
            batch_size,
            block,
            dlq_enabled,
            shutdown,
            grace,
        }
    }

    pub async fn run(self) {
        let stream = self.processor.stream();
        let group = self.processor.group();
        if let Err(e) = self.streams.ensure_group(stream, group) {
            error!(stream, group, error = %e, "Failed to create consumer group");
            return;
        }
        info!(stream, group, consumer = %self.consumer_name, "Worker loop started");

        let in_flight = Arc::new(AtomicUsize::new(0));
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            metrics::gauge!(
                "lens_worker_heartbeat_ts",
                chrono::Utc::now().timestamp() as f64,
                "worker" => group,
            );
            let batch = match self
                .streams
                .read_group(stream, group, &self.consumer_name, self.batch_size, self.block)
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    error!(stream, error = %e, "Consumer read failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            for entry in batch {
                // Refuse new work once shutdown is requested.
                if *self.shutdown.borrow() {
                    break;
                }
                let counter = in_flight.clone();
                counter.fetch_add(1, Ordering::SeqCst);
                let worker = self.message_worker();
                tokio::spawn(async move {
                    worker.handle(entry).await;
                    counter.fetch_sub(1, Ordering::SeqCst);
                });
            }
        }

        // Bounded grace window for in-flight tasks, then give up.
        let deadline = tokio::time::Instant::now() + self.grace;
        while in_flight.load(Ordering::SeqCst) > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let remaining = in_flight.load(Ordering::SeqCst);
        if remaining > 0 {
            warn!(stream, group, remaining, "Shutdown grace expired with tasks in flight");
        }
        info!(stream, group, "Worker loop stopped");
    }

    fn message_worker(&self) -> MessageWorker<P> {
        MessageWorker {
            streams: self.streams.clone(),
            store: self.store.clone(),
            producer: self.producer.clone(),
            processor: self.processor.clone(),
            policy: self.policy,
            dlq_enabled: self.dlq_enabled,
        }
    }
}

struct MessageWorker<P: StreamProcessor> {
    streams: Arc<StreamStore>,
    store: Arc<EventStore>,
    producer: QueueProducer,
    processor: Arc<P>,
    policy: RetryPolicy,
    dlq_enabled: bool,
}

impl<P: StreamProcessor> MessageWorker<P> {
    async fn handle(&self, entry: StreamEntry) {
        let stream = self.processor.stream();
        let group = self.processor.group();
        let event_id = entry
            .fields
            .get("event_id")
            .cloned()
            .unwrap_or_default();
        let retry_count: u32 = entry
            .fields
            .get("retry_count")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let payload: Value = entry
            .fields
            .get("payload")
            .and_then(|p| serde_json::from_str(p).ok())
            .unwrap_or(Value::Null);

        let result = if payload.is_null() {
            Err(ProcessError::fatal("bad_message", "Message payload is not valid JSON"))
        } else {
            self.processor.process(&event_id, payload).await
        };

        match result {
            Ok(()) => {
                if let Err(e) = self.streams.ack(stream, group, entry.id) {
                    warn!(stream, entry_id = entry.id, error = %e, "Ack failed");
                }
            }
            Err(err) => {
                self.handle_failure(&entry, &event_id, retry_count, err).await;
            }
        }
    }

    async fn handle_failure(
        &self,
        entry: &StreamEntry,
        event_id: &str,
        retry_count: u32,
        err: ProcessError,
    ) {
        let stream = self.processor.stream();
        let group = self.processor.group();
        let stage = self.processor.stage();

        if err.retryable && retry_count < self.policy.max_retries {
            let delay = self.policy.backoff(retry_count);
            warn!(
                event_id,
                stage = stage.as_str(),
                retry = retry_count + 1,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Processing failed, scheduling retry"
            );
            tokio::time::sleep(delay).await;
            let payload: Value = entry
                .fields
                .get("payload")
                .and_then(|p| serde_json::from_str(p).ok())
                .unwrap_or(Value::Null);
            if let Err(e) = self
                .producer
                .requeue(stream, event_id, &payload, retry_count + 1)
            {
                error!(event_id, error = %e, "Requeue failed; message will be reclaimed");
                return; // leave unacked so the visibility timeout redelivers
            }
        } else if self.dlq_enabled {
            self.dead_letter(entry, event_id, retry_count, &err);
        } else {
            error!(event_id, error = %err, "Processing failed with DLQ disabled; dropping");
        }

        if let Err(e) = self.streams.ack(stream, group, entry.id) {
            warn!(stream, entry_id = entry.id, error = %e, "Ack after failure routing failed");
        }
    }

    fn dead_letter(
        &self,
        entry: &StreamEntry,
        event_id: &str,
        retry_count: u32,
        err: &ProcessError,
    ) {
        let stage = self.processor.stage();
        let payload: Value = entry
            .fields
            .get("payload")
            .and_then(|p| serde_json::from_str(p).ok())
            .unwrap_or(Value::Null);
        error!(
            event_id,
            stage = stage.as_str(),
            reason = %err.reason_code,
            "Retries exhausted, writing DLQ entry"
        );

        let row = NewDlqEntry {
            event_id: (!event_id.is_empty()).then(|| event_id.to_string()),
            stage,
            reason_code: err.reason_code.clone(),
            error_message: err.message.clone(),
            payload: payload.clone(),
            retry_count: retry_count as i64,
        };
        if let Err(e) = self.store.insert_dlq(&row) {
            error!(event_id, error = %e, "Failed to persist DLQ row");
        }

        // Mirror onto the dlq stream for stream-side consumers.
        let mut fields: HashMap<String, String> = HashMap::new();
        fields.insert("event_id".to_string(), event_id.to_string());
        fields.insert("stage".to_string(), stage.as_str().to_string());
        fields.insert("reason_code".to_string(), err.reason_code.clone());
        fields.insert("error_message".to_string(), err.message.clone());
        fields.insert("payload".to_string(), payload.to_string());
        fields.insert("retry_count".to_string(), retry_count.to_string());
        if let Err(e) = self.streams.append(DLQ_STREAM, &fields) {
            warn!(event_id, error = %e, "Failed to mirror DLQ entry onto stream");
        }

        if !event_id.is_empty() {
            let _ = self.store.transition(
                event_id,
                EventStatus::Dlq,
                "DLQ",
                Some(json!({
                    "stage": stage.as_str(),
                    "reason_code": err.reason_code,
                })),
            );
        }

        metrics::increment_counter!(
            "lens_dlq_entries_total",
            "stage" => stage.as_str(),
            "reason_code" => err.reason_code.clone(),
        );
    }
}
