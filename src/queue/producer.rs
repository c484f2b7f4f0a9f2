//! Queue producer for the pipeline streams.

use super::StreamStore;
use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

pub const PENDING_STREAM: &str = "signals:pending";
pub const ENRICHED_STREAM: &str = "signals:enriched";
pub const DLQ_STREAM: &str = "dlq";

/// Producer for enqueueing signals onto the durable streams. Producers never
/// block on consumers; the stream is the buffer.
#[derive(Clone)]
pub struct QueueProducer {
    streams: Arc<StreamStore>,
}

impl QueueProducer {
    pub fn new(streams: Arc<StreamStore>) -> Self {
        Self { streams }
    }

    fn message(event_id: &str, payload: &Value, retry_count: u32) -> HashMap<String, String> {
        let mut fields = HashMap::new();
        fields.insert("event_id".to_string(), event_id.to_string());
        fields.insert("payload".to_string(), payload.to_string());
        fields.insert("retry_count".to_string(), retry_count.to_string());
        fields.insert("enqueued_at".to_string(), Utc::now().to_rfc3339());
        fields
    }

    /// Enqueue a raw signal for enrichment.
    pub fn enqueue_signal(&self, event_id: &str, payload: &Value) -> Result<i64> {
        self.streams
            .append(PENDING_STREAM, &Self::message(event_id, payload, 0))
    }

    /// Enqueue an enriched payload for AI evaluation.
    pub fn enqueue_enriched(&self, event_id: &str, payload: &Value) -> Result<i64> {
        self.streams
            .append(ENRICHED_STREAM, &Self::message(event_id, payload, 0))
    }

    /// Re-enqueue a message onto its source stream with a bumped retry count.
    pub fn requeue(
        &self,
        stream: &str,
        event_id: &str,
        payload: &Value,
        retry_count: u32,
    ) -> Result<i64> {
        self.streams
            .append(stream, &Self::message(event_id, payload, retry_count))
    }

    pub fn pending_depth(&self) -> Result<i64> {
        self.streams.len(PENDING_STREAM)
    }

    pub fn enriched_depth(&self) -> Result<i64> {
        self.streams.len(ENRICHED_STREAM)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn enqueue_sets_message_fields() {
        let dir = tempfile::tempdir().unwrap();
        let streams = Arc::new(
            StreamStore::new(dir.path().join("q.db").to_str().unwrap(), 60).unwrap(),
        );
        let producer = QueueProducer::new(streams.clone());
        producer
            .enqueue_signal("e1", &json!({ "symbol": "BTC" }))
            .unwrap();
        assert_eq!(producer.pending_depth().unwrap(), 1);
        assert_eq!(producer.enriched_depth().unwrap(), 0);
    }
}
