//! Durable stream-based queue between gateway and workers.

mod consumer;
mod producer;
mod stream_store;

pub use consumer::{ConsumerLoop, ProcessError, RetryPolicy, StreamProcessor};
pub use producer::{QueueProducer, DLQ_STREAM, ENRICHED_STREAM, PENDING_STREAM};
pub use stream_store::{StreamEntry, StreamStore};
