//! AI evaluation: adapter contract, provider adapters, output validation and
//! the parallel fan-out worker.

mod adapter;
mod adapters;
mod factory;
mod worker;

pub use adapter::{AdapterConfig, ModelAdapter, ModelResponse, ModelStatus};
pub use factory::{
    create_adapter, fallback_decision, normalize_decision_output, validate_decision_output,
};
pub use worker::EvaluationWorker;
