//! Uniform async evaluation contract over heterogeneous AI providers.
//!
//! No errors escape `evaluate`: every provider fault, timeout, rate limit,
//! transport failure or parse problem becomes a typed status in the returned
//! response, so the fan-out collector never needs per-future error handling.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// Evaluation result status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelStatus {
    Success,
    Timeout,
    RateLimited,
    ApiError,
    SchemaError,
    NetworkError,
    InvalidConfig,
}

impl ModelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Timeout => "TIMEOUT",
            Self::RateLimited => "RATE_LIMITED",
            Self::ApiError => "API_ERROR",
            Self::SchemaError => "SCHEMA_ERROR",
            Self::NetworkError => "NETWORK_ERROR",
            Self::InvalidConfig => "INVALID_CONFIG",
        }
    }

    /// Status string persisted on decision rows.
    pub fn db_status(&self) -> &'static str {
        match self {
            Self::Success => "ok",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::ApiError => "api_error",
            Self::SchemaError => "schema_error",
            Self::NetworkError => "network_error",
            Self::InvalidConfig => "invalid_config",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Response from one model evaluation, success or failure.
#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub model_name: String,
    pub model_version: String,
    pub status: ModelStatus,
    pub latency_ms: i64,
    pub raw_text: Option<String>,
    pub parsed: Option<Value>,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl ModelResponse {
    pub fn success(
        model_name: &str,
        model_version: &str,
        parsed: Value,
        raw_text: String,
        latency_ms: i64,
        tokens_in: i64,
        tokens_out: i64,
    ) -> Self {
        Self {
            model_name: model_name.to_string(),
            model_version: model_version.to_string(),
            status: ModelStatus::Success,
            latency_ms,
            raw_text: Some(raw_text),
            parsed: Some(parsed),
            tokens_in,
            tokens_out,
            error_code: None,
            error_message: None,
        }
    }

    pub fn failure(
        model_name: &str,
        model_version: &str,
        status: ModelStatus,
        error_code: &str,
        error_message: impl Into<String>,
        latency_ms: i64,
        raw_text: Option<String>,
    ) -> Self {
        Self {
            model_name: model_name.to_string(),
            model_version: model_version.to_string(),
            status,
            latency_ms,
            raw_text,
            parsed: None,
            tokens_in: 0,
            tokens_out: 0,
            error_code: Some(error_code.to_string()),
            error_message: Some(error_message.into()),
        }
    }
}

/// Per-model configuration handed to an adapter at construction.
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub model_name: String,
    pub provider: String,
    pub api_key: String,
    pub model_id: String,
    pub timeout: Duration,
    pub max_tokens: u32,
    pub temperature: f64,
}

impl AdapterConfig {
    pub fn is_configured(&self) -> bool {
        !self.api_key.is_empty() && !self.model_id.is_empty()
    }
}

/// Capability contract every provider adapter implements. Adapters are safe
/// for concurrent use; clients are lazily initialized and reused.
#[async_trait]
pub trait ModelAdapter: Send + Sync {
    fn model_name(&self) -> &str;
    fn model_version(&self) -> &str;
    fn is_configured(&self) -> bool;

    /// Evaluate a rendered prompt. Never returns an error; failures are
    /// statuses in the response.
    async fn evaluate(&self, prompt: &str) -> ModelResponse;
}

/// Strip common fenced-code wrappers before JSON parsing.
pub(crate) fn strip_code_fences(text: &str) -> &str {
    let mut t = text.trim();
    if let Some(rest) = t.strip_prefix("```json") {
        t = rest;
    } else if let Some(rest) = t.strip_prefix("```") {
        t = rest;
    }
    if let Some(rest) = t.strip_suffix("```") {
        t = rest;
    }
    t.trim()
}

/// Parse a model's text output as JSON, tolerating markdown fences.
pub(crate) fn parse_json_output(text: &str) -> Option<Value> {
    let cleaned = strip_code_fences(text);
    if cleaned.is_empty() {
        return None;
    }
    serde_json::from_str(cleaned).ok()
}

/// Map a reqwest failure onto a typed status.
pub(crate) fn classify_transport_error(err: &reqwest::Error) -> (ModelStatus, &'static str) {
    if err.is_timeout() {
        (ModelStatus::Timeout, "timeout")
    } else if err.is_connect() {
        (ModelStatus::NetworkError, "connect_error")
    } else {
        (ModelStatus::NetworkError, "transport_error")
    }
}

/// Map an HTTP status onto a typed status.
pub(crate) fn classify_http_status(status: u16) -> (ModelStatus, &'static str) {
    match status {
        429 => (ModelStatus::RateLimited, "rate_limited"),
        401 | 403 => (ModelStatus::InvalidConfig, "auth_error"),
        _ => (ModelStatus::ApiError, "api_error"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fences_are_stripped() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n{}\n```"), "{}");
        assert_eq!(strip_code_fences("{\"a\":1}"), "{\"a\":1}");
    }

    #[test]
    fn fenced_json_parses() {
        let parsed = parse_json_output("```json\n{\"decision\": \"HOLD\"}\n```").unwrap();
        assert_eq!(parsed, json!({ "decision": "HOLD" }));
        assert!(parse_json_output("not json").is_none());
        assert!(parse_json_output("").is_none());
    }

    #[test]
    fn http_status_classification() {
        assert_eq!(classify_http_status(429).0, ModelStatus::RateLimited);
        assert_eq!(classify_http_status(401).0, ModelStatus::InvalidConfig);
        assert_eq!(classify_http_status(500).0, ModelStatus::ApiError);
    }

    #[test]
    fn status_strings_roundtrip_to_db_values() {
        assert_eq!(ModelStatus::Success.db_status(), "ok");
        assert_eq!(ModelStatus::Timeout.db_status(), "timeout");
        assert_eq!(ModelStatus::RateLimited.db_status(), "rate_limited");
        assert_eq!(ModelStatus::SchemaError.db_status(), "schema_error");
    }
}
