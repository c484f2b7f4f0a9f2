//! Anthropic messages-API adapter. No native JSON mode; the system
//! instruction enforces JSON-only output and fences are stripped on parse.

use super::JSON_SYSTEM_INSTRUCTION;
use crate::evaluation::adapter::{
    classify_http_status, classify_transport_error, parse_json_output, AdapterConfig,
    ModelAdapter, ModelResponse, ModelStatus,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::OnceLock;
use std::time::Instant;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: Option<i64>,
    #[serde(default)]
    output_tokens: Option<i64>,
}

pub struct AnthropicAdapter {
    config: AdapterConfig,
    base_url: String,
    client: OnceLock<reqwest::Client>,
}

impl AnthropicAdapter {
    pub fn new(config: AdapterConfig) -> Self {
        Self {
            config,
            base_url: DEFAULT_BASE_URL.to_string(),
            client: OnceLock::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn client(&self) -> &reqwest::Client {
        self.client.get_or_init(reqwest::Client::new)
    }

    async fn call(&self, prompt: &str, started: Instant) -> ModelResponse {
        let name = &self.config.model_name;
        let version = &self.config.model_id;
        let body = json!({
            "model": self.config.model_id,
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
            "system": JSON_SYSTEM_INSTRUCTION,
            "messages": [{ "role": "user", "content": prompt }],
        });

        let response = match self
            .client()
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                let (status, code) = classify_transport_error(&e);
                return ModelResponse::failure(
                    name,
                    version,
                    status,
                    code,
                    e.to_string(),
                    started.elapsed().as_millis() as i64,
                    None,
                );
            }
        };

        let http_status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        let latency_ms = started.elapsed().as_millis() as i64;

        if http_status >= 400 {
            let (status, code) = classify_http_status(http_status);
            let snippet: String = text.chars().take(500).collect();
            return ModelResponse::failure(
                name,
                version,
                status,
                code,
                format!("HTTP {http_status}"),
                latency_ms,
                Some(snippet),
            );
        }

        let parsed: MessagesResponse = match serde_json::from_str(&text) {
            Ok(p) => p,
            Err(e) => {
                return ModelResponse::failure(
                    name,
                    version,
                    ModelStatus::SchemaError,
                    "response_decode",
                    e.to_string(),
                    latency_ms,
                    Some(text),
                );
            }
        };
        let content = parsed
            .content
            .iter()
            .filter(|b| b.block_type == "text")
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join("");
        let tokens_in = parsed
            .usage
            .as_ref()
            .and_then(|u| u.input_tokens)
            .unwrap_or(0);
        let tokens_out = parsed
            .usage
            .as_ref()
            .and_then(|u| u.output_tokens)
            .unwrap_or(0);

        match parse_json_output(&content) {
            Some(decision) => ModelResponse::success(
                name,
                version,
                decision,
                content,
                latency_ms,
                tokens_in,
                tokens_out,
            ),
            None => ModelResponse::failure(
                name,
                version,
                ModelStatus::SchemaError,
                "invalid_json",
                "Model output was not valid JSON",
                latency_ms,
                Some(content),
            ),
        }
    }
}

#[async_trait]
impl ModelAdapter for AnthropicAdapter {
    fn model_name(&self) -> &str {
        &self.config.model_name
    }

    fn model_version(&self) -> &str {
        &self.config.model_id
    }

    fn is_configured(&self) -> bool {
        self.config.is_configured()
    }

    async fn evaluate(&self, prompt: &str) -> ModelResponse {
        let started = Instant::now();
        if !self.is_configured() {
            return ModelResponse::failure(
                &self.config.model_name,
                &self.config.model_id,
                ModelStatus::InvalidConfig,
                "not_configured",
                "Missing api_key or model_id",
                0,
                None,
            );
        }
        match tokio::time::timeout(self.config.timeout, self.call(prompt, started)).await {
            Ok(response) => response,
            Err(_) => ModelResponse::failure(
                &self.config.model_name,
                &self.config.model_id,
                ModelStatus::Timeout,
                "timeout",
                format!("Evaluation exceeded {}ms", self.config.timeout.as_millis()),
                started.elapsed().as_millis() as i64,
                None,
            ),
        }
    }
}
