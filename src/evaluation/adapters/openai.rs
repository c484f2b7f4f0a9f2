//! OpenAI chat-completions adapter.

use super::{ChatMessage, ChatRequest, ChatResponse, ResponseFormat, JSON_SYSTEM_INSTRUCTION};
use crate::evaluation::adapter::{
    classify_http_status, classify_transport_error, parse_json_output, AdapterConfig,
    ModelAdapter, ModelResponse, ModelStatus,
};
use async_trait::async_trait;
use std::sync::OnceLock;
use std::time::Instant;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiAdapter {
    config: AdapterConfig,
    base_url: String,
    client: OnceLock<reqwest::Client>,
}

impl OpenAiAdapter {
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
        let body = ChatRequest {
            model: self.config.model_id.clone(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: JSON_SYSTEM_INSTRUCTION.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: prompt.to_string(),
                },
            ],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            response_format: Some(ResponseFormat {
                format_type: "json_object",
            }),
        };

        let response = match self
            .client()
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.config.api_key)
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

        let parsed: ChatResponse = match serde_json::from_str(&text) {
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
            .choices
            .first()
            .and_then(|c| c.message.as_ref())
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let tokens_in = parsed
            .usage
            .as_ref()
            .and_then(|u| u.prompt_tokens)
            .unwrap_or(0);
        let tokens_out = parsed
            .usage
            .as_ref()
            .and_then(|u| u.completion_tokens)
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
impl ModelAdapter for OpenAiAdapter {
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(api_key: &str) -> AdapterConfig {
        AdapterConfig {
            model_name: "chatgpt".into(),
            provider: "openai".into(),
            api_key: api_key.into(),
            model_id: "gpt-4o".into(),
            timeout: Duration::from_millis(200),
            max_tokens: 256,
            temperature: 0.1,
        }
    }

    #[tokio::test]
    async fn unconfigured_adapter_yields_invalid_config() {
        let adapter = OpenAiAdapter::new(config(""));
        let response = adapter.evaluate("prompt").await;
        assert_eq!(response.status, ModelStatus::InvalidConfig);
        assert_eq!(response.error_code.as_deref(), Some("not_configured"));
    }

    #[tokio::test]
    async fn unreachable_endpoint_yields_network_or_timeout() {
        let adapter =
            OpenAiAdapter::new(config("key")).with_base_url("http://127.0.0.1:1/v1");
        let response = adapter.evaluate("prompt").await;
        assert!(matches!(
            response.status,
            ModelStatus::NetworkError | ModelStatus::Timeout
        ));
    }
}
