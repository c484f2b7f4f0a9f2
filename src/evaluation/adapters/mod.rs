//! Provider adapters. Provider-specific request/response shapes stay inside
//! each adapter; the chat-completions wire format is shared by the providers
//! that speak it (OpenAI, DeepSeek).

mod anthropic;
mod deepseek;
mod google;
mod openai;

pub use anthropic::AnthropicAdapter;
pub use deepseek::DeepSeekAdapter;
pub use google::GoogleAdapter;
pub use openai::OpenAiAdapter;

use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub(crate) struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f64,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct ResponseFormat {
    #[serde(rename = "type")]
    pub format_type: &'static str,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatResponse {
    #[serde(default)]
    pub choices: Vec<ChatChoice>,
    #[serde(default)]
    pub usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatChoice {
    pub message: Option<ChatMessageOut>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatMessageOut {
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatUsage {
    #[serde(default)]
    pub prompt_tokens: Option<i64>,
    #[serde(default)]
    pub completion_tokens: Option<i64>,
}

/// System instruction used where the provider has no native JSON mode, and as
/// a belt with it where it does.
pub(crate) const JSON_SYSTEM_INSTRUCTION: &str =
    "You are a trading-signal evaluator. Respond with a single JSON object only, \
     no prose and no markdown fences.";
