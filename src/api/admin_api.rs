//! Operator endpoints for LLM configs and prompts.

use crate::error::ApiError;
use crate::evaluation::create_adapter;
use crate::registry::{default_model_id, provider_for_model};
use crate::state::AppState;
use crate::store::LlmConfigRow;
use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

/// API keys never leave the service unmasked.
fn mask_api_key(key: &str) -> String {
    if key.len() > 8 {
        format!("{}****", &key[..4])
    } else {
        "****".to_string()
    }
}

fn config_view(cfg: &LlmConfigRow) -> Value {
    json!({
        "model_name": cfg.model_name,
        "enabled": cfg.enabled,
        "provider": cfg.provider,
        "api_key": mask_api_key(&cfg.api_key),
        "model_id": cfg.model_id,
        "timeout_ms": cfg.timeout_ms,
        "max_tokens": cfg.max_tokens,
        "validation_status": cfg.validation_status,
        "last_validated_at": cfg.last_validated_at,
    })
}

pub async fn list_llm_configs(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let rows = state.llm_configs.list_all().await;
    let items: Vec<Value> = rows.iter().map(config_view).collect();
    Ok(Json(json!({ "items": items })))
}

#[derive(Debug, Deserialize)]
pub struct PutLlmConfigRequest {
    pub api_key: String,
    pub provider: Option<String>,
    pub model_id: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: i64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: i64,
}

fn default_true() -> bool {
    true
}
fn default_timeout_ms() -> i64 {
    30_000
}
fn default_max_tokens() -> i64 {
    1000
}

pub async fn put_llm_config(
    State(state): State<AppState>,
    Path(model): Path<String>,
    Json(request): Json<PutLlmConfigRequest>,
) -> Result<Json<Value>, ApiError> {
    if request.api_key.trim().is_empty() {
        return Err(ApiError::bad_request("api_key must not be empty"));
    }
    let provider = request
        .provider
        .or_else(|| provider_for_model(&model).map(String::from))
        .ok_or_else(|| {
            ApiError::bad_request(format!(
                "Unknown model '{model}': provider must be given explicitly"
            ))
        })?;
    let model_id = request
        .model_id
        .or_else(|| default_model_id(&model).map(String::from))
        .ok_or_else(|| {
            ApiError::bad_request(format!(
                "Unknown model '{model}': model_id must be given explicitly"
            ))
        })?;
    if request.timeout_ms <= 0 || request.max_tokens <= 0 {
        return Err(ApiError::bad_request(
            "timeout_ms and max_tokens must be positive",
        ));
    }

    let row = LlmConfigRow {
        model_name: model.clone(),
        enabled: request.enabled,
        provider,
        api_key: request.api_key,
        model_id,
        timeout_ms: request.timeout_ms,
        max_tokens: request.max_tokens,
        validation_status: None,
        last_validated_at: None,
    };
    // Unknown providers must fail now, not at evaluation time.
    create_adapter(&row).map_err(|e| ApiError::bad_request(format!("{e:#}")))?;

    state.llm_configs.upsert(&row).await?;
    info!(model = %model, "LLM config updated");
    Ok(Json(config_view(&row)))
}

#[derive(Debug, Deserialize)]
pub struct PatchLlmConfigRequest {
    pub api_key: Option<String>,
    pub model_id: Option<String>,
    pub enabled: Option<bool>,
    pub timeout_ms: Option<i64>,
    pub max_tokens: Option<i64>,
}

pub async fn patch_llm_config(
    State(state): State<AppState>,
    Path(model): Path<String>,
    Json(request): Json<PatchLlmConfigRequest>,
) -> Result<Json<Value>, ApiError> {
    let mut row = state
        .store
        .get_llm_config(&model)?
        .ok_or_else(|| ApiError::not_found("LLM config", &model))?;
    if let Some(api_key) = request.api_key {
        if api_key.trim().is_empty() {
            return Err(ApiError::bad_request("api_key must not be empty"));
        }
        row.api_key = api_key;
    }
    if let Some(model_id) = request.model_id {
        row.model_id = model_id;
    }
    if let Some(enabled) = request.enabled {
        row.enabled = enabled;
    }
    if let Some(timeout_ms) = request.timeout_ms {
        if timeout_ms <= 0 {
            return Err(ApiError::bad_request("timeout_ms must be positive"));
        }
        row.timeout_ms = timeout_ms;
    }
    if let Some(max_tokens) = request.max_tokens {
        if max_tokens <= 0 {
            return Err(ApiError::bad_request("max_tokens must be positive"));
        }
        row.max_tokens = max_tokens;
    }
    state.llm_configs.upsert(&row).await?;
    Ok(Json(config_view(&row)))
}

pub async fn delete_llm_config(
    State(state): State<AppState>,
    Path(model): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if !state.llm_configs.delete(&model).await? {
        return Err(ApiError::not_found("LLM config", &model));
    }
    Ok(Json(json!({ "model_name": model, "deleted": true })))
}

pub async fn enable_llm_config(
    State(state): State<AppState>,
    Path(model): Path<String>,
) -> Result<Json<Value>, ApiError> {
    set_enabled(&state, &model, true).await
}

pub async fn disable_llm_config(
    State(state): State<AppState>,
    Path(model): Path<String>,
) -> Result<Json<Value>, ApiError> {
    set_enabled(&state, &model, false).await
}

async fn set_enabled(state: &AppState, model: &str, enabled: bool) -> Result<Json<Value>, ApiError> {
    if !state.llm_configs.set_enabled(model, enabled).await? {
        return Err(ApiError::not_found("LLM config", model));
    }
    Ok(Json(json!({ "model_name": model, "enabled": enabled })))
}

/// Fire a minimal evaluation against the provider to validate credentials.
pub async fn test_llm_config(
    State(state): State<AppState>,
    Path(model): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let row = state
        .store
        .get_llm_config(&model)?
        .ok_or_else(|| ApiError::not_found("LLM config", &model))?;
    let adapter = create_adapter(&row).map_err(|e| ApiError::bad_request(format!("{e:#}")))?;
    let response = adapter
        .evaluate("Reply with exactly this JSON object: {\"status\": \"ok\"}")
        .await;
    let validation_status = if response.status.is_success() {
        "valid"
    } else {
        "invalid"
    };
    state
        .llm_configs
        .set_validation(&model, validation_status)
        .await?;
    Ok(Json(json!({
        "model_name": model,
        "validation_status": validation_status,
        "response_status": response.status.as_str(),
        "latency_ms": response.latency_ms,
        "error_message": response.error_message,
    })))
}

// ------------------------------------------------------------------ prompts

pub async fn list_prompts(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let rows = state.store.list_prompts(false)?;
    Ok(Json(json!({ "items": rows })))
}

pub async fn get_prompt(
    State(state): State<AppState>,
    Path((name, version)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let row = state
        .store
        .get_prompt(&name, &version)?
        .ok_or_else(|| ApiError::not_found("Prompt", &format!("{name}:{version}")))?;
    Ok(Json(serde_json::to_value(row).unwrap_or(Value::Null)))
}

#[derive(Debug, Deserialize)]
pub struct PutPromptRequest {
    pub prompt_type: String,
    pub content: String,
    pub model_name: Option<String>,
    pub description: Option<String>,
}

pub async fn put_prompt(
    State(state): State<AppState>,
    Path((name, version)): Path<(String, String)>,
    Json(request): Json<PutPromptRequest>,
) -> Result<Json<Value>, ApiError> {
    if !matches!(request.prompt_type.as_str(), "core" | "wrapper") {
        return Err(ApiError::bad_request("prompt_type must be core or wrapper"));
    }
    if request.content.trim().is_empty() {
        return Err(ApiError::bad_request("content must not be empty"));
    }
    if request.prompt_type == "wrapper" && request.model_name.is_none() {
        return Err(ApiError::bad_request("wrapper prompts require model_name"));
    }
    state
        .prompts
        .upsert(
            &name,
            &version,
            &request.prompt_type,
            request.model_name.as_deref(),
            &request.content,
            request.description.as_deref(),
        )
        .await?;
    info!(name = %name, version = %version, "Prompt updated");
    let row = state.store.get_prompt(&name, &version)?;
    Ok(Json(serde_json::to_value(row).unwrap_or(Value::Null)))
}

pub async fn delete_prompt(
    State(state): State<AppState>,
    Path((name, version)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    if !state.prompts.delete(&name, &version).await? {
        return Err(ApiError::not_found("Prompt", &format!("{name}:{version}")));
    }
    Ok(Json(json!({ "name": name, "version": version, "deleted": true })))
}

#[derive(Debug, Deserialize)]
pub struct ActivatePromptRequest {
    #[serde(default = "default_true")]
    pub active: bool,
}

pub async fn activate_prompt(
    State(state): State<AppState>,
    Path((name, version)): Path<(String, String)>,
    Json(request): Json<ActivatePromptRequest>,
) -> Result<Json<Value>, ApiError> {
    if !state
        .prompts
        .set_active(&name, &version, request.active)
        .await?
    {
        return Err(ApiError::not_found("Prompt", &format!("{name}:{version}")));
    }
    Ok(Json(json!({
        "name": name,
        "version": version,
        "is_active": request.active,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_keys_are_masked() {
        assert_eq!(mask_api_key("sk-1234567890"), "sk-1****");
        assert_eq!(mask_api_key("short"), "****");
        assert_eq!(mask_api_key(""), "****");
    }
}
