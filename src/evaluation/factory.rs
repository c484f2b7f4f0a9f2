//! Adapter construction and decision-output validation.
//!
//! Unknown providers fail here, at construction, never at call time. Output
//! validation collects every schema problem instead of short-circuiting so a
//! bad response is fully described in one decision row.

use super::adapter::{AdapterConfig, ModelAdapter};
use super::adapters::{AnthropicAdapter, DeepSeekAdapter, GoogleAdapter, OpenAiAdapter};
use crate::models::DecisionKind;
use crate::store::LlmConfigRow;
use anyhow::{bail, Result};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

const VALID_ENTRY_TYPES: [&str; 2] = ["market", "limit"];
const VALID_STOP_METHODS: [&str; 3] = ["fixed", "atr", "trailing"];

pub fn create_adapter(cfg: &LlmConfigRow) -> Result<Arc<dyn ModelAdapter>> {
    let adapter_config = AdapterConfig {
        model_name: cfg.model_name.clone(),
        provider: cfg.provider.clone(),
        api_key: cfg.api_key.clone(),
        model_id: cfg.model_id.clone(),
        timeout: Duration::from_millis(cfg.timeout_ms.max(1) as u64),
        max_tokens: cfg.max_tokens.max(1) as u32,
        temperature: 0.1,
    };
    let adapter: Arc<dyn ModelAdapter> = match cfg.provider.to_ascii_lowercase().as_str() {
        "openai" => Arc::new(OpenAiAdapter::new(adapter_config)),
        "google" => Arc::new(GoogleAdapter::new(adapter_config)),
        "anthropic" => Arc::new(AnthropicAdapter::new(adapter_config)),
        "deepseek" => Arc::new(DeepSeekAdapter::new(adapter_config)),
        other => bail!(
            "Unsupported provider: {other}. Supported: openai, google, anthropic, deepseek"
        ),
    };
    Ok(adapter)
}

/// Validate a parsed model output against the decision schema. Returns every
/// problem found.
pub fn validate_decision_output(output: &Value) -> (bool, Vec<String>) {
    let mut errors = Vec::new();
    let Some(obj) = output.as_object() else {
        return (false, vec!["Output must be a JSON object".to_string()]);
    };

    for field in ["decision", "confidence", "reasons"] {
        if !obj.contains_key(field) {
            errors.push(format!("Missing required field: {field}"));
        }
    }

    if let Some(decision) = obj.get("decision") {
        match decision.as_str() {
            Some(d) if DecisionKind::is_valid(d) => {}
            Some(d) => errors.push(format!(
                "Invalid decision '{d}'. Must be one of: {}",
                DecisionKind::ALL.join(", ")
            )),
            None => errors.push("decision must be a string".to_string()),
        }
    }

    if let Some(confidence) = obj.get("confidence") {
        match confidence.as_f64() {
            Some(c) if (0.0..=1.0).contains(&c) => {}
            Some(c) => errors.push(format!("confidence must be between 0 and 1, got {c}")),
            None => errors.push("confidence must be a number".to_string()),
        }
    }

    if let Some(reasons) = obj.get("reasons") {
        match reasons.as_array() {
            Some(arr) if arr.is_empty() => {
                errors.push("reasons must have at least one element".to_string())
            }
            Some(arr) if !arr.iter().all(|r| r.is_string()) => {
                errors.push("All reasons must be strings".to_string())
            }
            Some(_) => {}
            None => errors.push("reasons must be an array".to_string()),
        }
    }

    if let Some(entry_plan) = obj.get("entry_plan").filter(|v| !v.is_null()) {
        match entry_plan.as_object() {
            Some(plan) => {
                if let Some(entry_type) = plan.get("type").and_then(|v| v.as_str()) {
                    if !VALID_ENTRY_TYPES.contains(&entry_type) {
                        errors.push(format!(
                            "Invalid entry_plan.type '{entry_type}'. Must be one of: {}",
                            VALID_ENTRY_TYPES.join(", ")
                        ));
                    }
                }
                if let Some(offset) = plan.get("offset_bps").filter(|v| !v.is_null()) {
                    if offset.as_f64().is_none() {
                        errors.push("entry_plan.offset_bps must be a number".to_string());
                    }
                }
            }
            None => errors.push("entry_plan must be an object".to_string()),
        }
    }

    if let Some(risk_plan) = obj.get("risk_plan").filter(|v| !v.is_null()) {
        match risk_plan.as_object() {
            Some(plan) => {
                if let Some(method) = plan.get("stop_method").and_then(|v| v.as_str()) {
                    if !VALID_STOP_METHODS.contains(&method) {
                        errors.push(format!(
                            "Invalid risk_plan.stop_method '{method}'. Must be one of: {}",
                            VALID_STOP_METHODS.join(", ")
                        ));
                    }
                }
                if let Some(atr_mult) = plan.get("atr_multiple").filter(|v| !v.is_null()) {
                    match atr_mult.as_f64() {
                        Some(m) if (0.5..=10.0).contains(&m) => {}
                        Some(m) => errors.push(format!(
                            "risk_plan.atr_multiple must be between 0.5 and 10, got {m}"
                        )),
                        None => {
                            errors.push("risk_plan.atr_multiple must be a number".to_string())
                        }
                    }
                }
                if let Some(trail) = plan.get("trail_pct").filter(|v| !v.is_null()) {
                    match trail.as_f64() {
                        Some(t) if (0.0..=100.0).contains(&t) => {}
                        Some(t) => errors.push(format!(
                            "risk_plan.trail_pct must be between 0 and 100, got {t}"
                        )),
                        None => errors.push("risk_plan.trail_pct must be a number".to_string()),
                    }
                }
            }
            None => errors.push("risk_plan must be an object".to_string()),
        }
    }

    if let Some(size_pct) = obj.get("size_pct").filter(|v| !v.is_null()) {
        match size_pct.as_f64() {
            Some(s) if (0.0..=100.0).contains(&s) => {}
            Some(s) => errors.push(format!("size_pct must be between 0 and 100, got {s}")),
            None => errors.push("size_pct must be a number".to_string()),
        }
    }

    (errors.is_empty(), errors)
}

/// Normalize model output: defaults for missing optional fields, confidence
/// clamped to [0,1], size_pct clamped to [0,100]. Idempotent.
pub fn normalize_decision_output(output: &Value) -> Value {
    let get = |k: &str| output.get(k).cloned();
    let confidence = get("confidence")
        .and_then(|v| v.as_f64())
        .unwrap_or(0.5)
        .clamp(0.0, 1.0);
    let size_pct = get("size_pct")
        .filter(|v| !v.is_null())
        .and_then(|v| v.as_f64())
        .map(|s| s.clamp(0.0, 100.0));

    json!({
        "decision": get("decision").and_then(|v| v.as_str().map(String::from)).unwrap_or_else(|| "IGNORE".to_string()),
        "confidence": confidence,
        "entry_plan": get("entry_plan").unwrap_or(Value::Null),
        "risk_plan": get("risk_plan").unwrap_or(Value::Null),
        "size_pct": size_pct,
        "reasons": get("reasons").filter(|v| v.is_array()).unwrap_or_else(|| json!(["unknown"])),
    })
}

/// Fallback decision written when a model produces no valid output, so the
/// audit trail stays complete.
pub fn fallback_decision(model_name: &str) -> Value {
    json!({
        "decision": "IGNORE",
        "confidence": 0.0,
        "entry_plan": Value::Null,
        "risk_plan": Value::Null,
        "size_pct": 0,
        "reasons": [format!("model_error_{model_name}"), "fallback_decision"],
    })
}
