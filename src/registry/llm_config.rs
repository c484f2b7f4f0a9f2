//! LLM configuration registry.
//!
//! In-memory map keyed by model_name with a TTL; reads serve the cache and
//! kick a refresh when expired (other readers serve stale until the first
//! refresh completes). Writes commit to the database then force a refresh so
//! a subsequent read reflects the write.

use crate::store::{EventStore, LlmConfigRow};
use anyhow::Result;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Predefined model-to-provider mappings (not operator-editable).
const MODEL_PROVIDERS: [(&str, &str); 4] = [
    ("chatgpt", "openai"),
    ("gemini", "google"),
    ("claude", "anthropic"),
    ("deepseek", "deepseek"),
];

const DEFAULT_MODEL_IDS: [(&str, &str); 4] = [
    ("chatgpt", "gpt-4o"),
    ("gemini", "gemini-1.5-pro"),
    ("claude", "claude-sonnet-4-20250514"),
    ("deepseek", "deepseek-chat"),
];

pub fn provider_for_model(model_name: &str) -> Option<&'static str> {
    MODEL_PROVIDERS
        .iter()
        .find(|(m, _)| *m == model_name)
        .map(|(_, p)| *p)
}

pub fn default_model_id(model_name: &str) -> Option<&'static str> {
    DEFAULT_MODEL_IDS
        .iter()
        .find(|(m, _)| *m == model_name)
        .map(|(_, id)| *id)
}

struct CacheState {
    configs: HashMap<String, LlmConfigRow>,
    refreshed_at: Option<Instant>,
}

pub struct LlmConfigRegistry {
    store: Arc<EventStore>,
    ttl: Duration,
    cache: RwLock<CacheState>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl LlmConfigRegistry {
    pub fn new(store: Arc<EventStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            cache: RwLock::new(CacheState {
                configs: HashMap::new(),
                refreshed_at: None,
            }),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn initialize(&self) {
        self.reload();
        debug!(
            configs = self.cache.read().configs.len(),
            "LLM config registry initialized"
        );
    }

    fn is_fresh(&self) -> bool {
        self.cache
            .read()
            .refreshed_at
            .map(|at| at.elapsed() < self.ttl)
            .unwrap_or(false)
    }

    fn reload(&self) {
        match self.store.list_llm_configs() {
            Ok(rows) => {
                let configs = rows
                    .into_iter()
                    .map(|row| (row.model_name.clone(), row))
                    .collect();
                let mut cache = self.cache.write();
                cache.configs = configs;
                cache.refreshed_at = Some(Instant::now());
            }
            // Keep serving the previous cache on a read failure.
            Err(e) => error!(error = %e, "LLM config cache refresh failed"),
        }
    }

    async fn ensure_fresh(&self) {
        if self.is_fresh() {
            return;
        }
        // First expired reader refreshes; concurrent readers serve stale.
        if let Ok(_guard) = self.refresh_lock.try_lock() {
            if !self.is_fresh() {
                self.reload();
            }
        }
    }

    async fn force_refresh(&self) {
        let _guard = self.refresh_lock.lock().await;
        self.reload();
    }

    /// Drop cache freshness; the next read reloads.
    pub fn invalidate(&self) {
        self.cache.write().refreshed_at = None;
    }

    /// Config for a model, only when enabled with a usable key.
    pub async fn get(&self, model_name: &str) -> Option<LlmConfigRow> {
        self.ensure_fresh().await;
        let cache = self.cache.read();
        cache
            .configs
            .get(model_name)
            .filter(|c| c.enabled && !c.api_key.is_empty())
            .cloned()
    }

    pub async fn enabled_models(&self) -> Vec<String> {
        self.ensure_fresh().await;
        let cache = self.cache.read();
        let mut models: Vec<String> = cache
            .configs
            .values()
            .filter(|c| c.enabled && !c.api_key.is_empty())
            .map(|c| c.model_name.clone())
            .collect();
        models.sort();
        models
    }

    pub async fn list_all(&self) -> Vec<LlmConfigRow> {
        self.ensure_fresh().await;
        let cache = self.cache.read();
        let mut rows: Vec<LlmConfigRow> = cache.configs.values().cloned().collect();
        rows.sort_by(|a, b| a.model_name.cmp(&b.model_name));
        rows
    }

    pub async fn upsert(&self, row: &LlmConfigRow) -> Result<()> {
        self.store.upsert_llm_config(row)?;
        self.force_refresh().await;
        Ok(())
    }

    pub async fn set_enabled(&self, model_name: &str, enabled: bool) -> Result<bool> {
        let changed = self.store.set_llm_enabled(model_name, enabled)?;
        if changed {
            self.force_refresh().await;
        }
        Ok(changed)
    }

    pub async fn set_validation(&self, model_name: &str, status: &str) -> Result<bool> {
        let changed = self.store.set_llm_validation(model_name, status)?;
        if changed {
            self.force_refresh().await;
        }
        Ok(changed)
    }

    pub async fn delete(&self, model_name: &str) -> Result<bool> {
        let changed = self.store.delete_llm_config(model_name)?;
        if changed {
            self.force_refresh().await;
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(ttl: Duration) -> (tempfile::TempDir, LlmConfigRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let store =
            Arc::new(EventStore::new(dir.path().join("s.db").to_str().unwrap()).unwrap());
        let registry = LlmConfigRegistry::new(store, ttl);
        registry.initialize();
        (dir, registry)
    }

    fn row(model: &str, enabled: bool, api_key: &str) -> LlmConfigRow {
        LlmConfigRow {
            model_name: model.into(),
            enabled,
            provider: provider_for_model(model).unwrap_or("openai").into(),
            api_key: api_key.into(),
            model_id: default_model_id(model).unwrap_or("gpt-4o").into(),
            timeout_ms: 30000,
            max_tokens: 1000,
            validation_status: None,
            last_validated_at: None,
        }
    }

    #[tokio::test]
    async fn write_through_is_visible_immediately() {
        let (_dir, registry) = registry(Duration::from_secs(300));
        assert!(registry.get("chatgpt").await.is_none());
        registry.upsert(&row("chatgpt", true, "sk-1")).await.unwrap();
        assert!(registry.get("chatgpt").await.is_some());

        registry.set_enabled("chatgpt", false).await.unwrap();
        assert!(registry.get("chatgpt").await.is_none());
        assert!(registry.enabled_models().await.is_empty());
    }

    #[tokio::test]
    async fn disabled_or_keyless_models_are_filtered() {
        let (_dir, registry) = registry(Duration::from_secs(300));
        registry.upsert(&row("chatgpt", true, "sk-1")).await.unwrap();
        registry.upsert(&row("gemini", false, "sk-2")).await.unwrap();
        registry.upsert(&row("claude", true, "")).await.unwrap();

        assert_eq!(registry.enabled_models().await, vec!["chatgpt"]);
        // list_all still exposes everything for the admin surface.
        assert_eq!(registry.list_all().await.len(), 3);
    }

    #[tokio::test]
    async fn model_provider_table() {
        assert_eq!(provider_for_model("chatgpt"), Some("openai"));
        assert_eq!(provider_for_model("claude"), Some("anthropic"));
        assert_eq!(provider_for_model("nope"), None);
        assert_eq!(default_model_id("deepseek"), Some("deepseek-chat"));
    }
}
