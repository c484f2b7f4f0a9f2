//! Versioned prompt registry.
//!
//! Same cache design as the LLM config registry. Prompts come in two kinds:
//! `core` (shared decision body) and `wrapper` (per-model framing that embeds
//! the core). On first initialization against an empty table the registry
//! seeds itself from a directory of markdown prompts named
//! `core_decision_<version>.md` / `<model>_wrapper_<version>.md`.

use crate::store::{EventStore, PromptRow};
use anyhow::{anyhow, Context, Result};
use parking_lot::RwLock;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

pub const CORE_PROMPT_NAME: &str = "core_decision";

#[derive(Debug, Clone)]
pub struct RenderedPrompt {
    pub text: String,
    /// `{model}_{wrapper_version}_core_{core_version}`
    pub version_id: String,
    /// SHA-256 over concatenated wrapper+core content.
    pub hash: String,
}

pub fn content_hash(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

struct CacheState {
    /// Active prompts keyed by `name:version`.
    prompts: HashMap<String, PromptRow>,
    refreshed_at: Option<Instant>,
}

pub struct PromptRegistry {
    store: Arc<EventStore>,
    ttl: Duration,
    prompts_dir: PathBuf,
    cache: RwLock<CacheState>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl PromptRegistry {
    pub fn new(store: Arc<EventStore>, ttl: Duration, prompts_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            ttl,
            prompts_dir: prompts_dir.into(),
            cache: RwLock::new(CacheState {
                prompts: HashMap::new(),
                refreshed_at: None,
            }),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Load the cache; seed from the prompt directory when the table is empty.
    pub async fn initialize(&self) -> Result<()> {
        self.reload();
        if self.store.count_prompts()? == 0 {
            self.seed_from_files()?;
            self.force_refresh().await;
        }
        info!(
            prompts = self.cache.read().prompts.len(),
            "Prompt registry initialized"
        );
        Ok(())
    }

    fn seed_from_files(&self) -> Result<()> {
        if !self.prompts_dir.exists() {
            warn!(dir = %self.prompts_dir.display(), "Prompts directory not found, nothing seeded");
            return Ok(());
        }
        let mut seeded = 0usize;
        for entry in std::fs::read_dir(&self.prompts_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let (name, version, prompt_type, model_name) =
                if let Some(version) = stem.strip_prefix("core_decision_") {
                    (CORE_PROMPT_NAME.to_string(), version.to_string(), "core", None)
                } else if let Some((model, version)) = stem.rsplit_once("_wrapper_") {
                    (
                        format!("{model}_wrapper"),
                        version.to_string(),
                        "wrapper",
                        Some(model.to_string()),
                    )
                } else {
                    continue; // not a prompt file we understand
                };

            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let description = format!("Seeded from {}", path.display());
            self.store.upsert_prompt(
                &name,
                &version,
                prompt_type,
                model_name.as_deref(),
                &content,
                &content_hash(&content),
                Some(description.as_str()),
            )?;
            seeded += 1;
        }
        info!(seeded, "Prompts seeded from files");
        Ok(())
    }

    fn reload(&self) {
        match self.store.list_prompts(true) {
            Ok(rows) => {
                let prompts = rows
                    .into_iter()
                    .map(|row| (format!("{}:{}", row.name, row.version), row))
                    .collect();
                let mut cache = self.cache.write();
                cache.prompts = prompts;
                cache.refreshed_at = Some(Instant::now());
            }
            Err(e) => error!(error = %e, "Prompt cache refresh failed"),
        }
    }

    fn is_fresh(&self) -> bool {
        self.cache
            .read()
            .refreshed_at
            .map(|at| at.elapsed() < self.ttl)
            .unwrap_or(false)
    }

    async fn ensure_fresh(&self) {
        if self.is_fresh() {
            return;
        }
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

    pub fn invalidate(&self) {
        self.cache.write().refreshed_at = None;
    }

    pub async fn get(&self, name: &str, version: &str) -> Option<PromptRow> {
        self.ensure_fresh().await;
        self.cache
            .read()
            .prompts
            .get(&format!("{name}:{version}"))
            .cloned()
    }

    /// Newest active prompt for a name.
    pub async fn active_latest(&self, name: &str) -> Option<PromptRow> {
        self.ensure_fresh().await;
        let cache = self.cache.read();
        cache
            .prompts
            .values()
            .filter(|p| p.name == name)
            .max_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.version.cmp(&b.version))
            })
            .cloned()
    }

    /// Compose the model's wrapper with the core: `{core_prompt}` in the
    /// wrapper is replaced by the core rendered against the enriched event
    /// and constraints. Deterministic for fixed inputs and versions.
    pub async fn render(
        &self,
        model_name: &str,
        enriched_event: &Value,
        constraints: &Value,
    ) -> Result<RenderedPrompt> {
        let wrapper = self
            .active_latest(&format!("{model_name}_wrapper"))
            .await
            .ok_or_else(|| anyhow!("No active wrapper prompt for model '{model_name}'"))?;
        let core = self
            .active_latest(CORE_PROMPT_NAME)
            .await
            .ok_or_else(|| anyhow!("No active core decision prompt"))?;

        let core_rendered = core
            .content
            .replace("{enriched_event}", &enriched_event.to_string())
            .replace("{constraints}", &constraints.to_string());
        let text = wrapper.content.replace("{core_prompt}", &core_rendered);

        let mut hasher = Sha256::new();
        hasher.update(wrapper.content.as_bytes());
        hasher.update(core.content.as_bytes());

        Ok(RenderedPrompt {
            text,
            version_id: format!("{model_name}_{}_core_{}", wrapper.version, core.version),
            hash: hex::encode(hasher.finalize()),
        })
    }

    // Admin CRUD, all write-through.

    #[allow(clippy::too_many_arguments)]
    pub async fn upsert(
        &self,
        name: &str,
        version: &str,
        prompt_type: &str,
        model_name: Option<&str>,
        content: &str,
        description: Option<&str>,
    ) -> Result<()> {
        self.store.upsert_prompt(
            name,
            version,
            prompt_type,
            model_name,
            content,
            &content_hash(content),
            description,
        )?;
        self.force_refresh().await;
        Ok(())
    }

    pub async fn set_active(&self, name: &str, version: &str, active: bool) -> Result<bool> {
        let changed = self.store.set_prompt_active(name, version, active)?;
        if changed {
            self.force_refresh().await;
        }
        Ok(changed)
    }

    pub async fn delete(&self, name: &str, version: &str) -> Result<bool> {
        let changed = self.store.delete_prompt(name, version)?;
        if changed {
            self.force_refresh().await;
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn registry_with_prompts() -> (tempfile::TempDir, PromptRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let prompts_dir = dir.path().join("prompts");
        std::fs::create_dir(&prompts_dir).unwrap();
        std::fs::write(
            prompts_dir.join("core_decision_v1.md"),
            "Evaluate this signal:\n{enriched_event}\nConstraints:\n{constraints}\n",
        )
        .unwrap();
        std::fs::write(
            prompts_dir.join("chatgpt_wrapper_v1.md"),
            "You are ChatGPT.\n{core_prompt}\nAnswer as JSON.",
        )
        .unwrap();
        let store =
            Arc::new(EventStore::new(dir.path().join("s.db").to_str().unwrap()).unwrap());
        let registry = PromptRegistry::new(store, Duration::from_secs(300), &prompts_dir);
        registry.initialize().await.unwrap();
        (dir, registry)
    }

    #[tokio::test]
    async fn seeds_from_files_on_empty_table() {
        let (_dir, registry) = registry_with_prompts().await;
        assert!(registry.get(CORE_PROMPT_NAME, "v1").await.is_some());
        let wrapper = registry.get("chatgpt_wrapper", "v1").await.unwrap();
        assert_eq!(wrapper.prompt_type, "wrapper");
        assert_eq!(wrapper.model_name.as_deref(), Some("chatgpt"));
    }

    #[tokio::test]
    async fn render_substitutes_and_versions() {
        let (_dir, registry) = registry_with_prompts().await;
        let event = json!({ "symbol": "BTC", "entry_price": 42000.5 });
        let constraints = json!({ "max_leverage": 10 });
        let rendered = registry
            .render("chatgpt", &event, &constraints)
            .await
            .unwrap();
        assert!(rendered.text.contains("\"symbol\":\"BTC\""));
        assert!(rendered.text.contains("\"max_leverage\":10"));
        assert!(rendered.text.starts_with("You are ChatGPT."));
        assert!(!rendered.text.contains("{core_prompt}"));
        assert_eq!(rendered.version_id, "chatgpt_v1_core_v1");
        assert_eq!(rendered.hash.len(), 64);
    }

    #[tokio::test]
    async fn rendering_is_deterministic() {
        let (_dir, registry) = registry_with_prompts().await;
        let event = json!({ "b": 2, "a": 1 });
        let constraints = json!({ "x": true });
        let first = registry.render("chatgpt", &event, &constraints).await.unwrap();
        let second = registry.render("chatgpt", &event, &constraints).await.unwrap();
        assert_eq!(first.text, second.text);
        assert_eq!(first.hash, second.hash);
        assert_eq!(first.version_id, second.version_id);
    }

    #[tokio::test]
    async fn unknown_model_fails_render() {
        let (_dir, registry) = registry_with_prompts().await;
        let err = registry
            .render("mistral", &json!({}), &json!({}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("mistral"));
    }

    #[tokio::test]
    async fn deactivated_prompt_leaves_cache() {
        let (_dir, registry) = registry_with_prompts().await;
        registry
            .set_active("chatgpt_wrapper", "v1", false)
            .await
            .unwrap();
        assert!(registry.get("chatgpt_wrapper", "v1").await.is_none());
        assert!(registry
            .render("chatgpt", &json!({}), &json!({}))
            .await
            .is_err());
    }
}
