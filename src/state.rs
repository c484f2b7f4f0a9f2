//! Application state shared across handlers and workers. Hot singletons
//! (registries, queue producer, hub) are explicitly owned here and passed
//! through context; there are no process-global mutables.

use crate::auth::Authenticator;
use crate::config::Config;
use crate::dlq::DlqManager;
use crate::publisher::SubscriptionHub;
use crate::queue::{QueueProducer, StreamStore};
use crate::registry::{LlmConfigRegistry, PromptRegistry};
use crate::store::EventStore;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<EventStore>,
    pub streams: Arc<StreamStore>,
    pub producer: QueueProducer,
    pub hub: Arc<SubscriptionHub>,
    pub llm_configs: Arc<LlmConfigRegistry>,
    pub prompts: Arc<PromptRegistry>,
    pub auth: Arc<Authenticator>,
    pub dlq: Arc<DlqManager>,
    pub metrics_handle: PrometheusHandle,
}
