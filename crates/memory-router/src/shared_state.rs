//! Application state shared by every HTTP handler.
//!
//! Everything lives behind `Arc`, so cloning the state per request is cheap
//! and every handler sees the same store, registries, and reaper.

use std::sync::Arc;
use tracing::info;

use crate::{
    config::{ClassifierKind, Config},
    memory::{ExpiryEngine, MemoryStore},
    router::{
        ClassificationBackend, ContextSource, IntentRouter, KeywordBackend, OllamaBackend,
        PromptRegistry, SchemaRegistry,
    },
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<MemoryStore>,
    pub schemas: Arc<SchemaRegistry>,
    pub prompts: Arc<PromptRegistry>,
    pub router: Arc<IntentRouter>,
    pub engine: Arc<ExpiryEngine>,
}

impl AppState {
    /// Wire the registries, router, and reaper around `store`. The reaper is
    /// created stopped.
    pub fn new(config: Config, store: Arc<MemoryStore>) -> Self {
        let schemas = Arc::new(SchemaRegistry::new(Arc::clone(&store), config.schema_limits()));
        let prompts = Arc::new(PromptRegistry::new(Arc::clone(&store)));

        let backend: Arc<dyn ClassificationBackend> = match config.classifier_backend {
            ClassifierKind::Keyword => Arc::new(KeywordBackend::new()),
            ClassifierKind::Ollama => Arc::new(OllamaBackend::new(
                config.ollama_base_url.clone(),
                config.router_model.clone(),
                config.request_timeout(),
            )),
        };
        let router = IntentRouter::new(
            Arc::clone(&schemas),
            Arc::clone(&store) as Arc<dyn ContextSource>,
            backend,
        )
        .with_context_limits(config.context_timeout(), config.context_messages);
        info!("Intent router using the {} backend", router.backend_name());

        let engine = Arc::new(ExpiryEngine::new(Arc::clone(&store), config.sweep_interval()));

        Self {
            config: Arc::new(config),
            store,
            schemas,
            prompts,
            router: Arc::new(router),
            engine,
        }
    }
}
