//! Intent routing: resolve a schema, gather bounded conversation context,
//! and hand both to a classification backend.

use crate::error::{MemoryError, MemoryResult};
use crate::memory::MemoryStore;
use crate::memory_db::{Message, RouterSchema};
use crate::metrics;
use crate::router::registry::SchemaRegistry;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Class reported when nothing in the schema matches.
pub const UNCLASSIFIED: &str = "unclassified";

pub const DEFAULT_CONTEXT_TIMEOUT: Duration = Duration::from_millis(250);
pub const DEFAULT_CONTEXT_MESSAGES: usize = 5;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteRequest {
    pub query: String,
    #[serde(default)]
    pub schema_key: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

impl RouteRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }
}

/// How conversation context figured into a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextStatus {
    /// Recent messages were fetched and offered to the backend.
    Used,
    /// No conversation given, or it had no messages.
    None,
    TimedOut,
    Unavailable,
}

impl ContextStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextStatus::Used => "used",
            ContextStatus::None => "none",
            ContextStatus::TimedOut => "timed_out",
            ContextStatus::Unavailable => "unavailable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassScore {
    pub class: String,
    pub score: f64,
}

/// Backend verdict. `class: None` means nothing matched.
#[derive(Debug, Clone, Default)]
pub struct Classification {
    pub class: Option<String>,
    pub arguments: Option<Map<String, Value>>,
    pub scores: Vec<ClassScore>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteMetadata {
    pub context: ContextStatus,
    pub context_messages: usize,
    pub backend: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteResult {
    pub schema_key: String,
    pub selected_class: String,
    pub arguments: Option<Map<String, Value>>,
    pub scores: Vec<ClassScore>,
    pub metadata: RouteMetadata,
}

impl RouteResult {
    pub fn is_unclassified(&self) -> bool {
        self.selected_class == UNCLASSIFIED
    }
}

/// Pluggable classification mechanism.
#[async_trait]
pub trait ClassificationBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Pick a class from `schema` for `query`. `context` holds recent
    /// conversation messages, oldest first, and may be empty.
    async fn classify(
        &self,
        schema: &RouterSchema,
        query: &str,
        context: &[Message],
    ) -> MemoryResult<Classification>;
}

/// Read-only view of recent conversation messages.
#[async_trait]
pub trait ContextSource: Send + Sync {
    async fn recent_messages(&self, conversation_id: &str, n: usize) -> MemoryResult<Vec<Message>>;
}

#[async_trait]
impl ContextSource for MemoryStore {
    async fn recent_messages(&self, conversation_id: &str, n: usize) -> MemoryResult<Vec<Message>> {
        MemoryStore::recent_messages(self, conversation_id, n).await
    }
}

pub struct IntentRouter {
    registry: Arc<SchemaRegistry>,
    context: Arc<dyn ContextSource>,
    backend: Arc<dyn ClassificationBackend>,
    context_timeout: Duration,
    context_messages: usize,
}

impl IntentRouter {
    pub fn new(
        registry: Arc<SchemaRegistry>,
        context: Arc<dyn ContextSource>,
        backend: Arc<dyn ClassificationBackend>,
    ) -> Self {
        Self {
            registry,
            context,
            backend,
            context_timeout: DEFAULT_CONTEXT_TIMEOUT,
            context_messages: DEFAULT_CONTEXT_MESSAGES,
        }
    }

    pub fn with_context_limits(mut self, timeout: Duration, messages: usize) -> Self {
        self.context_timeout = timeout;
        self.context_messages = messages;
        self
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub async fn route(&self, request: RouteRequest) -> MemoryResult<RouteResult> {
        let query = request.query.trim();
        if query.is_empty() {
            return Err(MemoryError::validation("query must not be empty"));
        }
        let schema = self.registry.resolve(request.schema_key.as_deref()).await?;
        if schema.classes.is_empty() {
            return Err(MemoryError::validation(format!(
                "router schema {} declares no classes",
                schema.key
            )));
        }

        let (context, status) = self.fetch_context(request.conversation_id.as_deref()).await;
        let classification = self.backend.classify(&schema, query, &context).await?;

        let selected_class = match classification.class {
            Some(class) if schema.classes.iter().any(|c| c.name == class) => class,
            Some(class) => {
                warn!("Backend {} chose undeclared class {}", self.backend.name(), class);
                UNCLASSIFIED.to_string()
            }
            None => UNCLASSIFIED.to_string(),
        };
        let arguments = if selected_class == UNCLASSIFIED {
            None
        } else {
            classification.arguments.filter(|args| !args.is_empty())
        };
        metrics::inc_route(&selected_class);
        debug!("Routed query to {} via schema {}", selected_class, schema.key);

        Ok(RouteResult {
            schema_key: schema.key,
            selected_class,
            arguments,
            scores: classification.scores,
            metadata: RouteMetadata {
                context: status,
                context_messages: context.len(),
                backend: self.backend.name().to_string(),
            },
        })
    }

    /// Bounded context read. Failures degrade to an empty context.
    async fn fetch_context(&self, conversation_id: Option<&str>) -> (Vec<Message>, ContextStatus) {
        let conversation_id = match conversation_id {
            Some(id) if self.context_messages > 0 => id,
            _ => return (Vec::new(), ContextStatus::None),
        };
        let fetch = self.context.recent_messages(conversation_id, self.context_messages);
        let (messages, status) = match tokio::time::timeout(self.context_timeout, fetch).await {
            Ok(Ok(messages)) if messages.is_empty() => (messages, ContextStatus::None),
            Ok(Ok(messages)) => (messages, ContextStatus::Used),
            Ok(Err(e)) => {
                warn!("Context for {} unavailable: {}", conversation_id, e);
                (Vec::new(), ContextStatus::Unavailable)
            }
            Err(_) => {
                warn!(
                    "Context for {} timed out after {:?}; routing without it",
                    conversation_id, self.context_timeout
                );
                (Vec::new(), ContextStatus::TimedOut)
            }
        };
        if matches!(status, ContextStatus::TimedOut | ContextStatus::Unavailable) {
            metrics::inc_context_degraded(status.as_str());
        }
        (messages, status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_db::{ExpectedRoute, NewMessage, RouterClass, RouterExample, SchemaDraft};
    use crate::router::keyword::KeywordBackend;
    use crate::router::registry::SchemaLimits;

    struct SlowContext;

    #[async_trait]
    impl ContextSource for SlowContext {
        async fn recent_messages(&self, _: &str, _: usize) -> MemoryResult<Vec<Message>> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Vec::new())
        }
    }

    struct FailingContext;

    #[async_trait]
    impl ContextSource for FailingContext {
        async fn recent_messages(&self, _: &str, _: usize) -> MemoryResult<Vec<Message>> {
            Err(MemoryError::storage("disk unplugged"))
        }
    }

    struct FixedBackend(&'static str);

    #[async_trait]
    impl ClassificationBackend for FixedBackend {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn classify(&self, _: &RouterSchema, _: &str, _: &[Message]) -> MemoryResult<Classification> {
            Ok(Classification {
                class: Some(self.0.to_string()),
                arguments: Some(Map::new()),
                scores: Vec::new(),
            })
        }
    }

    fn triage() -> SchemaDraft {
        let example = |query: &str, class: &str| RouterExample {
            query: query.to_string(),
            expected: ExpectedRoute {
                class: class.to_string(),
                arguments: Map::new(),
            },
        };
        SchemaDraft {
            key: "triage".into(),
            classes: vec![
                RouterClass {
                    name: "urgent".into(),
                    description: "Outages and production incidents".into(),
                },
                RouterClass {
                    name: "normal".into(),
                    description: "Routine questions".into(),
                },
            ],
            examples: vec![
                example("the server is down", "urgent"),
                example("how do I change my password", "normal"),
            ],
            ..Default::default()
        }
    }

    async fn setup() -> (Arc<MemoryStore>, Arc<SchemaRegistry>) {
        let store = Arc::new(MemoryStore::in_memory().unwrap());
        let registry = Arc::new(SchemaRegistry::new(Arc::clone(&store), SchemaLimits::default()));
        registry.create_or_update(triage()).await.unwrap();
        (store, registry)
    }

    fn keyword_router(store: &Arc<MemoryStore>, registry: &Arc<SchemaRegistry>) -> IntentRouter {
        IntentRouter::new(
            Arc::clone(registry),
            Arc::clone(store) as Arc<dyn ContextSource>,
            Arc::new(KeywordBackend::new()),
        )
    }

    #[tokio::test]
    async fn test_triage_scenario() {
        let (store, registry) = setup().await;
        let router = keyword_router(&store, &registry);

        assert!(router.route(RouteRequest::new("server is down")).await.unwrap_err().is_not_found());

        registry.activate("triage").await.unwrap();
        let result = router.route(RouteRequest::new("server is down")).await.unwrap();
        assert_eq!(result.schema_key, "triage");
        assert_eq!(result.selected_class, "urgent");
        assert_eq!(result.metadata.context, ContextStatus::None);

        assert!(matches!(registry.delete("triage").await, Err(MemoryError::Conflict(_))));
        let mut other = triage();
        other.key = "fallback".into();
        registry.create_or_update(other).await.unwrap();
        registry.activate("fallback").await.unwrap();
        registry.delete("triage").await.unwrap();
    }

    #[tokio::test]
    async fn test_routing_is_deterministic() {
        let (store, registry) = setup().await;
        let router = keyword_router(&store, &registry);
        let mut request = RouteRequest::new("my password stopped working");
        request.schema_key = Some("triage".into());
        let first = router.route(request.clone()).await.unwrap();
        for _ in 0..5 {
            let again = router.route(request.clone()).await.unwrap();
            assert_eq!(again.selected_class, first.selected_class);
            assert_eq!(again.scores, first.scores);
        }
        assert_eq!(first.selected_class, "normal");
    }

    #[tokio::test]
    async fn test_empty_query_and_empty_schema_are_invalid() {
        let (store, registry) = setup().await;
        let router = keyword_router(&store, &registry);
        let mut request = RouteRequest::new("   ");
        request.schema_key = Some("triage".into());
        assert!(matches!(router.route(request).await, Err(MemoryError::Validation(_))));

        registry
            .create_or_update(SchemaDraft {
                key: "empty".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let mut request = RouteRequest::new("anything");
        request.schema_key = Some("empty".into());
        assert!(matches!(router.route(request).await, Err(MemoryError::Validation(_))));
    }

    #[tokio::test]
    async fn test_context_timeout_degrades() {
        let (_, registry) = setup().await;
        let router = IntentRouter::new(
            Arc::clone(&registry),
            Arc::new(SlowContext),
            Arc::new(KeywordBackend::new()),
        )
        .with_context_limits(Duration::from_millis(20), 5);
        let request = RouteRequest {
            query: "the server is down".into(),
            schema_key: Some("triage".into()),
            conversation_id: Some("c1".into()),
        };
        let result = router.route(request).await.unwrap();
        assert_eq!(result.metadata.context, ContextStatus::TimedOut);
        assert_eq!(result.selected_class, "urgent");
    }

    #[tokio::test]
    async fn test_context_failure_degrades() {
        let (_, registry) = setup().await;
        let router = IntentRouter::new(registry, Arc::new(FailingContext), Arc::new(KeywordBackend::new()));
        let request = RouteRequest {
            query: "the server is down".into(),
            schema_key: Some("triage".into()),
            conversation_id: Some("c1".into()),
        };
        let result = router.route(request).await.unwrap();
        assert_eq!(result.metadata.context, ContextStatus::Unavailable);
    }

    #[tokio::test]
    async fn test_context_is_read_without_touching_the_conversation() {
        let (store, registry) = setup().await;
        store
            .append_message("c1", NewMessage::user("production outage again"))
            .await
            .unwrap();
        let router = keyword_router(&store, &registry);
        let request = RouteRequest {
            query: "any update".into(),
            schema_key: Some("triage".into()),
            conversation_id: Some("c1".into()),
        };
        let result = router.route(request).await.unwrap();
        assert_eq!(result.metadata.context, ContextStatus::Used);
        assert_eq!(result.metadata.context_messages, 1);
        assert_eq!(result.selected_class, "urgent");

        let conversation = store
            .query(crate::memory_db::EntityKind::Conversation, Default::default())
            .await
            .unwrap();
        assert_eq!(conversation.entries[0].access_count(), 0);
    }

    #[tokio::test]
    async fn test_undeclared_backend_class_is_unclassified() {
        let (store, registry) = setup().await;
        let router = IntentRouter::new(
            registry,
            store as Arc<dyn ContextSource>,
            Arc::new(FixedBackend("billing")),
        );
        let mut request = RouteRequest::new("refund please");
        request.schema_key = Some("triage".into());
        let result = router.route(request).await.unwrap();
        assert!(result.is_unclassified());
        assert!(result.arguments.is_none());
        assert_eq!(result.metadata.backend, "fixed");
    }
}
