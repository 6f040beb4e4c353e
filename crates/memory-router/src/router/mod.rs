//! Schema-driven intent routing on top of the memory store

pub mod classifier;
pub mod keyword;
pub mod ollama;
pub mod prompts;
pub mod registry;

pub use classifier::{
    ClassScore, Classification, ClassificationBackend, ContextSource, ContextStatus, IntentRouter,
    RouteRequest, RouteResult, UNCLASSIFIED,
};
pub use keyword::KeywordBackend;
pub use ollama::OllamaBackend;
pub use prompts::{ActivePrompt, PromptDraft, PromptRegistry, SystemPrompt};
pub use registry::{ActiveSchema, SchemaLimits, SchemaRegistry, SchemaState, SchemaSummary};
