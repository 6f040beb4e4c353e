// memory-router/src/lib.rs

pub mod api;
pub mod config;
pub mod error;
pub mod memory;
pub mod memory_db;
pub mod metrics;
pub mod router;
pub mod server;
pub mod shared_state;
pub mod telemetry;
pub mod utils;

// Public API exports
pub use config::Config;
pub use error::{MemoryError, MemoryResult};
pub use memory::{MemoryStore, PutOptions};
pub use memory_db::{EntityKind, MemoryDatabase, Priority, QueryFilter};
pub use router::{IntentRouter, PromptRegistry, RouteRequest, RouteResult, SchemaRegistry};
pub use server::run_server;
pub use shared_state::AppState;
