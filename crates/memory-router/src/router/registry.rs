//! Named router schemas with a single active pointer

use crate::error::{MemoryError, MemoryResult};
use crate::memory::{MemoryStore, MAX_KEY_LEN};
use crate::memory_db::{RouterSchema, SchemaDraft};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

pub const DEFAULT_MAX_CLASSES: usize = 10;
pub const DEFAULT_MAX_EXAMPLES: usize = 10;

#[derive(Debug, Clone, Copy)]
pub struct SchemaLimits {
    pub max_classes: usize,
    pub max_examples: usize,
}

impl Default for SchemaLimits {
    fn default() -> Self {
        Self {
            max_classes: DEFAULT_MAX_CLASSES,
            max_examples: DEFAULT_MAX_EXAMPLES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaState {
    /// Saved, never activated.
    Draft,
    Active,
    /// Previously active, since superseded or deactivated.
    Inactive,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchemaSummary {
    #[serde(flatten)]
    pub schema: RouterSchema,
    pub active: bool,
    pub state: SchemaState,
}

/// The active schema together with the pointer version that selected it.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveSchema {
    #[serde(flatten)]
    pub schema: RouterSchema,
    pub version: i64,
}

fn state_of(schema: &RouterSchema, active_key: Option<&str>) -> SchemaState {
    if active_key == Some(schema.key.as_str()) {
        SchemaState::Active
    } else if schema.last_activated_version.is_some() {
        SchemaState::Inactive
    } else {
        SchemaState::Draft
    }
}

/// Reject drafts the router could not use.
pub fn validate_draft(draft: &SchemaDraft, limits: &SchemaLimits) -> MemoryResult<()> {
    let key = draft.key.trim();
    if key.is_empty() {
        return Err(MemoryError::validation("schema key must not be empty"));
    }
    if draft.key.chars().count() > MAX_KEY_LEN {
        return Err(MemoryError::validation(format!(
            "schema key must be at most {} characters",
            MAX_KEY_LEN
        )));
    }
    if draft.classes.len() > limits.max_classes {
        return Err(MemoryError::validation(format!(
            "schema declares {} classes; at most {} allowed",
            draft.classes.len(),
            limits.max_classes
        )));
    }
    if draft.examples.len() > limits.max_examples {
        return Err(MemoryError::validation(format!(
            "schema declares {} examples; at most {} allowed",
            draft.examples.len(),
            limits.max_examples
        )));
    }

    let mut names = HashSet::new();
    for class in &draft.classes {
        let name = class.name.trim();
        if name.is_empty() {
            return Err(MemoryError::validation("class names must not be empty"));
        }
        if !names.insert(name) {
            return Err(MemoryError::validation(format!("duplicate class name: {}", name)));
        }
    }
    for example in &draft.examples {
        if example.query.trim().is_empty() {
            return Err(MemoryError::validation("example queries must not be empty"));
        }
        if !names.contains(example.expected.class.trim()) {
            return Err(MemoryError::validation(format!(
                "example \"{}\" expects undeclared class {}",
                example.query, example.expected.class
            )));
        }
    }
    Ok(())
}

pub struct SchemaRegistry {
    store: Arc<MemoryStore>,
    limits: SchemaLimits,
}

impl SchemaRegistry {
    pub fn new(store: Arc<MemoryStore>, limits: SchemaLimits) -> Self {
        Self { store, limits }
    }

    pub fn limits(&self) -> SchemaLimits {
        self.limits
    }

    pub async fn create_or_update(&self, draft: SchemaDraft) -> MemoryResult<RouterSchema> {
        validate_draft(&draft, &self.limits)?;
        let mut draft = draft;
        draft.key = draft.key.trim().to_string();
        for class in &mut draft.classes {
            class.name = class.name.trim().to_string();
        }
        for example in &mut draft.examples {
            example.expected.class = example.expected.class.trim().to_string();
        }
        self.store
            .blocking(move |db, now| db.schemas.save(&draft, &now))
            .await
    }

    pub async fn get(&self, key: &str) -> MemoryResult<RouterSchema> {
        let key = key.to_string();
        self.store.blocking(move |db, _| db.schemas.get(&key)).await
    }

    /// Every schema, oldest first, with its lifecycle state.
    pub async fn list(&self) -> MemoryResult<Vec<SchemaSummary>> {
        let (schemas, pointer) = self.store.blocking(|db, _| db.schemas.list()).await?;
        let active_key = pointer.and_then(|p| p.target_key);
        Ok(schemas
            .into_iter()
            .map(|schema| {
                let state = state_of(&schema, active_key.as_deref());
                SchemaSummary {
                    active: state == SchemaState::Active,
                    state,
                    schema,
                }
            })
            .collect())
    }

    pub async fn activate(&self, key: &str) -> MemoryResult<ActiveSchema> {
        let key = key.to_string();
        let (schema, version) = self
            .store
            .blocking(move |db, now| db.schemas.activate(&key, &now))
            .await?;
        Ok(ActiveSchema { schema, version })
    }

    /// Returns the key that was active, if any.
    pub async fn deactivate(&self) -> MemoryResult<Option<String>> {
        self.store.blocking(|db, now| db.schemas.deactivate(&now)).await
    }

    /// Conflict if active, NotFound if unknown.
    pub async fn delete(&self, key: &str) -> MemoryResult<()> {
        let key_owned = key.to_string();
        let removed = self
            .store
            .blocking(move |db, _| db.schemas.delete(&key_owned))
            .await?;
        if !removed {
            return Err(MemoryError::not_found("router_schema", key));
        }
        info!("Router schema {} removed", key);
        Ok(())
    }

    pub async fn get_active(&self) -> MemoryResult<Option<ActiveSchema>> {
        let active = self.store.blocking(|db, _| db.schemas.active()).await?;
        Ok(active.map(|(schema, pointer)| ActiveSchema {
            schema,
            version: pointer.version,
        }))
    }

    /// Schema for a route: the named one, else the active one.
    pub async fn resolve(&self, key: Option<&str>) -> MemoryResult<RouterSchema> {
        match key {
            Some(key) => self.get(key).await,
            None => self
                .get_active()
                .await?
                .map(|active| active.schema)
                .ok_or_else(|| MemoryError::not_found("router_schema", "(active)")),
        }
    }
}
