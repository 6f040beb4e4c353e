//! System prompts: system entries of the `system_prompt` memory type with
//! their own single-active pointer.

use crate::error::{MemoryError, MemoryResult};
use crate::memory::{MemoryStore, PutOptions, SYSTEM_PROMPT_TYPE};
use crate::memory_db::{EntityKind, MemoryRecord, Priority, SystemMemoryEntry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptDraft {
    pub content: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemPrompt {
    pub key: String,
    pub content: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub model: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivePrompt {
    #[serde(flatten)]
    pub prompt: SystemPrompt,
    pub version: i64,
}

impl SystemPrompt {
    fn from_entry(entry: SystemMemoryEntry, active: bool) -> MemoryResult<Self> {
        if entry.memory_type != SYSTEM_PROMPT_TYPE {
            return Err(MemoryError::not_found("system_prompt", entry.key));
        }
        let field = |name: &str| entry.value.get(name).and_then(|v| v.as_str()).map(str::to_string);
        let content = field("content").ok_or_else(|| {
            MemoryError::corrupt("system_prompt", entry.key.clone(), "missing content")
        })?;
        Ok(Self {
            content,
            title: field("title"),
            description: field("description"),
            model: field("model"),
            key: entry.key,
            active,
            created_at: entry.created_at,
            updated_at: entry.updated_at,
        })
    }
}

pub struct PromptRegistry {
    store: Arc<MemoryStore>,
}

impl PromptRegistry {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }

    /// Upsert the prompt stored under `key`. Prompts never expire.
    pub async fn save(&self, key: &str, draft: PromptDraft) -> MemoryResult<SystemPrompt> {
        if draft.content.trim().is_empty() {
            return Err(MemoryError::validation("prompt content must not be empty"));
        }
        let mut value = Map::new();
        value.insert("content".into(), json!(draft.content));
        for (name, field) in [
            ("title", draft.title),
            ("description", draft.description),
            ("model", draft.model),
        ] {
            if let Some(field) = field {
                value.insert(name.into(), Value::String(field));
            }
        }
        let options = PutOptions {
            memory_type: Some(SYSTEM_PROMPT_TYPE.to_string()),
            priority: Some(Priority::High),
            ..Default::default()
        };
        let record = self
            .store
            .put(EntityKind::System, key, Value::Object(value), options)
            .await?;
        let active = self.active_key().await?;
        match record {
            MemoryRecord::System(entry) => {
                let is_active = active.as_deref() == Some(entry.key.as_str());
                SystemPrompt::from_entry(entry, is_active)
            }
            _ => Err(MemoryError::storage("system put returned a non-system record")),
        }
    }

    pub async fn list(&self) -> MemoryResult<Vec<SystemPrompt>> {
        let (entries, active) = self
            .store
            .blocking(|db, now| {
                let active = db.system.active_prompt(&now)?.map(|(entry, _)| entry.key);
                Ok((db.system.prompts(&now)?, active))
            })
            .await?;
        entries
            .into_iter()
            .map(|entry| {
                let is_active = active.as_deref() == Some(entry.key.as_str());
                SystemPrompt::from_entry(entry, is_active)
            })
            .collect()
    }

    pub async fn get(&self, key: &str) -> MemoryResult<SystemPrompt> {
        let key = key.to_string();
        let (entry, active) = self
            .store
            .blocking(move |db, now| {
                let entry = db.system.peek(&key, &now)?;
                let active = db.system.active_prompt(&now)?.map(|(entry, _)| entry.key);
                Ok((entry, active))
            })
            .await
            .map_err(as_prompt_error)?;
        let is_active = active.as_deref() == Some(entry.key.as_str());
        SystemPrompt::from_entry(entry, is_active)
    }

    pub async fn activate(&self, key: &str) -> MemoryResult<ActivePrompt> {
        let key = key.to_string();
        let (entry, version) = self
            .store
            .blocking(move |db, now| {
                let version = db.system.activate_prompt(&key, &now)?;
                Ok((db.system.peek(&key, &now)?, version))
            })
            .await?;
        Ok(ActivePrompt {
            prompt: SystemPrompt::from_entry(entry, true)?,
            version,
        })
    }

    pub async fn deactivate(&self) -> MemoryResult<Option<String>> {
        let previous = self
            .store
            .blocking(|db, now| db.system.deactivate_prompt(&now))
            .await?;
        if let Some(key) = &previous {
            info!("Deactivated system prompt {}", key);
        }
        Ok(previous)
    }

    pub async fn get_active(&self) -> MemoryResult<Option<ActivePrompt>> {
        let active = self
            .store
            .blocking(|db, now| db.system.active_prompt(&now))
            .await?;
        active
            .map(|(entry, pointer)| {
                Ok(ActivePrompt {
                    prompt: SystemPrompt::from_entry(entry, true)?,
                    version: pointer.version,
                })
            })
            .transpose()
    }

    /// Conflict if active, NotFound unless `key` is a live prompt.
    pub async fn delete(&self, key: &str) -> MemoryResult<()> {
        let key_owned = key.to_string();
        self.store
            .locked(EntityKind::System, key, move |db, now| {
                let entry = db.system.peek(&key_owned, &now)?;
                if entry.memory_type != SYSTEM_PROMPT_TYPE {
                    return Err(MemoryError::not_found("system_prompt", key_owned));
                }
                db.system.delete(&key_owned)?;
                Ok(())
            })
            .await
            .map_err(as_prompt_error)?;
        info!("Deleted system prompt {}", key);
        Ok(())
    }

    async fn active_key(&self) -> MemoryResult<Option<String>> {
        self.store
            .blocking(|db, now| Ok(db.system.active_prompt(&now)?.map(|(entry, _)| entry.key)))
            .await
    }
}

fn as_prompt_error(e: MemoryError) -> MemoryError {
    match e {
        MemoryError::NotFound { key, .. } => MemoryError::not_found("system_prompt", key),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> (Arc<MemoryStore>, PromptRegistry) {
        let store = Arc::new(MemoryStore::in_memory().unwrap());
        (Arc::clone(&store), PromptRegistry::new(store))
    }

    fn draft(content: &str) -> PromptDraft {
        PromptDraft {
            content: content.to_string(),
            title: Some("Default".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_save_list_activate() {
        let (_, prompts) = registry();
        prompts.save("friendly", draft("Be friendly.")).await.unwrap();
        prompts.save("terse", draft("Be terse.")).await.unwrap();
        assert_eq!(prompts.list().await.unwrap().len(), 2);
        assert!(prompts.get_active().await.unwrap().is_none());

        let active = prompts.activate("terse").await.unwrap();
        assert_eq!(active.prompt.content, "Be terse.");
        assert_eq!(active.version, 1);
        assert_eq!(prompts.activate("friendly").await.unwrap().version, 2);

        let listed = prompts.list().await.unwrap();
        assert_eq!(listed.iter().filter(|p| p.active).count(), 1);
        assert!(prompts.get("friendly").await.unwrap().active);
        assert_eq!(prompts.get_active().await.unwrap().unwrap().prompt.key, "friendly");
    }

    #[tokio::test]
    async fn test_delete_rules() {
        let (store, prompts) = registry();
        prompts.save("p", draft("text")).await.unwrap();
        prompts.activate("p").await.unwrap();
        assert!(matches!(prompts.delete("p").await, Err(MemoryError::Conflict(_))));
        assert_eq!(prompts.deactivate().await.unwrap().as_deref(), Some("p"));
        prompts.delete("p").await.unwrap();
        assert!(prompts.delete("p").await.unwrap_err().is_not_found());

        store
            .put(EntityKind::System, "fact", json!("not a prompt"), PutOptions::default())
            .await
            .unwrap();
        assert!(prompts.get("fact").await.unwrap_err().is_not_found());
        assert!(prompts.delete("fact").await.unwrap_err().is_not_found());
        assert!(prompts.activate("fact").await.unwrap_err().is_not_found());
        assert!(store.get(EntityKind::System, "fact").await.is_ok());
    }

    #[tokio::test]
    async fn test_empty_content_rejected() {
        let (_, prompts) = registry();
        let err = prompts.save("p", draft("   ")).await.unwrap_err();
        assert!(matches!(err, MemoryError::Validation(_)));
    }
}
