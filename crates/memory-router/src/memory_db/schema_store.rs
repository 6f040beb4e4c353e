//! Router schema persistence and the router's active pointer

use crate::error::{MemoryError, MemoryResult};
use crate::memory_db::pointers::{self, ActivePointer, ROUTER_SCOPE};
use crate::memory_db::schema::*;
use crate::memory_db::{DbConn, DbPool};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

const SCHEMA_COLUMNS: &str =
    "key, title, description, classes, examples, created_at, updated_at, last_activated_version";

/// Caller-supplied schema content. Validation happens in the registry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaDraft {
    pub key: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub classes: Vec<RouterClass>,
    #[serde(default)]
    pub examples: Vec<RouterExample>,
}

fn decode_row(row: &Row<'_>) -> rusqlite::Result<Result<RouterSchema, (String, String)>> {
    let key: String = row.get(0)?;
    let classes: String = row.get(3)?;
    let examples: String = row.get(4)?;
    let created_at: String = row.get(5)?;
    let updated_at: String = row.get(6)?;

    let decoded = (|| -> Result<RouterSchema, String> {
        Ok(RouterSchema {
            key: key.clone(),
            title: row.get(1).map_err(|e| e.to_string())?,
            description: row.get(2).map_err(|e| e.to_string())?,
            classes: serde_json::from_str(&classes).map_err(|e| format!("classes: {}", e))?,
            examples: serde_json::from_str(&examples).map_err(|e| format!("examples: {}", e))?,
            created_at: parse_datetime_safe(&created_at)
                .ok_or_else(|| format!("bad timestamp {}", created_at))?,
            updated_at: parse_datetime_safe(&updated_at)
                .ok_or_else(|| format!("bad timestamp {}", updated_at))?,
            last_activated_version: row.get(7).map_err(|e| e.to_string())?,
        })
    })();
    Ok(decoded.map_err(|reason| (key, reason)))
}

pub struct SchemaStore {
    pool: Arc<DbPool>,
}

impl SchemaStore {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> MemoryResult<DbConn> {
        Ok(self.pool.get()?)
    }

    /// Upsert. `created_at` and `last_activated_version` survive updates.
    pub fn save(&self, draft: &SchemaDraft, now: &DateTime<Utc>) -> MemoryResult<RouterSchema> {
        let classes = serde_json::to_string(&draft.classes).map_err(MemoryError::storage)?;
        let examples = serde_json::to_string(&draft.examples).map_err(MemoryError::storage)?;
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO router_schemas
             (key, title, description, classes, examples, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT(key) DO UPDATE SET
                 title = excluded.title,
                 description = excluded.description,
                 classes = excluded.classes,
                 examples = excluded.examples,
                 updated_at = excluded.updated_at",
            params![draft.key, draft.title, draft.description, classes, examples, ts(now)],
        )?;
        let schema = load(&tx, &draft.key)?;
        tx.commit()?;
        info!("Saved router schema {}", draft.key);
        Ok(schema)
    }

    pub fn get(&self, key: &str) -> MemoryResult<RouterSchema> {
        let conn = self.get_conn()?;
        load(&conn, key)
    }

    /// Every decodable schema, oldest first, plus the router pointer.
    pub fn list(&self) -> MemoryResult<(Vec<RouterSchema>, Option<ActivePointer>)> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM router_schemas ORDER BY created_at ASC, key ASC",
            SCHEMA_COLUMNS
        ))?;
        let rows = stmt
            .query_map([], decode_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let mut schemas = Vec::with_capacity(rows.len());
        for row in rows {
            match row {
                Ok(schema) => schemas.push(schema),
                Err((key, reason)) => warn!("Skipping undecodable router schema {}: {}", key, reason),
            }
        }
        let pointer = pointers::read(&conn, ROUTER_SCOPE)?;
        Ok((schemas, pointer))
    }

    /// Conflict if `key` is active. Returns whether a row was removed.
    pub fn delete(&self, key: &str) -> MemoryResult<bool> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if pointers::active_target(&tx, ROUTER_SCOPE)?.as_deref() == Some(key) {
            return Err(MemoryError::conflict(format!(
                "router schema {} is active; activate another or deactivate first",
                key
            )));
        }
        let removed = tx.execute("DELETE FROM router_schemas WHERE key = ?1", [key])? > 0;
        tx.commit()?;
        if removed {
            info!("Deleted router schema {}", key);
        }
        Ok(removed)
    }

    /// Switch the router pointer to `key` in one IMMEDIATE transaction.
    pub fn activate(&self, key: &str, now: &DateTime<Utc>) -> MemoryResult<(RouterSchema, i64)> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let exists = tx
            .query_row("SELECT 1 FROM router_schemas WHERE key = ?1", [key], |_| Ok(()))
            .optional()?
            .is_some();
        if !exists {
            return Err(MemoryError::not_found("router_schema", key));
        }
        let version = pointers::set(&tx, ROUTER_SCOPE, Some(key), &ts(now))?;
        tx.execute(
            "UPDATE router_schemas SET last_activated_version = ?1 WHERE key = ?2",
            params![version, key],
        )?;
        let schema = load(&tx, key)?;
        tx.commit()?;
        info!("Activated router schema {} (version {})", key, version);
        Ok((schema, version))
    }

    /// Clear the router pointer. Returns the previously active key.
    pub fn deactivate(&self, now: &DateTime<Utc>) -> MemoryResult<Option<String>> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let previous = pointers::active_target(&tx, ROUTER_SCOPE)?;
        if previous.is_some() {
            pointers::set(&tx, ROUTER_SCOPE, None, &ts(now))?;
        }
        tx.commit()?;
        if let Some(key) = &previous {
            info!("Deactivated router schema {}", key);
        }
        Ok(previous)
    }

    pub fn active(&self) -> MemoryResult<Option<(RouterSchema, ActivePointer)>> {
        let conn = self.get_conn()?;
        let pointer = match pointers::read(&conn, ROUTER_SCOPE)? {
            Some(pointer) => pointer,
            None => return Ok(None),
        };
        let key = match &pointer.target_key {
            Some(key) => key.clone(),
            None => return Ok(None),
        };
        match load(&conn, &key) {
            Ok(schema) => Ok(Some((schema, pointer))),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn load(conn: &Connection, key: &str) -> MemoryResult<RouterSchema> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM router_schemas WHERE key = ?1", SCHEMA_COLUMNS),
            [key],
            decode_row,
        )
        .optional()?;
    match row {
        Some(Ok(schema)) => Ok(schema),
        Some(Err((key, reason))) => Err(MemoryError::corrupt("router_schema", key, reason)),
        None => Err(MemoryError::not_found("router_schema", key)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_db::{test_now, MemoryDatabase};
    use chrono::Duration;

    fn draft(key: &str) -> SchemaDraft {
        SchemaDraft {
            key: key.to_string(),
            classes: vec![RouterClass {
                name: "greeting".into(),
                description: "Says hello".into(),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_update_preserves_created_at() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let now = test_now();
        let first = db.schemas.save(&draft("s"), &now).unwrap();
        let mut changed = draft("s");
        changed.title = Some("Support".into());
        let second = db.schemas.save(&changed, &(now + Duration::seconds(1))).unwrap();
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(second.title.as_deref(), Some("Support"));
        assert!(second.updated_at > first.updated_at);
    }

    #[test]
    fn test_activation_is_exclusive_and_versioned() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let now = test_now();
        db.schemas.save(&draft("a"), &now).unwrap();
        db.schemas.save(&draft("b"), &now).unwrap();

        assert_eq!(db.schemas.activate("a", &now).unwrap().1, 1);
        assert_eq!(db.schemas.activate("b", &now).unwrap().1, 2);
        let (active, pointer) = db.schemas.active().unwrap().unwrap();
        assert_eq!(active.key, "b");
        assert_eq!(pointer.version, 2);

        let (schemas, pointer) = db.schemas.list().unwrap();
        assert_eq!(schemas.len(), 2);
        assert_eq!(pointer.unwrap().target_key.as_deref(), Some("b"));
        assert!(db.schemas.activate("missing", &now).unwrap_err().is_not_found());
    }

    #[test]
    fn test_active_schema_cannot_be_deleted() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let now = test_now();
        db.schemas.save(&draft("a"), &now).unwrap();
        db.schemas.activate("a", &now).unwrap();
        assert!(matches!(db.schemas.delete("a"), Err(MemoryError::Conflict(_))));

        assert_eq!(db.schemas.deactivate(&now).unwrap().as_deref(), Some("a"));
        assert!(db.schemas.active().unwrap().is_none());
        assert!(db.schemas.delete("a").unwrap());
        assert!(!db.schemas.delete("a").unwrap());
    }
}
