//! User context storage: created on first contact, never expire

use crate::error::{MemoryError, MemoryResult};
use crate::memory_db::schema::*;
use crate::memory_db::{fetch_page, quarantine_row, record_access, DbConn, DbPool, PageRow};
use chrono::{DateTime, Utc};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info};

const USER_COLUMNS: &str = "id, display_name, preferences, facts, active, created_at, updated_at,
     last_active, access_count, last_accessed";

/// Replacement content for a user record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserUpdate {
    pub display_name: Option<String>,
    pub preferences: Option<Map<String, Value>>,
    pub facts: Option<Vec<String>>,
    pub active: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PurgeReport {
    pub user_deleted: bool,
    pub conversations_deleted: usize,
}

struct RawUser {
    id: String,
    display_name: Option<String>,
    preferences: String,
    facts: String,
    active: bool,
    created_at: String,
    updated_at: String,
    last_active: String,
    access_count: i64,
    last_accessed: Option<String>,
}

impl RawUser {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            display_name: row.get(1)?,
            preferences: row.get(2)?,
            facts: row.get(3)?,
            active: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
            last_active: row.get(7)?,
            access_count: row.get(8)?,
            last_accessed: row.get(9)?,
        })
    }

    fn decode(self) -> Result<User, String> {
        let preferences: Map<String, Value> = serde_json::from_str(&self.preferences)
            .map_err(|e| format!("preferences: {}", e))?;
        let facts: Vec<String> =
            serde_json::from_str(&self.facts).map_err(|e| format!("facts: {}", e))?;
        let parse = |raw: &str| parse_datetime_safe(raw).ok_or_else(|| format!("bad timestamp {}", raw));
        Ok(User {
            created_at: parse(&self.created_at)?,
            updated_at: parse(&self.updated_at)?,
            last_active: parse(&self.last_active)?,
            last_accessed: match &self.last_accessed {
                Some(raw) => Some(parse(raw)?),
                None => None,
            },
            id: self.id,
            display_name: self.display_name,
            preferences,
            facts,
            active: self.active,
            access_count: self.access_count,
        })
    }
}

impl PageRow for RawUser {
    fn cursor(&self) -> PageCursor {
        PageCursor {
            updated_at: self.updated_at.clone(),
            key: self.id.clone(),
        }
    }
}

pub struct UserStore {
    pool: Arc<DbPool>,
}

impl UserStore {
    pub fn new(pool: Arc<r2d2::Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> MemoryResult<DbConn> {
        Ok(self.pool.get()?)
    }

    /// Replace the user's content, creating the row if needed. Access
    /// bookkeeping and `created_at` survive; a quarantined row is overwritten.
    pub fn put(&self, id: &str, update: UserUpdate, now: &DateTime<Utc>) -> MemoryResult<User> {
        let now_s = ts(now);
        let preferences = serde_json::to_string(&update.preferences.unwrap_or_default())
            .map_err(MemoryError::storage)?;
        let facts = dedup_facts(update.facts.unwrap_or_default());
        let facts = serde_json::to_string(&facts).map_err(MemoryError::storage)?;

        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO users
             (id, display_name, preferences, facts, active, created_at, updated_at, last_active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?6)
             ON CONFLICT(id) DO UPDATE SET
                 display_name = excluded.display_name,
                 preferences = excluded.preferences,
                 facts = excluded.facts,
                 active = excluded.active,
                 updated_at = excluded.updated_at,
                 last_active = excluded.last_active,
                 quarantined = 0,
                 quarantine_reason = NULL",
            params![id, update.display_name, preferences, facts, update.active.unwrap_or(true), now_s],
        )?;
        let user = load(&tx, id)?;
        tx.commit()?;
        debug!("Stored user {}", id);
        Ok(user)
    }

    /// Logical read: bumps `access_count` and `last_accessed`.
    pub fn get(&self, id: &str, now: &DateTime<Utc>) -> MemoryResult<User> {
        let now_s = ts(now);
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        // Decode first: a corrupt row is quarantined without counting as an access.
        if let Err(e) = load(&tx, id) {
            tx.commit()?;
            return Err(e);
        }
        record_access(&tx, EntityKind::User, id, &now_s)?;
        let user = load(&tx, id)?;
        tx.commit()?;
        Ok(user)
    }

    /// Get-or-create on first contact. Refreshes `last_active` without
    /// counting as an access.
    pub fn touch(&self, id: &str, now: &DateTime<Utc>) -> MemoryResult<User> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let created = ensure_user(&tx, id, &ts(now))?;
        let user = load(&tx, id);
        tx.commit()?;
        if created {
            info!("Created user {} on first contact", id);
        }
        user
    }

    /// Shallow-merge `preferences` into the stored map. Creates the user if absent.
    pub fn merge_preferences(
        &self,
        id: &str,
        preferences: Map<String, Value>,
        now: &DateTime<Utc>,
    ) -> MemoryResult<User> {
        self.modify(id, now, |user| {
            for (k, v) in preferences {
                user.preferences.insert(k, v);
            }
            true
        })
        .map(|(user, _)| user)
    }

    /// Add a fact with set semantics. Returns the user and whether the fact was new.
    pub fn add_fact(&self, id: &str, fact: &str, now: &DateTime<Utc>) -> MemoryResult<(User, bool)> {
        let fact = fact.trim();
        if fact.is_empty() {
            return Err(MemoryError::validation("fact must not be empty"));
        }
        self.modify(id, now, |user| {
            if user.facts.iter().any(|f| f == fact) {
                false
            } else {
                user.facts.push(fact.to_string());
                true
            }
        })
    }

    fn modify<F>(&self, id: &str, now: &DateTime<Utc>, apply: F) -> MemoryResult<(User, bool)>
    where
        F: FnOnce(&mut User) -> bool,
    {
        let now_s = ts(now);
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        ensure_user(&tx, id, &now_s)?;
        let mut user = match load(&tx, id) {
            Ok(user) => user,
            Err(e) => {
                // keep the quarantine mark
                tx.commit()?;
                return Err(e);
            }
        };
        let changed = apply(&mut user);
        if changed {
            let preferences = serde_json::to_string(&user.preferences).map_err(MemoryError::storage)?;
            let facts = serde_json::to_string(&user.facts).map_err(MemoryError::storage)?;
            tx.execute(
                "UPDATE users SET preferences = ?1, facts = ?2, updated_at = ?3, last_active = ?3
                 WHERE id = ?4",
                params![preferences, facts, now_s, id],
            )?;
            user.updated_at = *now;
            user.last_active = *now;
        }
        tx.commit()?;
        Ok((user, changed))
    }

    pub fn delete(&self, id: &str) -> MemoryResult<bool> {
        let conn = self.get_conn()?;
        Ok(conn.execute("DELETE FROM users WHERE id = ?1", [id])? > 0)
    }

    /// Remove the user and every conversation that references them.
    pub fn purge(&self, id: &str) -> MemoryResult<PurgeReport> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "DELETE FROM messages WHERE conversation_id IN
                 (SELECT id FROM conversations WHERE user_id = ?1)",
            [id],
        )?;
        let conversations_deleted =
            tx.execute("DELETE FROM conversations WHERE user_id = ?1", [id])?;
        let user_deleted = tx.execute("DELETE FROM users WHERE id = ?1", [id])? > 0;
        tx.commit()?;
        info!(
            "Purged user {} ({} conversations removed)",
            id, conversations_deleted
        );
        Ok(PurgeReport {
            user_deleted,
            conversations_deleted,
        })
    }

    /// Paged scan; never touches access bookkeeping. Undecodable rows are
    /// quarantined and skipped.
    pub fn query(&self, filter: &QueryFilter, now: &DateTime<Utc>) -> MemoryResult<Page<User>> {
        let conn = self.get_conn()?;
        let (rows, next) = fetch_page(
            &conn,
            EntityKind::User,
            USER_COLUMNS,
            filter,
            &ts(now),
            RawUser::from_row,
        )?;
        let mut entries = Vec::with_capacity(rows.len());
        for raw in rows {
            let id = raw.id.clone();
            match raw.decode() {
                Ok(user) => entries.push(user),
                Err(reason) => {
                    quarantine_row(&conn, EntityKind::User, &id, &reason)?;
                }
            }
        }
        Ok(Page {
            entries,
            next_cursor: next.map(|c| c.encode()),
        })
    }
}

/// Insert a default user if absent and refresh `last_active`. Returns true on insert.
fn ensure_user(conn: &Connection, id: &str, now: &str) -> MemoryResult<bool> {
    if id.trim().is_empty() {
        return Err(MemoryError::validation("user id must not be empty"));
    }
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO users (id, created_at, updated_at, last_active)
         VALUES (?1, ?2, ?2, ?2)",
        params![id, now],
    )?;
    if inserted == 0 {
        conn.execute("UPDATE users SET last_active = ?1 WHERE id = ?2", params![now, id])?;
    }
    Ok(inserted > 0)
}

/// Non-tracking read of a live user. Quarantines on decode failure.
fn load(conn: &Connection, id: &str) -> MemoryResult<User> {
    let raw = conn
        .query_row(
            &format!(
                "SELECT {} FROM users WHERE id = ?1 AND quarantined = 0",
                USER_COLUMNS
            ),
            [id],
            RawUser::from_row,
        )
        .optional()?;
    match raw {
        Some(raw) => match raw.decode() {
            Ok(user) => Ok(user),
            Err(reason) => Err(quarantine_row(conn, EntityKind::User, id, &reason)?),
        },
        None => Err(crate::memory_db::missing_or_corrupt(conn, EntityKind::User, id)?),
    }
}

fn dedup_facts(facts: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(facts.len());
    for fact in facts {
        let fact = fact.trim().to_string();
        if !fact.is_empty() && !out.contains(&fact) {
            out.push(fact);
        }
    }
    out
}
