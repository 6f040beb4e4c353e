//! System-wide key/value entries: typed values, priority, tags, TTL

use crate::error::{MemoryError, MemoryResult};
use crate::memory::value::{MemoryValue, DEFAULT_MEMORY_TYPE, SYSTEM_PROMPT_TYPE};
use crate::memory_db::pointers::{self, ActivePointer, SYSTEM_PROMPT_SCOPE};
use crate::memory_db::schema::*;
use crate::memory_db::{
    fetch_page, missing_or_corrupt, purge_if_expired, quarantine_row, record_access, DbConn,
    DbPool, PageRow, LIVE_FILTER,
};
use chrono::{DateTime, Utc};
use rusqlite::{named_params, params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::sync::Arc;
use tracing::{debug, info};

const SYSTEM_COLUMNS: &str = "key, value, memory_type, priority, tags, access_count,
     created_at, updated_at, last_accessed, expires_at";

/// A system entry write. `expires_at` is an encoded timestamp; None means no expiry.
#[derive(Debug, Clone)]
pub struct SystemPut {
    pub key: String,
    pub value: MemoryValue,
    pub memory_type: String,
    pub priority: Priority,
    pub tags: Vec<String>,
    pub expires_at: Option<String>,
}

impl SystemPut {
    pub fn new(key: impl Into<String>, value: MemoryValue) -> Self {
        Self {
            key: key.into(),
            value,
            memory_type: DEFAULT_MEMORY_TYPE.to_string(),
            priority: Priority::default(),
            tags: Vec::new(),
            expires_at: None,
        }
    }

    pub fn memory_type(mut self, memory_type: impl Into<String>) -> Self {
        self.memory_type = memory_type.into();
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn expires_at(mut self, expires_at: Option<String>) -> Self {
        self.expires_at = expires_at;
        self
    }
}

/// Ranking inputs for pressure eviction.
#[derive(Debug, Clone, PartialEq)]
pub struct EvictionCandidate {
    pub key: String,
    pub priority: Priority,
    pub access_count: i64,
    pub last_accessed: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

struct RawEntry {
    key: String,
    value: String,
    memory_type: String,
    priority: i64,
    tags: String,
    access_count: i64,
    created_at: String,
    updated_at: String,
    last_accessed: Option<String>,
    expires_at: Option<String>,
}

impl RawEntry {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            key: row.get(0)?,
            value: row.get(1)?,
            memory_type: row.get(2)?,
            priority: row.get(3)?,
            tags: row.get(4)?,
            access_count: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
            last_accessed: row.get(8)?,
            expires_at: row.get(9)?,
        })
    }

    fn decode(self) -> Result<SystemMemoryEntry, String> {
        let value: MemoryValue =
            serde_json::from_str(&self.value).map_err(|e| format!("value: {}", e))?;
        let tags: Vec<String> =
            serde_json::from_str(&self.tags).map_err(|e| format!("tags: {}", e))?;
        let priority = Priority::from_rank(self.priority)
            .ok_or_else(|| format!("unknown priority rank {}", self.priority))?;
        let parse = |raw: &str| parse_datetime_safe(raw).ok_or_else(|| format!("bad timestamp {}", raw));
        let parse_opt = |raw: &Option<String>| raw.as_deref().map(parse).transpose();
        Ok(SystemMemoryEntry {
            created_at: parse(&self.created_at)?,
            updated_at: parse(&self.updated_at)?,
            last_accessed: parse_opt(&self.last_accessed)?,
            expires_at: parse_opt(&self.expires_at)?,
            key: self.key,
            value,
            memory_type: self.memory_type,
            priority,
            tags,
            access_count: self.access_count,
        })
    }
}

impl PageRow for RawEntry {
    fn cursor(&self) -> PageCursor {
        PageCursor {
            updated_at: self.updated_at.clone(),
            key: self.key.clone(),
        }
    }
}

pub struct SystemStore {
    pool: Arc<DbPool>,
}

impl SystemStore {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> MemoryResult<DbConn> {
        Ok(self.pool.get()?)
    }

    /// Upsert. Resets `updated_at`, replaces expiry, keeps access bookkeeping
    /// of a live entry. An expired entry is discarded first and starts fresh.
    /// The active system prompt cannot change its memory type.
    pub fn put(&self, entry: SystemPut, now: &DateTime<Utc>) -> MemoryResult<SystemMemoryEntry> {
        let now_s = ts(now);
        let value = serde_json::to_string(&entry.value).map_err(MemoryError::storage)?;
        let tags = serde_json::to_string(&entry.tags).map_err(MemoryError::storage)?;
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if entry.memory_type != SYSTEM_PROMPT_TYPE
            && pointers::active_target(&tx, SYSTEM_PROMPT_SCOPE)?.as_deref() == Some(entry.key.as_str())
        {
            return Err(MemoryError::conflict(format!(
                "{} is the active system prompt; it must keep memory type {}",
                entry.key, SYSTEM_PROMPT_TYPE
            )));
        }
        if purge_if_expired(&tx, EntityKind::System, &entry.key, &now_s)? {
            debug!("Discarded expired system entry {} before upsert", entry.key);
        }
        tx.execute(
            "INSERT INTO system_memory
             (key, value, memory_type, priority, tags, created_at, updated_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?7)
             ON CONFLICT(key) DO UPDATE SET
                 value = excluded.value,
                 memory_type = excluded.memory_type,
                 priority = excluded.priority,
                 tags = excluded.tags,
                 updated_at = excluded.updated_at,
                 expires_at = excluded.expires_at,
                 quarantined = 0,
                 quarantine_reason = NULL",
            params![
                entry.key,
                value,
                entry.memory_type,
                entry.priority.rank(),
                tags,
                now_s,
                entry.expires_at,
            ],
        )?;
        let stored = load(&tx, &entry.key)?;
        tx.commit()?;
        debug!("Stored system entry {} ({})", entry.key, entry.memory_type);
        Ok(stored)
    }

    /// Logical read: bumps `access_count` and `last_accessed`.
    pub fn get(&self, key: &str, now: &DateTime<Utc>) -> MemoryResult<SystemMemoryEntry> {
        let now_s = ts(now);
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        // Decode first: a corrupt row is quarantined without counting as an access.
        if let Err(e) = load(&tx, key) {
            tx.commit()?;
            return Err(e);
        }
        record_access(&tx, EntityKind::System, key, &now_s)?;
        let entry = load(&tx, key)?;
        tx.commit()?;
        Ok(entry)
    }

    /// Non-tracking read of a live entry.
    pub fn peek(&self, key: &str, now: &DateTime<Utc>) -> MemoryResult<SystemMemoryEntry> {
        let conn = self.get_conn()?;
        let live = conn
            .query_row(
                &format!("SELECT 1 FROM system_memory WHERE key = :key AND {}", LIVE_FILTER),
                named_params! { ":key": key, ":now": ts(now) },
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if !live {
            return Err(missing_or_corrupt(&conn, EntityKind::System, key)?);
        }
        load(&conn, key)
    }

    /// Idempotent. The active system prompt cannot be deleted.
    pub fn delete(&self, key: &str) -> MemoryResult<bool> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if pointers::active_target(&tx, SYSTEM_PROMPT_SCOPE)?.as_deref() == Some(key) {
            return Err(MemoryError::conflict(format!(
                "system prompt {} is active; deactivate it first",
                key
            )));
        }
        let removed = tx.execute("DELETE FROM system_memory WHERE key = ?1", [key])? > 0;
        tx.commit()?;
        Ok(removed)
    }

    pub fn query(
        &self,
        filter: &QueryFilter,
        now: &DateTime<Utc>,
    ) -> MemoryResult<Page<SystemMemoryEntry>> {
        let conn = self.get_conn()?;
        let (rows, next) = fetch_page(
            &conn,
            EntityKind::System,
            SYSTEM_COLUMNS,
            filter,
            &ts(now),
            RawEntry::from_row,
        )?;
        let mut entries = Vec::with_capacity(rows.len());
        for raw in rows {
            let key = raw.key.clone();
            match raw.decode() {
                Ok(entry) => entries.push(entry),
                Err(reason) => {
                    quarantine_row(&conn, EntityKind::System, &key, &reason)?;
                }
            }
        }
        Ok(Page {
            entries,
            next_cursor: next.map(|c| c.encode()),
        })
    }

    pub fn live_count(&self, now: &DateTime<Utc>) -> MemoryResult<usize> {
        let conn = self.get_conn()?;
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM system_memory WHERE {}", LIVE_FILTER),
            named_params! { ":now": ts(now) },
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Live, evictable entries: not critical and not the active system prompt.
    pub fn eviction_candidates(&self, now: &DateTime<Utc>) -> MemoryResult<Vec<EvictionCandidate>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT key, priority, access_count, last_accessed, updated_at
             FROM system_memory
             WHERE {live} AND priority < :critical
               AND key NOT IN (
                   SELECT target_key FROM active_pointers
                   WHERE scope = :scope AND target_key IS NOT NULL)",
            live = LIVE_FILTER
        ))?;
        let rows = stmt
            .query_map(
                named_params! {
                    ":now": ts(now),
                    ":critical": Priority::Critical.rank(),
                    ":scope": SYSTEM_PROMPT_SCOPE,
                },
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(key, rank, access_count, last_accessed, updated_at)| -> MemoryResult<EvictionCandidate> {
                Ok(EvictionCandidate {
                    priority: Priority::from_rank(rank).unwrap_or(Priority::Low),
                    access_count,
                    last_accessed: parse_optional_ts(last_accessed)?,
                    updated_at: parse_required_ts(&updated_at)?,
                    key,
                })
            })
            .collect()
    }

    /// Delete only if the entry was not rewritten since it was ranked.
    pub fn evict(&self, key: &str, seen_updated_at: &DateTime<Utc>) -> MemoryResult<bool> {
        let conn = self.get_conn()?;
        let removed = conn.execute(
            "DELETE FROM system_memory WHERE key = ?1 AND updated_at = ?2",
            params![key, ts(seen_updated_at)],
        )? > 0;
        if removed {
            info!("Evicted system entry {}", key);
        }
        Ok(removed)
    }

    /// Live entries of the system prompt memory type, newest first.
    pub fn prompts(&self, now: &DateTime<Utc>) -> MemoryResult<Vec<SystemMemoryEntry>> {
        let mut entries = Vec::new();
        let mut filter = QueryFilter {
            memory_type: Some(SYSTEM_PROMPT_TYPE.to_string()),
            limit: Some(MAX_PAGE_SIZE),
            ..Default::default()
        };
        loop {
            let page = self.query(&filter, now)?;
            entries.extend(page.entries);
            match page.next_cursor {
                Some(cursor) => filter.cursor = Some(cursor),
                None => return Ok(entries),
            }
        }
    }

    /// Point the system prompt scope at `key`. NotFound unless `key` is a
    /// live system prompt.
    pub fn activate_prompt(&self, key: &str, now: &DateTime<Utc>) -> MemoryResult<i64> {
        let now_s = ts(now);
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let exists = tx
            .query_row(
                &format!(
                    "SELECT 1 FROM system_memory
                     WHERE key = :key AND memory_type = :memory_type AND {}",
                    LIVE_FILTER
                ),
                named_params! {
                    ":key": key,
                    ":memory_type": SYSTEM_PROMPT_TYPE,
                    ":now": now_s,
                },
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if !exists {
            return Err(MemoryError::not_found("system_prompt", key));
        }
        let version = pointers::set(&tx, SYSTEM_PROMPT_SCOPE, Some(key), &now_s)?;
        tx.commit()?;
        info!("Activated system prompt {} (version {})", key, version);
        Ok(version)
    }

    /// Clear the system prompt pointer. Returns the previously active key.
    pub fn deactivate_prompt(&self, now: &DateTime<Utc>) -> MemoryResult<Option<String>> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let previous = pointers::active_target(&tx, SYSTEM_PROMPT_SCOPE)?;
        if previous.is_some() {
            pointers::set(&tx, SYSTEM_PROMPT_SCOPE, None, &ts(now))?;
        }
        tx.commit()?;
        Ok(previous)
    }

    /// The active system prompt, if one is set and still live. Not a logical read.
    pub fn active_prompt(
        &self,
        now: &DateTime<Utc>,
    ) -> MemoryResult<Option<(SystemMemoryEntry, ActivePointer)>> {
        let conn = self.get_conn()?;
        let pointer = match pointers::read(&conn, SYSTEM_PROMPT_SCOPE)? {
            Some(pointer) => pointer,
            None => return Ok(None),
        };
        let key = match &pointer.target_key {
            Some(key) => key.clone(),
            None => return Ok(None),
        };
        let live = conn
            .query_row(
                &format!("SELECT 1 FROM system_memory WHERE key = :key AND {}", LIVE_FILTER),
                named_params! { ":key": key, ":now": ts(now) },
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if !live {
            return Ok(None);
        }
        Ok(Some((load(&conn, &key)?, pointer)))
    }
}

/// Non-tracking read of a non-quarantined entry.
fn load(conn: &Connection, key: &str) -> MemoryResult<SystemMemoryEntry> {
    let raw = conn
        .query_row(
            &format!(
                "SELECT {} FROM system_memory WHERE key = ?1 AND quarantined = 0",
                SYSTEM_COLUMNS
            ),
            [key],
            RawEntry::from_row,
        )
        .optional()?;
    match raw {
        Some(raw) => match raw.decode() {
            Ok(entry) => Ok(entry),
            Err(reason) => Err(quarantine_row(conn, EntityKind::System, key, &reason)?),
        },
        None => Err(missing_or_corrupt(conn, EntityKind::System, key)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_db::{test_now, MemoryDatabase};
    use chrono::Duration;
    use serde_json::json;

    fn put(db: &MemoryDatabase, key: &str, now: &DateTime<Utc>) {
        db.system.put(SystemPut::new(key, "v".into()), now).unwrap();
    }

    #[test]
    fn test_put_get_tracks_access_and_upserts() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let now = test_now();
        let value = MemoryValue::try_from(json!({"max_tokens": 4096})).unwrap();
        db.system
            .put(
                SystemPut::new("config.limits", value.clone())
                    .priority(Priority::High)
                    .tags(vec!["config".into()]),
                &now,
            )
            .unwrap();
        let entry = db.system.get("config.limits", &now).unwrap();
        assert_eq!(entry.value, value);
        assert_eq!(entry.priority, Priority::High);
        assert_eq!(entry.access_count, 1);

        let later = now + Duration::seconds(1);
        let rewritten = db
            .system
            .put(SystemPut::new("config.limits", "replaced".into()), &later)
            .unwrap();
        assert_eq!(rewritten.access_count, 1);
        assert_eq!(rewritten.updated_at, later);
        assert_eq!(rewritten.created_at, now);
    }

    #[test]
    fn test_expired_entries_are_invisible_before_sweep() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let now = test_now();
        db.system
            .put(
                SystemPut::new("soon", "v".into()).expires_at(Some(ts(&(now + Duration::seconds(5))))),
                &now,
            )
            .unwrap();
        assert!(db.system.get("soon", &now).is_ok());

        let after = now + Duration::seconds(5);
        assert!(db.system.get("soon", &after).unwrap_err().is_not_found());
        assert!(db.system.query(&QueryFilter::default(), &after).unwrap().entries.is_empty());
        assert_eq!(db.system.live_count(&after).unwrap(), 0);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let now = test_now();
        put(&db, "k", &now);
        assert!(db.system.delete("k").unwrap());
        assert!(!db.system.delete("k").unwrap());
        assert!(!db.system.delete("never-existed").unwrap());
    }

    #[test]
    fn test_cursor_pagination_visits_every_entry_once() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let now = test_now();
        for i in 0..7 {
            // two entries share each timestamp to exercise the key tiebreak
            put(&db, &format!("k{}", i), &(now + Duration::seconds(i / 2)));
        }
        let mut filter = QueryFilter { limit: Some(3), ..Default::default() };
        let mut seen = Vec::new();
        loop {
            let page = db.system.query(&filter, &(now + Duration::seconds(10))).unwrap();
            assert!(page.entries.len() <= 3);
            seen.extend(page.entries.into_iter().map(|e| e.key));
            match page.next_cursor {
                Some(cursor) => filter.cursor = Some(cursor),
                None => break,
            }
        }
        assert_eq!(seen, vec!["k6", "k4", "k5", "k2", "k3", "k0", "k1"]);
    }

    #[test]
    fn test_query_filters_and_does_not_track() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let now = test_now();
        db.system
            .put(SystemPut::new("a", "v".into()).tags(vec!["x".into()]).priority(Priority::Low), &now)
            .unwrap();
        db.system
            .put(SystemPut::new("b", "v".into()).tags(vec!["y".into()]).memory_type("knowledge"), &now)
            .unwrap();

        let by_tag = QueryFilter { tags: vec!["y".into()], ..Default::default() };
        assert_eq!(db.system.query(&by_tag, &now).unwrap().entries[0].key, "b");
        let by_priority = QueryFilter { priority: Some(Priority::Low), ..Default::default() };
        assert_eq!(db.system.query(&by_priority, &now).unwrap().entries[0].key, "a");
        let by_type = QueryFilter { memory_type: Some("knowledge".into()), ..Default::default() };
        let page = db.system.query(&by_type, &now).unwrap();
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.entries[0].access_count, 0);
    }

    #[test]
    fn test_eviction_candidates_skip_critical_and_active_prompt() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let now = test_now();
        put(&db, "plain", &now);
        db.system
            .put(SystemPut::new("pinned", "v".into()).priority(Priority::Critical), &now)
            .unwrap();
        let prompt = MemoryValue::try_from(json!({"content": "Be brief."})).unwrap();
        db.system
            .put(SystemPut::new("prompt", prompt).memory_type(SYSTEM_PROMPT_TYPE), &now)
            .unwrap();
        db.system.activate_prompt("prompt", &now).unwrap();

        let keys: Vec<String> = db
            .system
            .eviction_candidates(&now)
            .unwrap()
            .into_iter()
            .map(|c| c.key)
            .collect();
        assert_eq!(keys, vec!["plain"]);
    }

    #[test]
    fn test_evict_skips_rewritten_entry() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let now = test_now();
        put(&db, "k", &now);
        put(&db, "k", &(now + Duration::seconds(1)));
        assert!(!db.system.evict("k", &now).unwrap());
        assert!(db.system.evict("k", &(now + Duration::seconds(1))).unwrap());
    }

    #[test]
    fn test_active_prompt_lifecycle() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let now = test_now();
        put(&db, "not-a-prompt", &now);
        assert!(db.system.activate_prompt("not-a-prompt", &now).unwrap_err().is_not_found());

        let prompt = MemoryValue::try_from(json!({"content": "Be brief."})).unwrap();
        db.system
            .put(SystemPut::new("p1", prompt).memory_type(SYSTEM_PROMPT_TYPE), &now)
            .unwrap();
        assert_eq!(db.system.activate_prompt("p1", &now).unwrap(), 1);
        let (entry, pointer) = db.system.active_prompt(&now).unwrap().unwrap();
        assert_eq!(entry.key, "p1");
        assert_eq!(pointer.version, 1);
        assert!(matches!(db.system.delete("p1"), Err(MemoryError::Conflict(_))));

        assert_eq!(db.system.deactivate_prompt(&now).unwrap().as_deref(), Some("p1"));
        assert!(db.system.active_prompt(&now).unwrap().is_none());
        assert!(db.system.delete("p1").unwrap());
        assert_eq!(db.system.prompts(&now).unwrap().len(), 0);
    }

    #[test]
    fn test_put_over_expired_entry_starts_fresh() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let now = test_now();
        db.system
            .put(
                SystemPut::new("k", "old".into()).expires_at(Some(ts(&(now + Duration::seconds(5))))),
                &now,
            )
            .unwrap();
        db.system.get("k", &now).unwrap();

        let later = now + Duration::seconds(10);
        let fresh = db.system.put(SystemPut::new("k", "new".into()), &later).unwrap();
        assert_eq!(fresh.value, MemoryValue::from("new"));
        assert_eq!(fresh.access_count, 0);
        assert_eq!(fresh.last_accessed, None);
        assert_eq!(fresh.created_at, later);
    }

    #[test]
    fn test_corrupt_read_is_not_counted_as_access() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let now = test_now();
        put(&db, "k", &now);
        db.get_conn()
            .unwrap()
            .execute("UPDATE system_memory SET value = '{not json' WHERE key = 'k'", [])
            .unwrap();
        assert!(matches!(db.system.get("k", &now), Err(MemoryError::CorruptEntry { .. })));

        let (count, quarantined): (i64, bool) = db
            .get_conn()
            .unwrap()
            .query_row(
                "SELECT access_count, quarantined FROM system_memory WHERE key = 'k'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(count, 0);
        assert!(quarantined);
    }

    #[test]
    fn test_active_prompt_keeps_its_memory_type() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let now = test_now();
        let prompt = MemoryValue::try_from(json!({"content": "Be brief."})).unwrap();
        db.system
            .put(SystemPut::new("p1", prompt).memory_type(SYSTEM_PROMPT_TYPE), &now)
            .unwrap();
        db.system.activate_prompt("p1", &now).unwrap();

        let err = db.system.put(SystemPut::new("p1", "plain".into()), &now).unwrap_err();
        assert!(matches!(err, MemoryError::Conflict(_)));

        let revised = MemoryValue::try_from(json!({"content": "Be thorough."})).unwrap();
        db.system
            .put(SystemPut::new("p1", revised.clone()).memory_type(SYSTEM_PROMPT_TYPE), &now)
            .unwrap();
        let (entry, _) = db.system.active_prompt(&now).unwrap().unwrap();
        assert_eq!(entry.value, revised);

        db.system.deactivate_prompt(&now).unwrap();
        assert!(db.system.put(SystemPut::new("p1", "plain".into()), &now).is_ok());
    }
}
