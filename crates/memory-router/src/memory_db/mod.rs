//! Memory database module - SQLite-backed storage for users, conversations,
//! system entries, and router schemas
pub mod schema;
pub mod migration;
pub mod user_store;
pub mod conversation_store;
pub mod system_store;
pub mod schema_store;
pub mod pointers;
pub use schema::*;
pub use migration::MigrationManager;
pub use user_store::{UserStore, UserUpdate, PurgeReport};
pub use conversation_store::{ConversationStore, ConversationUpdate, NewMessage};
pub use system_store::{SystemStore, SystemPut, EvictionCandidate};
pub use schema_store::{SchemaStore, SchemaDraft};
pub use pointers::{ActivePointer, ROUTER_SCOPE, SYSTEM_PROMPT_SCOPE};
use std::path::Path;
use std::sync::Arc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OptionalExtension, Row, ToSql};
use tracing::{info, warn};
use crate::error::{MemoryError, MemoryResult};

pub(crate) type DbPool = Pool<SqliteConnectionManager>;
pub(crate) type DbConn = r2d2::PooledConnection<SqliteConnectionManager>;

/// Row visibility on every read path. Binds `:now`.
pub(crate) const LIVE_FILTER: &str =
    "quarantined = 0 AND (expires_at IS NULL OR expires_at > :now)";

const CONNECTION_PRAGMAS: &str = "PRAGMA foreign_keys = ON;
     PRAGMA busy_timeout = 5000;";

/// Entry points to every store, sharing one connection pool.
pub struct MemoryDatabase {
    pub users: UserStore,
    pub conversations: ConversationStore,
    pub system: SystemStore,
    pub schemas: SchemaStore,
    pool: Arc<DbPool>,
}

/// Least and most recently used live keys across all entity types.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct UsageExtremes {
    pub least_recently_used: Option<(EntityKind, String)>,
    pub most_recently_used: Option<(EntityKind, String)>,
}

impl MemoryDatabase {
    /// Open (or create) a file-backed database and bring its schema up to date.
    pub fn new(db_path: &Path, pool_size: u32) -> anyhow::Result<Self> {
        info!("Opening memory database at: {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let manager = SqliteConnectionManager::file(db_path)
            .with_flags(
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
            )
            .with_init(|conn| conn.execute_batch(CONNECTION_PRAGMAS));
        let pool = Pool::builder()
            .max_size(pool_size.max(1))
            .build(manager)
            .map_err(|e| anyhow::anyhow!("Failed to create connection pool: {}", e))?;

        {
            let mut conn = pool.get()?;
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;",
            )?;
            let mut migrator = migration::MigrationManager::new(&mut conn);
            migrator.initialize_database()?;
        }
        info!("Memory database initialized successfully");
        Ok(Self::from_pool(pool))
    }

    /// Private in-memory database. A single pooled connection, because every
    /// SQLite `:memory:` connection is its own database.
    pub fn new_in_memory() -> anyhow::Result<Self> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|conn| conn.execute_batch(CONNECTION_PRAGMAS));
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)?;
        {
            let mut conn = pool.get()?;
            migration::MigrationManager::new(&mut conn).initialize_database()?;
        }
        Ok(Self::from_pool(pool))
    }

    fn from_pool(pool: DbPool) -> Self {
        let pool = Arc::new(pool);
        Self {
            users: UserStore::new(Arc::clone(&pool)),
            conversations: ConversationStore::new(Arc::clone(&pool)),
            system: SystemStore::new(Arc::clone(&pool)),
            schemas: SchemaStore::new(Arc::clone(&pool)),
            pool,
        }
    }

    pub(crate) fn get_conn(&self) -> MemoryResult<DbConn> {
        Ok(self.pool.get()?)
    }

    pub fn get_stats(&self, now: &str) -> MemoryResult<DatabaseStats> {
        let conn = self.get_conn()?;
        Ok(migration::get_database_stats(&conn, now)?)
    }

    pub fn usage_extremes(&self, now: &str) -> MemoryResult<UsageExtremes> {
        let conn = self.get_conn()?;
        let pick = |order: &str| -> MemoryResult<Option<(EntityKind, String)>> {
            let sql = format!(
                "SELECT kind, key FROM (
                    SELECT 'user' AS kind, id AS key, COALESCE(last_accessed, updated_at) AS used
                      FROM users WHERE {live}
                    UNION ALL
                    SELECT 'conversation', id, COALESCE(last_accessed, updated_at)
                      FROM conversations WHERE {live}
                    UNION ALL
                    SELECT 'system', key, COALESCE(last_accessed, updated_at)
                      FROM system_memory WHERE {live}
                 ) ORDER BY used {order}, key ASC LIMIT 1",
                live = LIVE_FILTER,
                order = order,
            );
            let row = conn
                .query_row(&sql, rusqlite::named_params! { ":now": now }, |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })
                .optional()?;
            match row {
                Some((kind, key)) => Ok(Some((kind.parse::<EntityKind>()?, key))),
                None => Ok(None),
            }
        };
        Ok(UsageExtremes {
            least_recently_used: pick("ASC")?,
            most_recently_used: pick("DESC")?,
        })
    }

    /// Quarantined rows with their raw payload, for forensic export.
    pub fn quarantined(&self) -> MemoryResult<Vec<QuarantinedEntry>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT 'user', id, 'preferences=' || preferences || ' facts=' || facts,
                    COALESCE(quarantine_reason, '')
               FROM users WHERE quarantined = 1
             UNION ALL
             SELECT 'conversation', id, 'topics=' || topics, COALESCE(quarantine_reason, '')
               FROM conversations WHERE quarantined = 1
             UNION ALL
             SELECT 'system', key, value || ' tags=' || tags, COALESCE(quarantine_reason, '')
               FROM system_memory WHERE quarantined = 1",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|(entity, key, raw_payload, reason)| -> MemoryResult<QuarantinedEntry> {
                Ok(QuarantinedEntry {
                    entity: entity.parse::<EntityKind>()?,
                    key,
                    raw_payload,
                    reason,
                })
            })
            .collect()
    }

    /// Delete a quarantined row. Returns false if the key is not quarantined.
    pub fn release_quarantined(&self, kind: EntityKind, key: &str) -> MemoryResult<bool> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        let quarantined = tx
            .query_row(
                &format!(
                    "SELECT 1 FROM {} WHERE {} = ?1 AND quarantined = 1",
                    kind.table(),
                    kind.key_column()
                ),
                [key],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if quarantined {
            if kind == EntityKind::Conversation {
                tx.execute("DELETE FROM messages WHERE conversation_id = ?1", [key])?;
            }
            tx.execute(
                &format!("DELETE FROM {} WHERE {} = ?1", kind.table(), kind.key_column()),
                [key],
            )?;
        }
        tx.commit()?;
        if quarantined {
            info!("Released quarantined {} entry {}", kind, key);
        }
        Ok(quarantined)
    }

    /// Keys whose `expires_at` has passed as of `now`, quarantined rows included.
    pub fn expired_keys(&self, kind: EntityKind, now: &str) -> MemoryResult<Vec<String>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {key} FROM {table}
             WHERE expires_at IS NOT NULL AND expires_at <= ?1
             ORDER BY expires_at ASC",
            key = kind.key_column(),
            table = kind.table(),
        ))?;
        let keys = stmt
            .query_map([now], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(keys)
    }

    /// Remove one entry if it is still expired. A concurrent rewrite that
    /// extended its lifetime wins. Returns whether a row was removed.
    pub fn delete_expired(&self, kind: EntityKind, key: &str, now: &str) -> MemoryResult<bool> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let removed = purge_if_expired(&tx, kind, key, now)?;
        tx.commit()?;
        Ok(removed)
    }
}

/// Delete `key` (and a conversation's messages) when its expiry has passed.
/// Writers call this before an upsert so an expired row never comes back to life.
pub(crate) fn purge_if_expired(
    conn: &Connection,
    kind: EntityKind,
    key: &str,
    now: &str,
) -> MemoryResult<bool> {
    let expired = conn
        .query_row(
            &format!(
                "SELECT 1 FROM {} WHERE {} = ?1
                 AND expires_at IS NOT NULL AND expires_at <= ?2",
                kind.table(),
                kind.key_column()
            ),
            [key, now],
            |_| Ok(()),
        )
        .optional()?
        .is_some();
    if expired {
        if kind == EntityKind::Conversation {
            conn.execute("DELETE FROM messages WHERE conversation_id = ?1", [key])?;
        }
        conn.execute(
            &format!("DELETE FROM {} WHERE {} = ?1", kind.table(), kind.key_column()),
            [key],
        )?;
    }
    Ok(expired)
}

impl Drop for MemoryDatabase {
    fn drop(&mut self) {
        if let Ok(conn) = self.pool.get() {
            let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
        }
    }
}

/// Current time at storage precision.
#[cfg(test)]
pub(crate) fn test_now() -> chrono::DateTime<chrono::Utc> {
    use chrono::SubsecRound;
    chrono::Utc::now().trunc_subsecs(6)
}

/// Bump access bookkeeping for a live row. Distinguishes absent from quarantined.
pub(crate) fn record_access(
    conn: &Connection,
    kind: EntityKind,
    key: &str,
    now: &str,
) -> MemoryResult<()> {
    let updated = conn.execute(
        &format!(
            "UPDATE {} SET access_count = access_count + 1, last_accessed = :now
             WHERE {} = :key AND {}",
            kind.table(),
            kind.key_column(),
            LIVE_FILTER
        ),
        rusqlite::named_params! { ":now": now, ":key": key },
    )?;
    if updated == 0 {
        return Err(missing_or_corrupt(conn, kind, key)?);
    }
    Ok(())
}

/// Error for a key that failed the live filter.
pub(crate) fn missing_or_corrupt(
    conn: &Connection,
    kind: EntityKind,
    key: &str,
) -> MemoryResult<MemoryError> {
    let reason: Option<Option<String>> = conn
        .query_row(
            &format!(
                "SELECT quarantine_reason FROM {} WHERE {} = ?1 AND quarantined = 1",
                kind.table(),
                kind.key_column()
            ),
            [key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(match reason {
        Some(reason) => MemoryError::corrupt(
            kind.as_str(),
            key,
            reason.unwrap_or_else(|| "quarantined".to_string()),
        ),
        None => MemoryError::not_found(kind.as_str(), key),
    })
}

/// Mark a row corrupt. It stays on disk but drops out of every read path.
pub(crate) fn quarantine_row(
    conn: &Connection,
    kind: EntityKind,
    key: &str,
    reason: &str,
) -> MemoryResult<MemoryError> {
    warn!("Quarantining {} entry {}: {}", kind, key, reason);
    conn.execute(
        &format!(
            "UPDATE {} SET quarantined = 1, quarantine_reason = ?1 WHERE {} = ?2",
            kind.table(),
            kind.key_column()
        ),
        [reason, key],
    )?;
    Ok(MemoryError::corrupt(kind.as_str(), key, reason))
}

/// Raw rows that know their own keyset position.
pub(crate) trait PageRow {
    fn cursor(&self) -> PageCursor;
}

/// Run a filtered keyset scan. Returns at most `page_size` rows plus the
/// cursor for the next page when more rows exist.
pub(crate) fn fetch_page<R, F>(
    conn: &Connection,
    kind: EntityKind,
    columns: &str,
    filter: &QueryFilter,
    now: &str,
    map_row: F,
) -> MemoryResult<(Vec<R>, Option<PageCursor>)>
where
    R: PageRow,
    F: FnMut(&Row<'_>) -> rusqlite::Result<R>,
{
    let page_size = filter.page_size()?;
    let key_col = kind.key_column();
    let table = kind.table();

    let mut clauses = vec![LIVE_FILTER.to_string()];
    let mut params: Vec<(String, Box<dyn ToSql>)> = Vec::new();
    params.push((":now".to_string(), Box::new(now.to_string())));

    if let Some(raw) = &filter.cursor {
        let cursor = PageCursor::decode(raw)?;
        clauses.push(format!(
            "(updated_at < :cursor_ts OR (updated_at = :cursor_ts AND {} > :cursor_key))",
            key_col
        ));
        params.push((":cursor_ts".to_string(), Box::new(cursor.updated_at)));
        params.push((":cursor_key".to_string(), Box::new(cursor.key)));
    }

    if !filter.tags.is_empty() {
        let column = match kind {
            EntityKind::System => "tags",
            EntityKind::Conversation => "topics",
            EntityKind::User => {
                return Err(MemoryError::validation("users do not carry tags"));
            }
        };
        let mut names = Vec::with_capacity(filter.tags.len());
        for (i, tag) in filter.tags.iter().enumerate() {
            let name = format!(":tag{}", i);
            params.push((name.clone(), Box::new(tag.clone())));
            names.push(name);
        }
        clauses.push(format!(
            "json_valid({table}.{column}) AND EXISTS (
                SELECT 1 FROM json_each({table}.{column}) WHERE json_each.value IN ({names}))",
            table = table,
            column = column,
            names = names.join(", "),
        ));
    }

    if let Some(priority) = filter.priority {
        if kind != EntityKind::System {
            return Err(MemoryError::validation("priority filter applies to system entries only"));
        }
        clauses.push("priority = :priority".to_string());
        params.push((":priority".to_string(), Box::new(priority.rank())));
    }

    if let Some(memory_type) = &filter.memory_type {
        if kind != EntityKind::System {
            return Err(MemoryError::validation(
                "memory_type filter applies to system entries only",
            ));
        }
        clauses.push("memory_type = :memory_type".to_string());
        params.push((":memory_type".to_string(), Box::new(memory_type.clone())));
    }

    params.push((":limit".to_string(), Box::new(page_size as i64 + 1)));

    let sql = format!(
        "SELECT {columns} FROM {table} WHERE {where_clause}
         ORDER BY updated_at DESC, {key_col} ASC LIMIT :limit",
        columns = columns,
        table = table,
        where_clause = clauses.join(" AND "),
        key_col = key_col,
    );

    let bound: Vec<(&str, &dyn ToSql)> = params
        .iter()
        .map(|(name, value)| (name.as_str(), value.as_ref()))
        .collect();
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt
        .query_map(bound.as_slice(), map_row)?
        .collect::<rusqlite::Result<Vec<R>>>()?;

    let next = if rows.len() > page_size {
        rows.truncate(page_size);
        rows.last().map(|row| row.cursor())
    } else {
        None
    };
    Ok((rows, next))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_in_memory_pool_shares_one_database() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let now = test_now();
        db.users.touch("u1", &now).unwrap();
        // a second checkout must see the same rows
        assert_eq!(db.get_stats(&ts(&now)).unwrap().users, 1);
    }

    #[test]
    fn test_file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("memory.db");
        let now = test_now();
        {
            let db = MemoryDatabase::new(&path, 4).unwrap();
            db.users.touch("u1", &now).unwrap();
        }
        let db = MemoryDatabase::new(&path, 4).unwrap();
        assert_eq!(db.users.get("u1", &now).unwrap().id, "u1");
    }

    #[test]
    fn test_delete_expired_respects_refresh() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let now = test_now();
        let past = ts(&(now - Duration::seconds(5)));
        db.system
            .put(SystemPut::new("k", "v".into()).expires_at(Some(past)), &now)
            .unwrap();
        let now_s = ts(&now);
        assert_eq!(db.expired_keys(EntityKind::System, &now_s).unwrap(), vec!["k"]);

        // rewritten without expiry before the sweep reaches it
        db.system.put(SystemPut::new("k", "v2".into()), &now).unwrap();
        assert!(!db.delete_expired(EntityKind::System, "k", &now_s).unwrap());
        assert!(db.system.get("k", &now).is_ok());
    }

    #[test]
    fn test_quarantine_release() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let now = test_now();
        db.system.put(SystemPut::new("bad", "v".into()), &now).unwrap();
        {
            let conn = db.get_conn().unwrap();
            conn.execute("UPDATE system_memory SET value = '{oops' WHERE key = 'bad'", [])
                .unwrap();
        }
        assert!(matches!(
            db.system.get("bad", &now),
            Err(MemoryError::CorruptEntry { .. })
        ));
        let listed = db.quarantined().unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].raw_payload.contains("{oops"));

        assert!(db.release_quarantined(EntityKind::System, "bad").unwrap());
        assert!(!db.release_quarantined(EntityKind::System, "bad").unwrap());
        assert!(db.system.get("bad", &now).unwrap_err().is_not_found());
    }

    #[test]
    fn test_usage_extremes() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let t0 = test_now();
        db.system.put(SystemPut::new("old", "v".into()), &t0).unwrap();
        db.system
            .put(SystemPut::new("new", "v".into()), &(t0 + Duration::seconds(1)))
            .unwrap();
        db.system.get("old", &(t0 + Duration::seconds(2))).unwrap();

        let extremes = db.usage_extremes(&ts(&(t0 + Duration::seconds(3)))).unwrap();
        assert_eq!(extremes.least_recently_used, Some((EntityKind::System, "new".into())));
        assert_eq!(extremes.most_recently_used, Some((EntityKind::System, "old".into())));
    }
}
