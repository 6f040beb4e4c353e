//! Database migration system

use rusqlite::{Connection, OptionalExtension, Result};
use tracing::{error, info, warn};

use crate::memory_db::schema;

/// Manages database schema migrations
pub struct MigrationManager<'a> {
    conn: &'a mut Connection,
}

impl<'a> MigrationManager<'a> {
    pub fn new(conn: &'a mut Connection) -> Self {
        Self { conn }
    }

    /// Initialize database with current schema
    pub fn initialize_database(&mut self) -> Result<()> {
        info!("Initializing memory database schema...");

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        let current_version = self.get_current_version()?;
        info!("Current database schema version: {}", current_version);

        self.apply_migrations(current_version)?;
        Ok(())
    }

    fn apply_migrations(&mut self, current_version: i32) -> Result<()> {
        for (version, migration_sql) in get_migrations() {
            if version > current_version {
                info!("Applying migration {}...", version);

                let tx = self.conn.transaction()?;
                if let Err(e) = tx.execute_batch(migration_sql) {
                    error!("Failed to apply migration {}: {}", version, e);
                    return Err(e);
                }
                tx.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
                tx.commit()?;

                info!("Migration {} applied successfully", version);
            }
        }
        Ok(())
    }

    pub fn get_current_version(&self) -> Result<i32> {
        self.conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .or(Ok(0))
    }

    pub fn has_migration_applied(&self, version: i32) -> Result<bool> {
        self.conn
            .query_row(
                "SELECT 1 FROM schema_version WHERE version = ?",
                [version],
                |_| Ok(1),
            )
            .optional()
            .map(|result| result.is_some())
    }
}

fn get_migrations() -> Vec<(i32, &'static str)> {
    vec![
        (1, include_str!("migrations/001_initial.sql")),
        (2, include_str!("migrations/002_router_schemas.sql")),
    ]
}

/// Row counts and file size. Counts include only live, non-quarantined rows
/// as of `now`.
pub fn get_database_stats(conn: &Connection, now: &str) -> Result<schema::DatabaseStats> {
    fn count(conn: &Connection, sql: &str, now: Option<&str>) -> Result<i64> {
        let result = match now {
            Some(now) => conn.query_row(sql, [now], |row| row.get(0)),
            None => conn.query_row(sql, [], |row| row.get(0)),
        };
        result.or_else(|e| {
            warn!("Failed to count rows ({}): {}", sql, e);
            Ok(0)
        })
    }

    let users = count(conn, "SELECT COUNT(*) FROM users WHERE quarantined = 0", None)?;
    let conversations = count(
        conn,
        "SELECT COUNT(*) FROM conversations
         WHERE quarantined = 0 AND (expires_at IS NULL OR expires_at > ?1)",
        Some(now),
    )?;
    let messages = count(
        conn,
        "SELECT COUNT(*) FROM messages m JOIN conversations c ON m.conversation_id = c.id
         WHERE c.quarantined = 0 AND (c.expires_at IS NULL OR c.expires_at > ?1)",
        Some(now),
    )?;
    let system_entries = count(
        conn,
        "SELECT COUNT(*) FROM system_memory
         WHERE quarantined = 0 AND (expires_at IS NULL OR expires_at > ?1)",
        Some(now),
    )?;
    let router_schemas = count(conn, "SELECT COUNT(*) FROM router_schemas", None)?;
    let quarantined = count(
        conn,
        "SELECT (SELECT COUNT(*) FROM users WHERE quarantined = 1)
              + (SELECT COUNT(*) FROM conversations WHERE quarantined = 1)
              + (SELECT COUNT(*) FROM system_memory WHERE quarantined = 1)",
        None,
    )?;

    let database_size_bytes: i64 = conn
        .query_row(
            "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    Ok(schema::DatabaseStats {
        users,
        conversations,
        messages,
        system_entries,
        router_schemas,
        quarantined,
        database_size_bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        MigrationManager::new(&mut conn).initialize_database().unwrap();
        MigrationManager::new(&mut conn).initialize_database().unwrap();

        let migrator = MigrationManager::new(&mut conn);
        assert_eq!(migrator.get_current_version().unwrap(), 2);
        assert!(migrator.has_migration_applied(1).unwrap());
        assert!(!migrator.has_migration_applied(3).unwrap());
    }

    #[test]
    fn test_stats_on_empty_database() {
        let mut conn = Connection::open_in_memory().unwrap();
        MigrationManager::new(&mut conn).initialize_database().unwrap();
        let stats = get_database_stats(&conn, "2024-01-01T00:00:00.000000Z").unwrap();
        assert_eq!(stats.users, 0);
        assert_eq!(stats.messages, 0);
        assert_eq!(stats.quarantined, 0);
    }
}
