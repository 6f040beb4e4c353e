//! Single-row "current" pointers, one per scope.
//!
//! Each write bumps `version`, so readers can tell two activations of the same
//! target apart and the last writer is unambiguous.

use crate::error::MemoryResult;
use crate::memory_db::schema::parse_required_ts;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

pub const ROUTER_SCOPE: &str = "router";
pub const SYSTEM_PROMPT_SCOPE: &str = "system_prompt";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivePointer {
    pub scope: String,
    pub target_key: Option<String>,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

pub(crate) fn read(conn: &Connection, scope: &str) -> MemoryResult<Option<ActivePointer>> {
    let row = conn
        .query_row(
            "SELECT scope, target_key, version, updated_at FROM active_pointers WHERE scope = ?1",
            [scope],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )
        .optional()?;
    match row {
        Some((scope, target_key, version, updated_at)) => Ok(Some(ActivePointer {
            scope,
            target_key,
            version,
            updated_at: parse_required_ts(&updated_at)?,
        })),
        None => Ok(None),
    }
}

pub(crate) fn active_target(conn: &Connection, scope: &str) -> MemoryResult<Option<String>> {
    Ok(read(conn, scope)?.and_then(|p| p.target_key))
}

/// Point `scope` at `target` (or at nothing) and return the new version.
/// Call inside an IMMEDIATE transaction.
pub(crate) fn set(
    conn: &Connection,
    scope: &str,
    target: Option<&str>,
    now: &str,
) -> MemoryResult<i64> {
    conn.execute(
        "INSERT INTO active_pointers (scope, target_key, version, updated_at)
         VALUES (?1, ?2, 1, ?3)
         ON CONFLICT(scope) DO UPDATE SET
             target_key = excluded.target_key,
             version = active_pointers.version + 1,
             updated_at = excluded.updated_at",
        params![scope, target, now],
    )?;
    let version = conn.query_row(
        "SELECT version FROM active_pointers WHERE scope = ?1",
        [scope],
        |row| row.get(0),
    )?;
    Ok(version)
}
