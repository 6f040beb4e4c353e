//! Entity definitions shared by the store, the registry, and the router

use crate::error::{MemoryError, MemoryResult};
use crate::memory::value::MemoryValue;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Keyed entity collections managed by the memory store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    User,
    Conversation,
    System,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [EntityKind::User, EntityKind::Conversation, EntityKind::System];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::User => "user",
            EntityKind::Conversation => "conversation",
            EntityKind::System => "system",
        }
    }

    pub(crate) fn table(&self) -> &'static str {
        match self {
            EntityKind::User => "users",
            EntityKind::Conversation => "conversations",
            EntityKind::System => "system_memory",
        }
    }

    pub(crate) fn key_column(&self) -> &'static str {
        match self {
            EntityKind::System => "key",
            _ => "id",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "user" | "users" | "user_context" => Ok(EntityKind::User),
            "conversation" | "conversations" => Ok(EntityKind::Conversation),
            "system" | "system_memory" => Ok(EntityKind::System),
            other => Err(MemoryError::validation(format!("unknown entity type: {}", other))),
        }
    }
}

/// Retention priority. Ordering is significant: lower ranks are reclaimed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    /// Never selected by pressure eviction.
    Critical,
}

impl Priority {
    pub fn rank(&self) -> i64 {
        match self {
            Priority::Low => 0,
            Priority::Medium => 1,
            Priority::High => 2,
            Priority::Critical => 3,
        }
    }

    pub fn from_rank(rank: i64) -> Option<Self> {
        match rank {
            0 => Some(Priority::Low),
            1 => Some(Priority::Medium),
            2 => Some(Priority::High),
            3 => Some(Priority::Critical),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

impl FromStr for Priority {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(MemoryError::validation(format!("unknown priority: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }
}

impl FromStr for MessageRole {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            "system" => Ok(MessageRole::System),
            other => Err(MemoryError::validation(format!("unknown message role: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub display_name: Option<String>,
    pub preferences: Map<String, Value>,
    pub facts: Vec<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub access_count: i64,
    pub last_accessed: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    /// Lookup-only reference; the user does not own the conversation.
    pub user_id: Option<String>,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub topics: Vec<String>,
    pub total_tokens: i64,
    pub message_count: i64,
    pub model: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub access_count: i64,
    pub last_accessed: Option<DateTime<Utc>>,
}

/// Append-only transcript line, destroyed with its conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub seq: i64,
    pub role: MessageRole,
    pub content: String,
    pub tokens: i64,
    pub model: Option<String>,
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemMemoryEntry {
    pub key: String,
    pub value: MemoryValue,
    pub memory_type: String,
    pub priority: Priority,
    pub tags: Vec<String>,
    pub access_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_accessed: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterClass {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Expected outcome of a few-shot example.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpectedRoute {
    pub class: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterExample {
    pub query: String,
    pub expected: ExpectedRoute,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterSchema {
    pub key: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub classes: Vec<RouterClass>,
    pub examples: Vec<RouterExample>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Pointer version at the most recent activation; `None` while still a draft.
    pub last_activated_version: Option<i64>,
}

/// Entry retained for forensic export after its payload failed to decode.
#[derive(Debug, Clone, Serialize)]
pub struct QuarantinedEntry {
    pub entity: EntityKind,
    pub key: String,
    pub raw_payload: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DatabaseStats {
    pub users: i64,
    pub conversations: i64,
    pub messages: i64,
    pub system_entries: i64,
    pub router_schemas: i64,
    pub quarantined: i64,
    pub database_size_bytes: i64,
}

/// Canonical timestamp encoding. Fixed width, so lexical order equals time order.
pub fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_datetime_safe(datetime_str: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(datetime_str) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(datetime_str, "%Y-%m-%d %H:%M:%S") {
        return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(datetime_str, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
    }
    None
}

pub(crate) fn parse_required_ts(raw: &str) -> MemoryResult<DateTime<Utc>> {
    parse_datetime_safe(raw).ok_or_else(|| MemoryError::storage(format!("unparseable timestamp: {}", raw)))
}

pub(crate) fn parse_optional_ts(raw: Option<String>) -> MemoryResult<Option<DateTime<Utc>>> {
    raw.map(|s| parse_required_ts(&s)).transpose()
}

/// Any keyed entity, tagged by collection for mixed listings.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "entity", rename_all = "snake_case")]
pub enum MemoryRecord {
    User(User),
    Conversation(Conversation),
    System(SystemMemoryEntry),
}

impl MemoryRecord {
    pub fn kind(&self) -> EntityKind {
        match self {
            MemoryRecord::User(_) => EntityKind::User,
            MemoryRecord::Conversation(_) => EntityKind::Conversation,
            MemoryRecord::System(_) => EntityKind::System,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            MemoryRecord::User(u) => &u.id,
            MemoryRecord::Conversation(c) => &c.id,
            MemoryRecord::System(s) => &s.key,
        }
    }

    pub fn access_count(&self) -> i64 {
        match self {
            MemoryRecord::User(u) => u.access_count,
            MemoryRecord::Conversation(c) => c.access_count,
            MemoryRecord::System(s) => s.access_count,
        }
    }
}

pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const MAX_PAGE_SIZE: usize = 1000;

/// Filter for paged scans. `tags` is any-match; for conversations it matches topics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryFilter {
    #[serde(default)]
    pub tags: Vec<String>,
    pub priority: Option<Priority>,
    pub memory_type: Option<String>,
    pub limit: Option<usize>,
    pub cursor: Option<String>,
}

impl QueryFilter {
    pub fn page_size(&self) -> MemoryResult<usize> {
        match self.limit {
            None => Ok(DEFAULT_PAGE_SIZE),
            Some(0) => Err(MemoryError::validation("limit must be at least 1")),
            Some(n) if n > MAX_PAGE_SIZE => Err(MemoryError::validation(format!(
                "limit must be at most {}",
                MAX_PAGE_SIZE
            ))),
            Some(n) => Ok(n),
        }
    }
}

/// Keyset position: the last row of the previous page in `(updated_at desc, key asc)` order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageCursor {
    pub updated_at: String,
    pub key: String,
}

impl PageCursor {
    pub fn encode(&self) -> String {
        format!("{}|{}", self.updated_at, self.key)
    }

    pub fn decode(raw: &str) -> MemoryResult<Self> {
        let invalid = || MemoryError::validation(format!("invalid cursor: {}", raw));
        let (updated_at, key) = raw.split_once('|').ok_or_else(invalid)?;
        if parse_datetime_safe(updated_at).is_none() || key.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            updated_at: updated_at.to_string(),
            key: key.to_string(),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub entries: Vec<T>,
    pub next_cursor: Option<String>,
}

impl<T> Page<T> {
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            entries: self.entries.into_iter().map(f).collect(),
            next_cursor: self.next_cursor,
        }
    }
}
