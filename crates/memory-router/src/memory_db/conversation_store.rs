//! Conversation storage operations: transcripts, topic tags, and TTL

use crate::error::{MemoryError, MemoryResult};
use crate::memory_db::schema::*;
use crate::memory_db::{
    fetch_page, missing_or_corrupt, purge_if_expired, quarantine_row, record_access, DbConn,
    DbPool, PageRow, LIVE_FILTER,
};
use crate::utils::TopicExtractor;
use chrono::{DateTime, Utc};
use rusqlite::{named_params, params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

const CONVERSATION_COLUMNS: &str = "id, user_id, title, summary, topics, total_tokens,
     message_count, model, created_at, updated_at, expires_at, access_count, last_accessed";

const MESSAGE_COLUMNS: &str =
    "id, conversation_id, seq, role, content, tokens, model, metadata, created_at";

/// Upper bound on topic tags kept per conversation.
const MAX_TOPICS: usize = 12;

/// Replacement metadata for a conversation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConversationUpdate {
    pub user_id: Option<String>,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub role: MessageRole,
    pub content: String,
    #[serde(default)]
    pub tokens: Option<i64>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl NewMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tokens: None,
            model: None,
            metadata: Map::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    /// Whitespace word count when the caller did not supply a token count.
    fn token_count(&self) -> i64 {
        self.tokens
            .unwrap_or_else(|| self.content.split_whitespace().count() as i64)
    }
}

struct RawConversation {
    id: String,
    user_id: Option<String>,
    title: Option<String>,
    summary: Option<String>,
    topics: String,
    total_tokens: i64,
    message_count: i64,
    model: Option<String>,
    created_at: String,
    updated_at: String,
    expires_at: Option<String>,
    access_count: i64,
    last_accessed: Option<String>,
}

impl RawConversation {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            title: row.get(2)?,
            summary: row.get(3)?,
            topics: row.get(4)?,
            total_tokens: row.get(5)?,
            message_count: row.get(6)?,
            model: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
            expires_at: row.get(10)?,
            access_count: row.get(11)?,
            last_accessed: row.get(12)?,
        })
    }

    fn decode(self) -> Result<Conversation, String> {
        let topics: Vec<String> =
            serde_json::from_str(&self.topics).map_err(|e| format!("topics: {}", e))?;
        let parse = |raw: &str| parse_datetime_safe(raw).ok_or_else(|| format!("bad timestamp {}", raw));
        let parse_opt = |raw: &Option<String>| raw.as_deref().map(parse).transpose();
        Ok(Conversation {
            created_at: parse(&self.created_at)?,
            updated_at: parse(&self.updated_at)?,
            expires_at: parse_opt(&self.expires_at)?,
            last_accessed: parse_opt(&self.last_accessed)?,
            id: self.id,
            user_id: self.user_id,
            title: self.title,
            summary: self.summary,
            topics,
            total_tokens: self.total_tokens,
            message_count: self.message_count,
            model: self.model,
            access_count: self.access_count,
        })
    }
}

impl PageRow for RawConversation {
    fn cursor(&self) -> PageCursor {
        PageCursor {
            updated_at: self.updated_at.clone(),
            key: self.id.clone(),
        }
    }
}

struct RawMessage {
    id: String,
    conversation_id: String,
    seq: i64,
    role: String,
    content: String,
    tokens: i64,
    model: Option<String>,
    metadata: String,
    created_at: String,
}

impl RawMessage {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            seq: row.get(2)?,
            role: row.get(3)?,
            content: row.get(4)?,
            tokens: row.get(5)?,
            model: row.get(6)?,
            metadata: row.get(7)?,
            created_at: row.get(8)?,
        })
    }

    fn decode(self) -> Result<Message, String> {
        let role = self
            .role
            .parse::<MessageRole>()
            .map_err(|e| format!("message {}: {}", self.seq, e))?;
        let metadata: Map<String, Value> = serde_json::from_str(&self.metadata)
            .map_err(|e| format!("message {} metadata: {}", self.seq, e))?;
        let created_at = parse_datetime_safe(&self.created_at)
            .ok_or_else(|| format!("message {} has bad timestamp", self.seq))?;
        Ok(Message {
            id: self.id,
            conversation_id: self.conversation_id,
            seq: self.seq,
            role,
            content: self.content,
            tokens: self.tokens,
            model: self.model,
            metadata,
            created_at,
        })
    }
}

pub struct ConversationStore {
    pool: Arc<DbPool>,
    topics: TopicExtractor,
}

impl ConversationStore {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self {
            pool,
            topics: TopicExtractor::default(),
        }
    }

    fn get_conn(&self) -> MemoryResult<DbConn> {
        Ok(self.pool.get()?)
    }

    /// Upsert conversation metadata. Counters and the transcript are kept;
    /// `expires_at` is replaced (None clears any prior expiry). An expired
    /// conversation is discarded first, so the upsert starts a fresh one.
    pub fn put(
        &self,
        id: &str,
        update: ConversationUpdate,
        topics: Vec<String>,
        expires_at: Option<String>,
        now: &DateTime<Utc>,
    ) -> MemoryResult<Conversation> {
        let now_s = ts(now);
        let topics = serde_json::to_string(&topics).map_err(MemoryError::storage)?;
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if purge_if_expired(&tx, EntityKind::Conversation, id, &now_s)? {
            debug!("Discarded expired conversation {} before upsert", id);
        }
        tx.execute(
            "INSERT INTO conversations
             (id, user_id, title, summary, topics, model, created_at, updated_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                 user_id = excluded.user_id,
                 title = excluded.title,
                 summary = excluded.summary,
                 topics = excluded.topics,
                 model = excluded.model,
                 updated_at = excluded.updated_at,
                 expires_at = excluded.expires_at,
                 quarantined = 0,
                 quarantine_reason = NULL",
            params![
                id,
                update.user_id,
                update.title,
                update.summary,
                topics,
                update.model,
                now_s,
                expires_at,
            ],
        )?;
        let conversation = load(&tx, id)?;
        tx.commit()?;
        debug!("Stored conversation {}", id);
        Ok(conversation)
    }

    /// The user a live conversation is attributed to. No access bookkeeping.
    pub fn owner(&self, id: &str, now: &DateTime<Utc>) -> MemoryResult<Option<String>> {
        let conn = self.get_conn()?;
        let owner: Option<Option<String>> = conn
            .query_row(
                &format!("SELECT user_id FROM conversations WHERE id = :id AND {}", LIVE_FILTER),
                named_params! { ":id": id, ":now": ts(now) },
                |row| row.get(0),
            )
            .optional()?;
        Ok(owner.flatten())
    }

    /// Logical read: bumps `access_count` and `last_accessed`.
    pub fn get(&self, id: &str, now: &DateTime<Utc>) -> MemoryResult<Conversation> {
        let now_s = ts(now);
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        // Decode first: a corrupt row is quarantined without counting as an access.
        if let Err(e) = load(&tx, id) {
            tx.commit()?;
            return Err(e);
        }
        record_access(&tx, EntityKind::Conversation, id, &now_s)?;
        let conversation = load(&tx, id)?;
        tx.commit()?;
        Ok(conversation)
    }

    /// Append one message. Creates the conversation on first message; an
    /// expired-but-unswept conversation is replaced by a fresh one.
    pub fn append_message(
        &self,
        conversation_id: &str,
        message: NewMessage,
        now: &DateTime<Utc>,
    ) -> MemoryResult<Message> {
        if conversation_id.trim().is_empty() {
            return Err(MemoryError::validation("conversation id must not be empty"));
        }
        if message.content.trim().is_empty() {
            return Err(MemoryError::validation("message content must not be empty"));
        }
        let now_s = ts(now);
        let tokens = message.token_count();
        if tokens < 0 {
            return Err(MemoryError::validation("tokens must not be negative"));
        }
        let metadata = serde_json::to_string(&message.metadata).map_err(MemoryError::storage)?;

        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if purge_if_expired(&tx, EntityKind::Conversation, conversation_id, &now_s)? {
            debug!("Replaced expired conversation {}", conversation_id);
        }
        tx.execute(
            "INSERT OR IGNORE INTO conversations (id, created_at, updated_at) VALUES (?1, ?2, ?2)",
            params![conversation_id, now_s],
        )?;

        let existing = match load(&tx, conversation_id) {
            Ok(conversation) => conversation,
            Err(e) => {
                // keep the quarantine mark
                tx.commit()?;
                return Err(e);
            }
        };

        let seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE conversation_id = ?1",
            [conversation_id],
            |row| row.get(0),
        )?;
        let id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO messages
             (id, conversation_id, seq, role, content, tokens, model, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                id,
                conversation_id,
                seq,
                message.role.as_str(),
                message.content,
                tokens,
                message.model,
                metadata,
                now_s,
            ],
        )?;

        let topics = if message.role == MessageRole::User {
            self.topics.merge(&existing.topics, &message.content, MAX_TOPICS)
        } else {
            existing.topics.clone()
        };
        let topics = serde_json::to_string(&topics).map_err(MemoryError::storage)?;
        tx.execute(
            "UPDATE conversations SET
                 message_count = message_count + 1,
                 total_tokens = total_tokens + ?1,
                 model = COALESCE(?2, model),
                 topics = ?3,
                 updated_at = ?4
             WHERE id = ?5",
            params![tokens, message.model, topics, now_s, conversation_id],
        )?;
        tx.commit()?;

        Ok(Message {
            id,
            conversation_id: conversation_id.to_string(),
            seq,
            role: message.role,
            content: message.content,
            tokens,
            model: message.model,
            metadata: message.metadata,
            created_at: *now,
        })
    }

    /// The last `limit` messages, oldest first. A logical read of the conversation.
    pub fn messages(
        &self,
        conversation_id: &str,
        limit: usize,
        now: &DateTime<Utc>,
    ) -> MemoryResult<Vec<Message>> {
        let now_s = ts(now);
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let messages = match load_messages(&tx, conversation_id, limit) {
            Ok(messages) => messages,
            Err(e) => {
                tx.commit()?;
                return Err(e);
            }
        };
        record_access(&tx, EntityKind::Conversation, conversation_id, &now_s)?;
        tx.commit()?;
        Ok(messages)
    }

    /// The last `n` messages, oldest first, without access bookkeeping.
    /// Absent, expired, or quarantined conversations yield an empty list.
    pub fn recent_messages(
        &self,
        conversation_id: &str,
        n: usize,
        now: &DateTime<Utc>,
    ) -> MemoryResult<Vec<Message>> {
        let conn = self.get_conn()?;
        let live = conn
            .query_row(
                &format!("SELECT 1 FROM conversations WHERE id = :id AND {}", LIVE_FILTER),
                named_params! { ":id": conversation_id, ":now": ts(now) },
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if !live {
            return Ok(Vec::new());
        }
        load_messages(&conn, conversation_id, n)
    }

    /// Remove the conversation and its messages atomically. Idempotent.
    pub fn delete(&self, id: &str) -> MemoryResult<bool> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let messages = tx.execute("DELETE FROM messages WHERE conversation_id = ?1", [id])?;
        let removed = tx.execute("DELETE FROM conversations WHERE id = ?1", [id])? > 0;
        tx.commit()?;
        if removed {
            info!("Deleted conversation {} with {} messages", id, messages);
        }
        Ok(removed)
    }

    pub fn query(
        &self,
        filter: &QueryFilter,
        now: &DateTime<Utc>,
    ) -> MemoryResult<Page<Conversation>> {
        let conn = self.get_conn()?;
        let (rows, next) = fetch_page(
            &conn,
            EntityKind::Conversation,
            CONVERSATION_COLUMNS,
            filter,
            &ts(now),
            RawConversation::from_row,
        )?;
        let mut entries = Vec::with_capacity(rows.len());
        for raw in rows {
            let id = raw.id.clone();
            match raw.decode() {
                Ok(conversation) => entries.push(conversation),
                Err(reason) => {
                    quarantine_row(&conn, EntityKind::Conversation, &id, &reason)?;
                }
            }
        }
        Ok(Page {
            entries,
            next_cursor: next.map(|c| c.encode()),
        })
    }
}

/// Non-tracking read of a non-quarantined conversation.
fn load(conn: &Connection, id: &str) -> MemoryResult<Conversation> {
    let raw = conn
        .query_row(
            &format!(
                "SELECT {} FROM conversations WHERE id = ?1 AND quarantined = 0",
                CONVERSATION_COLUMNS
            ),
            [id],
            RawConversation::from_row,
        )
        .optional()?;
    match raw {
        Some(raw) => match raw.decode() {
            Ok(conversation) => Ok(conversation),
            Err(reason) => Err(quarantine_row(conn, EntityKind::Conversation, id, &reason)?),
        },
        None => Err(missing_or_corrupt(conn, EntityKind::Conversation, id)?),
    }
}

/// An undecodable message quarantines its whole conversation.
fn load_messages(conn: &Connection, conversation_id: &str, limit: usize) -> MemoryResult<Vec<Message>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM (
             SELECT * FROM messages WHERE conversation_id = ?1 ORDER BY seq DESC LIMIT ?2
         ) ORDER BY seq ASC",
        MESSAGE_COLUMNS
    ))?;
    let rows = stmt
        .query_map(params![conversation_id, limit as i64], RawMessage::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    let mut messages = Vec::with_capacity(rows.len());
    for raw in rows {
        match raw.decode() {
            Ok(message) => messages.push(message),
            Err(reason) => {
                return Err(quarantine_row(
                    conn,
                    EntityKind::Conversation,
                    conversation_id,
                    &reason,
                )?);
            }
        }
    }
    Ok(messages)
}
