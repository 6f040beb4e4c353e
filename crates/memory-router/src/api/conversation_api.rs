// Conversation transcript endpoints: append-only messages and ordered reads
use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;
use validator::Validate;

use crate::api::ApiResult;
use crate::memory_db::{Message, MessageRole, NewMessage};
use crate::shared_state::AppState;

const DEFAULT_MESSAGE_LIMIT: usize = 100;

#[derive(Debug, Deserialize, Validate)]
pub struct AppendMessageRequest {
    pub role: MessageRole,
    #[validate(length(min = 1, max = 65536))]
    pub content: String,
    #[validate(range(min = 0))]
    pub tokens: Option<i64>,
    pub model: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct MessagesQuery {
    #[validate(range(min = 1, max = 1000))]
    pub limit: Option<usize>,
}

/// Append a message, creating the conversation on first contact.
pub async fn append_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<AppendMessageRequest>,
) -> ApiResult<Json<Message>> {
    req.validate()?;
    let message = NewMessage {
        role: req.role,
        content: req.content,
        tokens: req.tokens,
        model: req.model,
        metadata: req.metadata,
    };
    let stored = state.store.append_message(&id, message).await?;
    debug!("Appended message {} to {}", stored.seq, id);
    Ok(Json(stored))
}

/// Most recent messages, oldest first.
pub async fn get_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<MessagesQuery>,
) -> ApiResult<Json<Vec<Message>>> {
    params.validate()?;
    let limit = params.limit.unwrap_or(DEFAULT_MESSAGE_LIMIT);
    Ok(Json(state.store.conversation_messages(&id, limit).await?))
}
