// System prompt library with a single active prompt
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use validator::Validate;

use crate::api::router_api::DeactivateResponse;
use crate::api::{ApiError, ApiResult};
use crate::error::MemoryError;
use crate::router::{ActivePrompt, PromptDraft, SystemPrompt};
use crate::shared_state::AppState;

#[derive(Debug, Deserialize, Validate)]
pub struct SavePromptRequest {
    #[validate(length(min = 1, max = 255))]
    pub key: String,
    #[validate(length(min = 1))]
    pub content: String,
    #[validate(length(max = 255))]
    pub title: Option<String>,
    pub description: Option<String>,
    pub model: Option<String>,
}

pub async fn list_prompts(State(state): State<AppState>) -> ApiResult<Json<Vec<SystemPrompt>>> {
    Ok(Json(state.prompts.list().await?))
}

pub async fn save_prompt(
    State(state): State<AppState>,
    Json(req): Json<SavePromptRequest>,
) -> ApiResult<(StatusCode, Json<SystemPrompt>)> {
    req.validate()?;
    let draft = PromptDraft {
        content: req.content,
        title: req.title,
        description: req.description,
        model: req.model,
    };
    let prompt = state.prompts.save(&req.key, draft).await?;
    Ok((StatusCode::CREATED, Json(prompt)))
}

pub async fn get_prompt(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<Json<SystemPrompt>> {
    Ok(Json(state.prompts.get(&key).await?))
}

pub async fn get_active_prompt(State(state): State<AppState>) -> ApiResult<Json<ActivePrompt>> {
    state
        .prompts
        .get_active()
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::from(MemoryError::not_found("system_prompt", "(active)")))
}

pub async fn activate_prompt(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<Json<ActivePrompt>> {
    Ok(Json(state.prompts.activate(&key).await?))
}

pub async fn deactivate_prompt(State(state): State<AppState>) -> ApiResult<Json<DeactivateResponse>> {
    let previous = state.prompts.deactivate().await?;
    Ok(Json(DeactivateResponse { previous }))
}

pub async fn delete_prompt(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<StatusCode> {
    state.prompts.delete(&key).await?;
    Ok(StatusCode::NO_CONTENT)
}
