// User profile endpoints: facts, preference merges, first contact, purge
use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;
use validator::Validate;

use crate::api::ApiResult;
use crate::memory_db::{PurgeReport, User};
use crate::shared_state::AppState;

#[derive(Debug, Deserialize, Validate)]
pub struct AddFactRequest {
    #[validate(length(min = 1, max = 1024))]
    pub fact: String,
}

#[derive(Debug, Serialize)]
pub struct AddFactResponse {
    #[serde(flatten)]
    pub user: User,
    pub added: bool,
}

#[derive(Debug, Deserialize)]
pub struct PreferencesRequest {
    pub preferences: Map<String, Value>,
}

pub async fn add_fact(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<AddFactRequest>,
) -> ApiResult<Json<AddFactResponse>> {
    req.validate()?;
    let (user, added) = state.store.add_user_fact(&id, &req.fact).await?;
    Ok(Json(AddFactResponse { user, added }))
}

/// Shallow merge into the stored preferences.
pub async fn update_preferences(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<PreferencesRequest>,
) -> ApiResult<Json<User>> {
    Ok(Json(state.store.update_user_preferences(&id, req.preferences).await?))
}

pub async fn touch_user(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<User>> {
    Ok(Json(state.store.touch_user(&id).await?))
}

/// Remove the user and every conversation attributed to them.
pub async fn purge_user(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<PurgeReport>> {
    let report = state.store.purge_user(&id).await?;
    info!(
        "Purged user {} ({} conversations)",
        id, report.conversations_deleted
    );
    Ok(Json(report))
}
