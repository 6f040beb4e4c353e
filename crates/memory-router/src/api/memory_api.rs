//! Generic entry CRUD, paged queries, stats, sweeps, and quarantine

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use validator::Validate;

use crate::api::{ApiError, ApiResult};
use crate::error::MemoryError;
use crate::memory::{MemoryStats, PutOptions, SweepReport};
use crate::memory_db::{EntityKind, MemoryRecord, Page, Priority, QuarantinedEntry, QueryFilter};
use crate::shared_state::AppState;

#[derive(Debug, Deserialize, Validate)]
pub struct PutEntryRequest {
    pub value: Value,
    pub ttl_seconds: Option<u64>,
    pub expires_at: Option<DateTime<Utc>>,
    pub priority: Option<Priority>,
    #[serde(default)]
    #[validate(length(max = 64))]
    pub tags: Vec<String>,
    #[validate(length(min = 1, max = 64))]
    pub memory_type: Option<String>,
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct QueryRequest {
    pub entity: Option<EntityKind>,
    pub memory_type: Option<String>,
    #[serde(default)]
    #[validate(length(max = 64))]
    pub tags: Vec<String>,
    pub priority: Option<Priority>,
    #[validate(range(min = 1, max = 1000))]
    pub limit: Option<usize>,
    pub cursor: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub deleted: bool,
}

fn parse_entity(raw: &str) -> ApiResult<EntityKind> {
    Ok(raw.parse::<EntityKind>()?)
}

pub async fn memory_stats(State(state): State<AppState>) -> ApiResult<Json<MemoryStats>> {
    Ok(Json(state.store.stats().await?))
}

/// Defaults to system entries when `entity` is omitted.
pub async fn query_memory(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> ApiResult<Json<Page<MemoryRecord>>> {
    req.validate()?;
    let entity = req.entity.unwrap_or(EntityKind::System);
    let filter = QueryFilter {
        tags: req.tags,
        priority: req.priority,
        memory_type: req.memory_type,
        limit: req.limit,
        cursor: req.cursor,
    };
    Ok(Json(state.store.query(entity, filter).await?))
}

pub async fn put_entry(
    State(state): State<AppState>,
    Path((entity, key)): Path<(String, String)>,
    Json(req): Json<PutEntryRequest>,
) -> ApiResult<Json<MemoryRecord>> {
    req.validate()?;
    let entity = parse_entity(&entity)?;
    let options = PutOptions {
        ttl_seconds: req.ttl_seconds,
        expires_at: req.expires_at,
        priority: req.priority,
        tags: req.tags,
        memory_type: req.memory_type,
    };
    Ok(Json(state.store.put(entity, &key, req.value, options).await?))
}

pub async fn get_entry(
    State(state): State<AppState>,
    Path((entity, key)): Path<(String, String)>,
) -> ApiResult<Json<MemoryRecord>> {
    let entity = parse_entity(&entity)?;
    Ok(Json(state.store.get(entity, &key).await?))
}

pub async fn delete_entry(
    State(state): State<AppState>,
    Path((entity, key)): Path<(String, String)>,
) -> ApiResult<Json<DeleteResponse>> {
    let entity = parse_entity(&entity)?;
    let deleted = state.store.delete(entity, &key).await?;
    Ok(Json(DeleteResponse { deleted }))
}

pub async fn sweep(State(state): State<AppState>) -> ApiResult<Json<SweepReport>> {
    let report = state.engine.sweep_now().await?;
    info!("Manual sweep removed {} entries", report.removed());
    Ok(Json(report))
}

pub async fn list_quarantine(State(state): State<AppState>) -> ApiResult<Json<Vec<QuarantinedEntry>>> {
    Ok(Json(state.store.quarantined().await?))
}

pub async fn release_quarantine(
    State(state): State<AppState>,
    Path((entity, key)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let entity = parse_entity(&entity)?;
    if state.store.release_quarantined(entity, &key).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::from(MemoryError::not_found(
            format!("quarantined {}", entity),
            key,
        )))
    }
}
