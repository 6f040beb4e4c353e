// Router schema administration and query routing
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use validator::Validate;

use crate::api::{ApiError, ApiResult};
use crate::error::MemoryError;
use crate::memory_db::{RouterSchema, SchemaDraft};
use crate::router::{ActiveSchema, RouteRequest, RouteResult, SchemaSummary};
use crate::shared_state::AppState;

#[derive(Debug, Serialize)]
pub struct DeactivateResponse {
    pub previous: Option<String>,
}

#[derive(Debug, Validate, serde::Deserialize)]
pub struct RouteBody {
    #[validate(length(min = 1, max = 8192))]
    pub query: String,
    #[validate(length(min = 1, max = 255))]
    pub schema_key: Option<String>,
    pub conversation_id: Option<String>,
}

pub async fn list_schemas(State(state): State<AppState>) -> ApiResult<Json<Vec<SchemaSummary>>> {
    Ok(Json(state.schemas.list().await?))
}

pub async fn save_schema(
    State(state): State<AppState>,
    Json(draft): Json<SchemaDraft>,
) -> ApiResult<(StatusCode, Json<RouterSchema>)> {
    let schema = state.schemas.create_or_update(draft).await?;
    Ok((StatusCode::CREATED, Json(schema)))
}

pub async fn get_schema(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<Json<RouterSchema>> {
    Ok(Json(state.schemas.get(&key).await?))
}

pub async fn get_active_schema(State(state): State<AppState>) -> ApiResult<Json<ActiveSchema>> {
    state
        .schemas
        .get_active()
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::from(MemoryError::not_found("router_schema", "(active)")))
}

pub async fn activate_schema(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<Json<ActiveSchema>> {
    Ok(Json(state.schemas.activate(&key).await?))
}

pub async fn deactivate_schema(State(state): State<AppState>) -> ApiResult<Json<DeactivateResponse>> {
    let previous = state.schemas.deactivate().await?;
    Ok(Json(DeactivateResponse { previous }))
}

pub async fn delete_schema(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<StatusCode> {
    state.schemas.delete(&key).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn route(
    State(state): State<AppState>,
    Json(body): Json<RouteBody>,
) -> ApiResult<Json<RouteResult>> {
    body.validate()?;
    let request = RouteRequest {
        query: body.query,
        schema_key: body.schema_key,
        conversation_id: body.conversation_id,
    };
    Ok(Json(state.router.route(request).await?))
}
