// memory-router/src/api/mod.rs
//! HTTP handlers over the memory store and the router

pub mod conversation_api;
pub mod memory_api;
pub mod prompt_api;
pub mod router_api;
pub mod user_api;

use axum::{
    extract::{MatchedPath, Request},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::{debug, error};
use validator::ValidationErrors;

use crate::error::MemoryError;
use crate::metrics;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub kind: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "validation",
            message: message.into(),
        }
    }
}

impl From<MemoryError> for ApiError {
    fn from(e: MemoryError) -> Self {
        let status = match &e {
            MemoryError::Validation(_) => StatusCode::BAD_REQUEST,
            MemoryError::NotFound { .. } => StatusCode::NOT_FOUND,
            MemoryError::Conflict(_) => StatusCode::CONFLICT,
            MemoryError::CorruptEntry { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            MemoryError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            MemoryError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

impl From<ValidationErrors> for ApiError {
    fn from(e: ValidationErrors) -> Self {
        Self::bad_request(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!("{} ({})", self.message, self.kind);
        } else {
            debug!("{} ({})", self.message, self.kind);
        }
        (
            self.status,
            Json(json!({
                "error": self.message,
                "kind": self.kind,
                "code": self.status.as_u16(),
            })),
        )
            .into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Count every response by matched route and status.
pub async fn track_requests(request: Request, next: Next) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let response = next.run(request).await;
    metrics::inc_request(&route, response.status().as_str());
    response
}
