//! HTTP server startup and route table
//!
//! Opens the database, wires the shared state, starts the reaper, and serves
//! until ctrl-c or SIGTERM. The reaper is stopped after the listener drains.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};
use tower::limit::ConcurrencyLimitLayer;
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::{
    api::{self, conversation_api, memory_api, prompt_api, router_api, user_api},
    config::Config,
    memory::MemoryStore,
    memory_db::MemoryDatabase,
    shared_state::AppState,
};

/// Open the configured database and build the store on top of it.
pub fn open_store(cfg: &Config) -> anyhow::Result<Arc<MemoryStore>> {
    if let Some(parent) = cfg.database_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }
    let db = MemoryDatabase::new(&cfg.database_path, cfg.database_pool_size)
        .with_context(|| format!("opening {}", cfg.database_path.display()))?;
    info!("Memory database ready at {}", cfg.database_path.display());

    Ok(Arc::new(
        MemoryStore::new(Arc::new(db)).with_capacity(cfg.memory_capacity),
    ))
}

pub async fn run_server(cfg: Config) -> anyhow::Result<()> {
    crate::telemetry::init_tracing();
    crate::metrics::init_metrics();
    cfg.print_config();

    let addr = cfg.api_addr()?;
    let store = open_store(&cfg)?;
    let state = AppState::new(cfg, store);
    state.engine.start().await;

    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let app = build_router(state.clone());

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    state.engine.stop().await;
    served?;
    info!("Server stopped");
    Ok(())
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PUT,
            axum::http::Method::DELETE,
        ])
        .allow_headers(Any);
    let request_timeout = state.config.request_timeout();
    let concurrency = state.config.max_concurrent_requests.max(1);

    Router::new()
        // Generic entries
        .route("/memory/stats", get(memory_api::memory_stats))
        .route("/memory/query", post(memory_api::query_memory))
        .route("/memory/sweep", post(memory_api::sweep))
        .route("/memory/quarantine", get(memory_api::list_quarantine))
        .route(
            "/memory/quarantine/:entity/:key",
            axum::routing::delete(memory_api::release_quarantine),
        )
        .route(
            "/memory/:entity/:key",
            get(memory_api::get_entry)
                .put(memory_api::put_entry)
                .delete(memory_api::delete_entry),
        )
        // Conversations and users
        .route(
            "/conversations/:id/messages",
            get(conversation_api::get_messages).post(conversation_api::append_message),
        )
        .route("/users/:id", put(user_api::touch_user).delete(user_api::purge_user))
        .route("/users/:id/facts", post(user_api::add_fact))
        .route("/users/:id/preferences", put(user_api::update_preferences))
        // Router schemas
        .route(
            "/router/schemas",
            get(router_api::list_schemas).post(router_api::save_schema),
        )
        .route(
            "/router/schemas/active",
            get(router_api::get_active_schema).delete(router_api::deactivate_schema),
        )
        .route(
            "/router/schemas/:key",
            get(router_api::get_schema).delete(router_api::delete_schema),
        )
        .route("/router/schemas/:key/activate", put(router_api::activate_schema))
        .route("/router/route", post(router_api::route))
        // System prompts
        .route(
            "/system-prompts",
            get(prompt_api::list_prompts).post(prompt_api::save_prompt),
        )
        .route(
            "/system-prompts/active",
            get(prompt_api::get_active_prompt).delete(prompt_api::deactivate_prompt),
        )
        .route(
            "/system-prompts/:key",
            get(prompt_api::get_prompt).delete(prompt_api::delete_prompt),
        )
        .route("/system-prompts/:key/activate", put(prompt_api::activate_prompt))
        .route("/healthz", get(|| async { "OK" }))
        .route("/metrics", get(crate::metrics::get_metrics))
        .layer(middleware::from_fn(api::track_requests))
        .layer(ConcurrencyLimitLayer::new(concurrency))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(request_timeout))
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received, draining connections");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn test_app() -> Router {
        let cfg = Config::from_lookup(|_| None).unwrap();
        let store = Arc::new(MemoryStore::in_memory().unwrap());
        build_router(AppState::new(cfg, store))
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_healthz() {
        let app = test_app();
        let response = app
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_entry_lifecycle_over_http() {
        let app = test_app();
        let (status, _) = call(
            &app,
            "PUT",
            "/memory/system/greeting",
            Some(json!({"value": {"text": "hello"}, "tags": ["intro"]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(&app, "GET", "/memory/system/greeting", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["key"], "greeting");

        let (status, body) = call(&app, "DELETE", "/memory/system/greeting", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["deleted"], true);

        let (status, body) = call(&app, "GET", "/memory/system/greeting", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "not_found");
    }

    #[tokio::test]
    async fn test_unknown_entity_is_rejected() {
        let app = test_app();
        let (status, body) = call(&app, "GET", "/memory/widgets/a", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "validation");
    }

    #[tokio::test]
    async fn test_route_with_active_schema() {
        let app = test_app();
        let schema = json!({
            "key": "support",
            "classes": [
                {"name": "billing", "description": "invoices refunds payments charges"},
                {"name": "shipping", "description": "delivery package tracking courier"}
            ],
            "examples": [
                {"query": "where is my package", "expected": {"class": "shipping"}}
            ]
        });
        let (status, _) = call(&app, "POST", "/router/schemas", Some(schema)).await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, _) = call(&app, "PUT", "/router/schemas/support/activate", None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(&app, "GET", "/router/schemas/active", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["key"], "support");

        let (status, body) = call(
            &app,
            "POST",
            "/router/route",
            Some(json!({"query": "refunds for duplicate charges"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["selected_class"], "billing");
    }

    #[tokio::test]
    async fn test_active_prompt_cannot_be_deleted() {
        let app = test_app();
        let (status, _) = call(
            &app,
            "POST",
            "/system-prompts",
            Some(json!({"key": "default", "content": "You are helpful."})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, _) = call(&app, "PUT", "/system-prompts/default/activate", None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(&app, "DELETE", "/system-prompts/default", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["kind"], "conflict");

        let (status, _) = call(&app, "DELETE", "/system-prompts/active", None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&app, "DELETE", "/system-prompts/default", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_messages_round_trip() {
        let app = test_app();
        for text in ["first", "second"] {
            let (status, _) = call(
                &app,
                "POST",
                "/conversations/c1/messages",
                Some(json!({"role": "user", "content": text})),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
        }
        let (status, body) = call(&app, "GET", "/conversations/c1/messages?limit=10", None).await;
        assert_eq!(status, StatusCode::OK);
        let contents: Vec<&str> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["content"].as_str().unwrap())
            .collect();
        assert_eq!(contents, vec!["first", "second"]);
    }
}
