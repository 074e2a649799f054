//! Lumyn HTTP surface: the v0 JSON API.
//!
//! Thin axum layer over the engine. Error mapping is fixed by contract:
//! schema violations are 422, unknown ids are 404, policy-load and
//! non-absorbed storage failures are 500. A degraded ABSTAIN decision is a
//! normal 200 — the engine already folded the failure into the record.

#![deny(unsafe_code)]

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;

use engine::{EngineConfig, EngineError};
use store::{Store, StoreError};

/// Environment-derived API configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Policy document path (`LUMYN_POLICY_PATH`).
    pub policy_path: PathBuf,
    /// SQLite store path (`LUMYN_STORE_PATH`).
    pub store_path: PathBuf,
    /// Similarity top-k (`LUMYN_TOP_K`, default 5).
    pub top_k: usize,
}

impl ApiConfig {
    /// Read configuration from the environment. Non-integer `LUMYN_TOP_K`
    /// falls back to the default of 5.
    pub fn from_env() -> Self {
        let policy_path = std::env::var("LUMYN_POLICY_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("policies/lumyn-support.v0.yml"));
        let store_path = std::env::var("LUMYN_STORE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(".lumyn/lumyn.db"));
        let top_k = std::env::var("LUMYN_TOP_K")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(5);
        Self { policy_path, store_path, top_k }
    }

    /// Engine configuration derived from this API configuration.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            policy_path: self.policy_path.clone(),
            top_k: self.top_k,
            ..Default::default()
        }
    }
}

/// Shared handler state.
pub struct AppState {
    /// Engine configuration used for every decide call.
    pub config: EngineConfig,
    /// Durable store shared across handlers.
    pub store: Arc<dyn Store>,
}

/// Build the v0 router over an engine configuration and store.
pub fn router(config: EngineConfig, store: Arc<dyn Store>) -> Router {
    let state = Arc::new(AppState { config, store });
    Router::new()
        .route("/v0/decide", post(post_decide))
        .route("/v0/decisions/{id}", get(get_decision))
        .route("/v0/decisions/{id}/events", post(post_event))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn healthz() -> Json<Value> {
    Json(json!({"ok": true}))
}

async fn post_decide(State(state): State<Arc<AppState>>, Json(payload): Json<Value>) -> Response {
    let result = tokio::task::spawn_blocking(move || {
        engine::decide(&payload, &state.config, state.store.as_ref())
    })
    .await;
    match result {
        Ok(Ok(record)) => Json(record).into_response(),
        Ok(Err(EngineError::Validation(msg))) => error(StatusCode::UNPROCESSABLE_ENTITY, &msg),
        Ok(Err(e)) => error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

async fn get_decision(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let result = tokio::task::spawn_blocking(move || {
        state.store.init()?;
        state.store.get_decision_record(&id)
    })
    .await;
    match result {
        Ok(Ok(Some(record))) => Json(record).into_response(),
        Ok(Ok(None)) => error(StatusCode::NOT_FOUND, "not found"),
        Ok(Err(e)) => storage_error(&e),
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

async fn post_event(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<Value>,
) -> Response {
    let event_type = match payload.get("type").and_then(Value::as_str) {
        Some(t) if !t.trim().is_empty() => t.to_owned(),
        _ => {
            return error(
                StatusCode::UNPROCESSABLE_ENTITY,
                "payload.type must be a non-empty string",
            )
        }
    };
    let data = payload.get("data").cloned().unwrap_or_else(|| json!({}));
    if !data.is_object() {
        return error(StatusCode::UNPROCESSABLE_ENTITY, "payload.data must be an object");
    }

    let result = tokio::task::spawn_blocking(move || {
        state.store.init()?;
        state.store.append_decision_event(&id, &event_type, &data)
    })
    .await;
    match result {
        Ok(Ok(event_id)) => Json(json!({"event_id": event_id})).into_response(),
        Ok(Err(StoreError::UnknownDecision(_))) => error(StatusCode::NOT_FOUND, "not found"),
        Ok(Err(e)) => storage_error(&e),
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

fn storage_error(e: &StoreError) -> Response {
    error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
}

fn error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({"error": message}))).into_response()
}
