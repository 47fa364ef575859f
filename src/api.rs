use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};

use crate::engine::models::CreateRunRequest;
use crate::engine::{RegistryError, RunRegistry};
use crate::errors::ValidationError;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub registry: RunRegistry,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct ListRunsQuery {
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
pub struct DiffResponse {
    pub run_id: String,
    pub diff: String,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unprocessable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Validation(
                e @ (ValidationError::MissingField(_) | ValidationError::EmptyField(_)),
            ) => ApiError::Unprocessable(e.to_string()),
            RegistryError::Validation(e) => ApiError::BadRequest(e.to_string()),
            RegistryError::NotFound(_) => ApiError::NotFound("Run not found".into()),
            e @ RegistryError::NotCancellable { .. } => ApiError::BadRequest(e.to_string()),
            RegistryError::Internal(e) => {
                tracing::error!(error = %format!("{:#}", e), "request failed");
                ApiError::Internal(e.to_string())
            }
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/runs", get(list_runs).post(create_run))
        .route("/api/runs/{id}", get(get_run).delete(cancel_run))
        .route("/api/runs/{id}/artifacts", get(get_artifacts))
        .route("/api/runs/{id}/diff", get(get_diff))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn create_run(
    State(state): State<SharedState>,
    Json(req): Json<CreateRunRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state.registry.create(req).await?;
    Ok(Json(run))
}

async fn list_runs(
    State(state): State<SharedState>,
    Query(query): Query<ListRunsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let runs = state.registry.list(query.page, query.per_page).await?;
    Ok(Json(runs))
}

async fn get_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.registry.get(&id).await?))
}

async fn get_artifacts(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.registry.artifacts(&id).await?))
}

async fn get_diff(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let artifacts = state.registry.artifacts(&id).await?;
    let diff = artifacts
        .diff
        .ok_or_else(|| ApiError::NotFound("Diff not found".into()))?;
    Ok(Json(DiffResponse { run_id: id, diff }))
}

async fn cancel_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.registry.cancel(&id).await?))
}
