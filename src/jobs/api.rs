use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;

use super::approval;
use super::db::DbHandle;
use super::dispatcher::Dispatcher;
use super::github::PullRequestPublisher;
use super::models::{Job, JobRequest};
use crate::errors::JobError;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub dispatcher: Arc<Dispatcher>,
    pub publisher: Arc<dyn PullRequestPublisher>,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateJobRequest {
    pub repo_path: String,
    pub commit_sha: String,
    pub repo_full_name: Option<String>,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    BadGateway(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        let msg = error_chain(&err);
        match err {
            JobError::NotFound { .. } => ApiError::NotFound(msg),
            JobError::Precondition { .. } => ApiError::Conflict(msg),
            JobError::Approval(_) => ApiError::BadGateway(msg),
            _ => ApiError::Internal(msg),
        }
    }
}

/// Full error chain as one line.
fn error_chain(err: &JobError) -> String {
    let mut text = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        let cause_text = cause.to_string();
        if !text.contains(&cause_text) {
            text.push_str(": ");
            text.push_str(&cause_text);
        }
        source = cause.source();
    }
    text
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/jobs", get(list_jobs).post(create_job).delete(clear_jobs))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/jobs/{id}/approve", post(approve_job))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_jobs(State(state): State<SharedState>) -> Result<Json<Vec<Job>>, ApiError> {
    let jobs = state.db.call(|db| db.list_jobs()).await?;
    Ok(Json(jobs))
}

async fn create_job(
    State(state): State<SharedState>,
    Json(req): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    let commit_sha = req.commit_sha.trim().to_string();
    if commit_sha.is_empty() {
        return Err(ApiError::BadRequest("commit_sha is required".into()));
    }
    if req.repo_path.trim().is_empty() {
        return Err(ApiError::BadRequest("repo_path is required".into()));
    }
    let request = JobRequest {
        repo_path: req.repo_path.trim().into(),
        commit_sha,
        repo_full_name: req.repo_full_name.filter(|name| !name.trim().is_empty()),
    };
    // The run continues in the background; callers poll GET /api/jobs/{id}.
    let (job, _handle) = state.dispatcher.submit(request).await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

async fn clear_jobs(State(state): State<SharedState>) -> Result<Json<serde_json::Value>, ApiError> {
    let deleted = state.db.call(|db| db.clear_jobs()).await?;
    Ok(Json(serde_json::json!({ "deleted": deleted })))
}

async fn get_job(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    let job = state.db.call(move |db| db.require_job(&id)).await?;
    Ok(Json(job))
}

async fn approve_job(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    let job = approval::approve(&state.db, state.publisher.as_ref(), &id).await?;
    Ok(Json(job))
}
