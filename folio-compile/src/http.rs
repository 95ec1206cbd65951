//! HTTP surface of the compile queue.
//!
//! | route | |
//! |---|---|
//! | `POST /compile/submit` | queue a job (needs `x-user-id`) |
//! | `GET /compile/status/{job_id}` | job status, 404 + `expired` once purged |
//! | `GET /compile/artifact/{job_id}` | PDF bytes, 409 until completed |
//! | `GET /compile/log/{job_id}` | live or final compiler log |
//! | `GET /compile/stats` | public load figures |
//! | `GET /compile/queue-stats` | full scheduler counters |
//!
//! Authentication happens in front of this service; it only trusts the
//! `x-user-id` header that layer sets.

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;

use folio_core::store::resolve_within;
use folio_core::{ProjectStore, ResourceId, StoreError, UserId};

use crate::error::CompileError;
use crate::job::{JobId, JobStatus, PublicStats, QueueStats};
use crate::queue::CompileQueue;
use crate::runner::is_source_file;

pub const USER_HEADER: &str = "x-user-id";

#[derive(Clone)]
pub struct AppState {
    pub queue: CompileQueue,
    pub store: Arc<dyn ProjectStore>,
}

impl AppState {
    pub fn new(queue: CompileQueue, store: Arc<dyn ProjectStore>) -> Self {
        Self { queue, store }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/compile/submit", post(submit))
        .route("/compile/status/{job_id}", get(status))
        .route("/compile/artifact/{job_id}", get(artifact))
        .route("/compile/log/{job_id}", get(compile_log))
        .route("/compile/stats", get(public_stats))
        .route("/compile/queue-stats", get(queue_stats))
        .with_state(state)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub file_name: String,
    pub content: String,
    pub resource_id: ResourceId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub job_id: JobId,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
    pub stats: PublicStats,
}

/// Errors returned to HTTP clients.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Unknown or purged job: the client should stop polling.
    #[error("job {0} not found or expired")]
    JobNotFound(JobId),
    #[error("{0}")]
    NotReady(String),
    #[error("not a compilable source file: {0}")]
    InvalidFileName(String),
    #[error("missing x-user-id header")]
    Unauthenticated,
    #[error("no access to resource {0}")]
    Forbidden(ResourceId),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{0}")]
    Internal(String),
}

impl From<CompileError> for ApiError {
    fn from(e: CompileError) -> Self {
        match e {
            CompileError::JobNotFound(id) => ApiError::JobNotFound(id),
            CompileError::NotReady { .. } | CompileError::LogUnavailable(_) => {
                ApiError::NotReady(e.to_string())
            }
            CompileError::UnsupportedSource(name) => ApiError::InvalidFileName(name),
            CompileError::Store(e) => ApiError::Store(e),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = self.to_string();
        match self {
            ApiError::JobNotFound(_) => (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": message, "expired": true })),
            )
                .into_response(),
            ApiError::NotReady(_) => {
                (StatusCode::CONFLICT, Json(json!({ "error": message }))).into_response()
            }
            ApiError::InvalidFileName(_) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
            }
            ApiError::Unauthenticated => {
                (StatusCode::UNAUTHORIZED, Json(json!({ "error": message }))).into_response()
            }
            ApiError::Forbidden(_) | ApiError::Store(StoreError::NotFound(_)) => {
                (StatusCode::FORBIDDEN, Json(json!({ "error": message }))).into_response()
            }
            ApiError::Store(_) | ApiError::Internal(_) => {
                log::error!("Compile API error: {message}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": message })),
                )
                    .into_response()
            }
        }
    }
}

fn submitter(headers: &HeaderMap) -> Result<UserId, ApiError> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(UserId::from)
        .ok_or(ApiError::Unauthenticated)
}

/// POST /compile/submit
async fn submit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SubmitRequest>,
) -> Result<Json<SubmitResponse>, ApiError> {
    let user = submitter(&headers)?;
    let escapes = resolve_within(std::path::Path::new("."), &req.file_name).is_err();
    if escapes || !is_source_file(&req.file_name) {
        return Err(ApiError::InvalidFileName(req.file_name));
    }
    if !state.store.has_access(&user, &req.resource_id).await? {
        log::warn!("{user} denied compile access to {}", req.resource_id);
        return Err(ApiError::Forbidden(req.resource_id));
    }

    let job_id = state
        .queue
        .add_job(user, req.resource_id, req.file_name, req.content);
    let view = state
        .queue
        .get_job(&job_id)
        .ok_or_else(|| ApiError::Internal(format!("job {job_id} vanished after submit")))?;

    Ok(Json(SubmitResponse {
        job_id,
        status: view.status,
        queue_position: view.queue_position,
        stats: state.queue.public_stats(),
    }))
}

/// GET /compile/status/{job_id}
async fn status(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .queue
        .get_job(&job_id)
        .map(Json)
        .ok_or(ApiError::JobNotFound(job_id))
}

/// GET /compile/artifact/{job_id}
async fn artifact(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> Result<Response, ApiError> {
    let bytes = state.queue.get_artifact(&job_id).await?;
    Ok(([(header::CONTENT_TYPE, "application/pdf")], bytes).into_response())
}

/// GET /compile/log/{job_id}
async fn compile_log(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> Result<Response, ApiError> {
    let text = state.queue.get_log(&job_id).await?;
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], text).into_response())
}

async fn public_stats(State(state): State<AppState>) -> Json<PublicStats> {
    Json(state.queue.public_stats())
}

async fn queue_stats(State(state): State<AppState>) -> Json<QueueStats> {
    Json(state.queue.stats())
}
