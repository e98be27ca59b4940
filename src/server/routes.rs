//! Route handlers for the submission/status/query API.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::citations::QueryRequest;
use crate::engine::Engine;
use crate::errors::{InputError, JobError, QueryError};
use crate::ids::JobId;
use crate::jobs::{Job, JobOptions};

use super::sse::stream_job;
use super::AppState;

pub fn router(engine: Arc<Engine>) -> Router {
    let state = AppState { engine };
    Router::new()
        .route("/ingest", post(submit))
        .route("/ingest/batch", post(submit_batch))
        .route("/ingest/{job_id}", get(job_status).post(job_action))
        .route("/stream/{job_id}", get(stream_job))
        .route("/query", post(query))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct IngestRequest {
    url: String,
    #[serde(default)]
    priority: Option<u8>,
    #[serde(default)]
    options: Option<JobOptions>,
}

#[derive(Debug, Deserialize)]
struct BatchRequest {
    urls: Vec<String>,
    #[serde(default)]
    priority: Option<u8>,
    #[serde(default)]
    options: Option<JobOptions>,
}

const DEFAULT_PRIORITY: u8 = 5;

async fn submit(
    State(state): State<AppState>,
    Json(request): Json<IngestRequest>,
) -> Response {
    let priority = request.priority.unwrap_or(DEFAULT_PRIORITY);
    let options = request.options.unwrap_or_default();
    match state
        .engine
        .manager()
        .submit(&request.url, priority, options)
        .await
    {
        Ok(receipt) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "job_id": receipt.job_id,
                "doc_id": receipt.doc_id,
                "status": "queued",
                "reused": receipt.reused,
                "stream_url": format!("/stream/{}", receipt.job_id),
            })),
        )
            .into_response(),
        Err(err) => job_error_response(err),
    }
}

async fn submit_batch(
    State(state): State<AppState>,
    Json(request): Json<BatchRequest>,
) -> Response {
    let priority = request.priority.unwrap_or(DEFAULT_PRIORITY);
    let options = request.options.unwrap_or_default();
    match state
        .engine
        .manager()
        .submit_batch(&request.urls, priority, options)
        .await
    {
        Ok(summary) => (StatusCode::ACCEPTED, Json(json!(summary))).into_response(),
        Err(err) => job_error_response(err),
    }
}

async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Response {
    let job_id = JobId::from(job_id.as_str());
    match state.engine.manager().status(&job_id).await {
        Ok(Some(job)) => (StatusCode::OK, Json(job_view(&job))).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "not_found", "no such job"),
        Err(err) => job_error_response(err),
    }
}

/// `POST /ingest/{job_id}:cancel` and `:retry`. The action suffix rides in
/// the path segment after the job id.
async fn job_action(
    State(state): State<AppState>,
    Path(rest): Path<String>,
) -> Response {
    if let Some(raw_id) = rest.strip_suffix(":cancel") {
        let job_id = JobId::from(raw_id);
        return match state.engine.manager().cancel(&job_id).await {
            Ok(()) => StatusCode::NO_CONTENT.into_response(),
            Err(err) => job_error_response(err),
        };
    }
    if let Some(raw_id) = rest.strip_suffix(":retry") {
        let job_id = JobId::from(raw_id);
        return match state.engine.manager().retry(&job_id).await {
            Ok(()) => (
                StatusCode::ACCEPTED,
                Json(json!({"job_id": job_id, "status": "queued"})),
            )
                .into_response(),
            Err(err) => job_error_response(err),
        };
    }
    error_response(
        StatusCode::NOT_FOUND,
        "not_found",
        "unknown job action; expected :cancel or :retry",
    )
}

async fn query(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Response {
    match state.engine.answers().answer(request).await {
        Ok(response) => (StatusCode::OK, Json(json!(response))).into_response(),
        Err(err) => query_error_response(err),
    }
}

/// The status payload: durable row merged with the in-memory snapshot.
fn job_view(job: &Job) -> Value {
    let mut progress = json!({
        "current_stage": job.current_stage,
        "stages_completed": job.stages_completed,
        "percent_complete": job.progress_pct,
    });
    if let Some(error) = &job.error {
        progress["error"] = json!(error);
    }
    let mut body = json!({
        "job_id": job.job_id,
        "doc_id": job.doc_id,
        "status": job.status,
        "url": job.url,
        "priority": job.priority,
        "attempts": job.attempts,
        "max_attempts": job.max_attempts,
        "created_at": job.created_at.to_rfc3339(),
        "progress": progress,
    });
    if let Some(started) = job.started_at {
        body["started_at"] = json!(started.to_rfc3339());
    }
    if let Some(completed) = job.completed_at {
        body["completed_at"] = json!(completed.to_rfc3339());
    }
    if let Some(result) = &job.result {
        body["result"] = json!(result);
    }
    body
}

fn error_response(status: StatusCode, kind: &str, message: &str) -> Response {
    (
        status,
        Json(json!({"error": kind, "message": message})),
    )
        .into_response()
}

fn job_error_response(err: JobError) -> Response {
    let (status, kind) = match &err {
        JobError::Input(InputError::InvalidUrl { .. }) => (StatusCode::BAD_REQUEST, "invalid_url"),
        JobError::Input(_) => (StatusCode::BAD_REQUEST, "invalid_input"),
        JobError::Duplicate { .. } => (StatusCode::CONFLICT, "duplicate"),
        JobError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
        JobError::TerminalState { .. } => (StatusCode::CONFLICT, "terminal_state"),
        JobError::NotFailed { .. } => (StatusCode::CONFLICT, "not_failed"),
        JobError::AttemptsExhausted { .. } => (StatusCode::CONFLICT, "attempts_exhausted"),
        JobError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, "rate_limited"),
        JobError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "store_error"),
    };
    error_response(status, kind, &err.to_string())
}

fn query_error_response(err: QueryError) -> Response {
    match &err {
        QueryError::InvalidCitationIndex { indices } => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({
                "error": "citation_validation_error",
                "message": err.to_string(),
                "invalid_indices": indices,
            })),
        )
            .into_response(),
        QueryError::Input(InputError::UnknownFilterKey { .. }) => {
            error_response(StatusCode::BAD_REQUEST, "invalid_filter", &err.to_string())
        }
        QueryError::Input(_) => {
            error_response(StatusCode::BAD_REQUEST, "invalid_input", &err.to_string())
        }
        QueryError::Provider(_) => {
            error_response(StatusCode::BAD_GATEWAY, "provider_error", &err.to_string())
        }
        QueryError::Store(_) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "store_error",
            &err.to_string(),
        ),
    }
}
