//! API routes over the engine: submit, cancel, duplicate resolution, and
//! the newline-delimited JSON progress stream.

use std::convert::Infallible;
use std::path::PathBuf;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use ytgrab_engine::{DownloadError, JobOptions, JobRunner, PromptResolution};

use crate::error::ApiError;

/// Shared application state: the runner (which owns the bus) plus the
/// operator-fixed output root every job is confined to.
#[derive(Clone)]
pub struct AppState {
    pub runner: JobRunner,
    pub output_root: PathBuf,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/download", post(submit))
        .route("/api/download/cancel", post(cancel))
        .route("/api/duplicate/resolve", post(resolve_duplicate))
        .route("/api/download/progress", get(progress))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DownloadRequest {
    urls: Vec<String>,
    #[serde(default)]
    options: JobOptions,
}

async fn submit(
    State(state): State<AppState>,
    Json(request): Json<DownloadRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if request.urls.is_empty() {
        return Err(ApiError::bad_request("urls must not be empty"));
    }
    if request.urls.iter().any(|u| u.trim().is_empty()) {
        return Err(ApiError::bad_request("urls must not contain empty entries"));
    }

    // The server's root always wins; a request cannot point jobs at an
    // arbitrary directory.
    let mut options = request.options;
    options.output_root = state.output_root.clone();

    let submitted = state.runner.submit(request.urls, options);
    info!(job_id = %submitted.job_id, "job submitted via API");
    Ok(Json(json!({ "jobId": submitted.job_id })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelRequest {
    job_id: String,
}

async fn cancel(
    State(state): State<AppState>,
    Json(request): Json<CancelRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if state.runner.cancel(&request.job_id) {
        Ok(Json(json!({ "ok": true })))
    } else {
        Err(ApiError::not_found(format!(
            "unknown job `{}`",
            request.job_id
        )))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResolveRequest {
    prompt_id: String,
    #[serde(flatten)]
    resolution: PromptResolution,
}

async fn resolve_duplicate(
    State(state): State<AppState>,
    Json(request): Json<ResolveRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match state
        .runner
        .broker()
        .resolve(&request.prompt_id, request.resolution)
    {
        Ok(()) => Ok(Json(json!({ "ok": true }))),
        Err(DownloadError::UnknownPrompt { prompt_id }) => Err(ApiError::not_found(format!(
            "unknown prompt `{prompt_id}`"
        ))),
        Err(err) => Err(ApiError::bad_request(err.to_string())),
    }
}

#[derive(Debug, Deserialize)]
struct ProgressQuery {
    id: String,
    #[serde(default)]
    since: u64,
}

/// Stream bus events as NDJSON. The first line is always the synthesized
/// snapshot; the stream closes itself after the job's `done` event.
async fn progress(
    State(state): State<AppState>,
    Query(query): Query<ProgressQuery>,
) -> Result<Response, ApiError> {
    let rx = state
        .runner
        .bus()
        .subscribe(&query.id, query.since)
        .ok_or_else(|| ApiError::not_found(format!("unknown job `{}`", query.id)))?;

    let stream = futures::stream::unfold((rx, false), |(mut rx, closed)| async move {
        if closed {
            return None;
        }
        let event = rx.recv().await?;
        let mut line = serde_json::to_vec(event.as_ref()).ok()?;
        line.push(b'\n');
        let close_after = event.payload.is_done();
        Some((Ok::<_, Infallible>(Bytes::from(line)), (rx, close_after)))
    });

    let response = (
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(stream),
    )
        .into_response();
    Ok(response)
}
