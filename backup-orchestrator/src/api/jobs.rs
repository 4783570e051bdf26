//! Job endpoints: start, inspect, abort and read logs.

use super::error::AppError;
use super::AppState;
use crate::job::{JobStatus, JobView, Target};
use crate::orchestrator::LogChunk;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/backup", post(start_backup))
        .route("/api/restore", post(start_restore))
        .route("/api/backup/status", get(current_status))
        .route("/api/backup/log", get(current_log))
        .route("/api/jobs", get(list_jobs))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/jobs/{id}/abort", post(abort_job))
        .route("/api/jobs/{id}/log", get(job_log))
}

#[derive(Debug, Deserialize)]
pub struct BackupRequest {
    pub target: Option<String>,
    #[serde(default)]
    pub components: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct RestoreRequest {
    pub backup_id: String,
    pub components: Option<Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartResponse {
    pub job_id: String,
    pub status: JobStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CurrentStatus {
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<JobView>,
}

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    #[serde(default)]
    pub offset: usize,
    pub limit: Option<usize>,
}

fn started(view: JobView) -> (StatusCode, Json<StartResponse>) {
    (
        StatusCode::ACCEPTED,
        Json(StartResponse {
            job_id: view.id,
            status: view.status,
        }),
    )
}

async fn start_backup(
    State(state): State<AppState>,
    Json(body): Json<BackupRequest>,
) -> Result<(StatusCode, Json<StartResponse>), AppError> {
    let target = body.target.as_deref().map(str::parse::<Target>).transpose()?;
    let view = state.orchestrator.start_backup(target, body.components).await?;
    Ok(started(view))
}

async fn start_restore(
    State(state): State<AppState>,
    Json(body): Json<RestoreRequest>,
) -> Result<(StatusCode, Json<StartResponse>), AppError> {
    if body.backup_id.trim().is_empty() {
        return Err(AppError::bad_request("backup_id is required"));
    }
    let view = state
        .orchestrator
        .start_restore(&body.backup_id, body.components)
        .await?;
    Ok(started(view))
}

async fn list_jobs(State(state): State<AppState>) -> Json<Vec<JobView>> {
    Json(state.orchestrator.registry().list().await)
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobView>, AppError> {
    Ok(Json(state.orchestrator.status(&id).await?))
}

async fn abort_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobView>, AppError> {
    Ok(Json(state.orchestrator.abort(&id).await?))
}

async fn job_log(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogQuery>,
) -> Result<Json<LogChunk>, AppError> {
    Ok(Json(state.orchestrator.read_log(&id, query.offset, query.limit).await?))
}

async fn current_status(State(state): State<AppState>) -> Json<CurrentStatus> {
    let job = state.orchestrator.registry().current().await;
    Json(CurrentStatus {
        running: job.as_ref().is_some_and(|j| !j.status.is_terminal()),
        job,
    })
}

async fn current_log(
    State(state): State<AppState>,
    Query(query): Query<LogQuery>,
) -> Result<Json<LogChunk>, AppError> {
    Ok(Json(state.orchestrator.read_current_log(query.offset, query.limit).await?))
}
