use super::error::AppError;
use super::AppState;
use crate::job::Target;
use crate::store::{BackupRecord, BackupStats};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/backup/list", get(list_backups))
        .route("/api/backup/stats", get(backup_stats))
        .route("/api/backup/delete", post(delete_backup_by_body))
        .route("/api/backups/{id}", delete(delete_backup))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub target: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BackupList {
    pub backups: Vec<BackupRecord>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteRequest {
    pub backup_id: String,
}

async fn list_backups(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<BackupList>, AppError> {
    let target = query.target.as_deref().map(str::parse::<Target>).transpose()?;
    let backups = state.orchestrator.list_backups(target).await?;
    Ok(Json(BackupList { backups }))
}

async fn backup_stats(State(state): State<AppState>) -> Result<Json<BackupStats>, AppError> {
    Ok(Json(state.orchestrator.backup_stats().await?))
}

async fn delete_backup(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.orchestrator.delete_backup(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Form used by the legacy dashboard.
async fn delete_backup_by_body(
    State(state): State<AppState>,
    Json(body): Json<DeleteRequest>,
) -> Result<Json<Value>, AppError> {
    state.orchestrator.delete_backup(&body.backup_id).await?;
    Ok(Json(json!({ "deleted": true })))
}
