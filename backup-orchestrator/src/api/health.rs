//! Health check endpoints.

use super::AppState;
use axum::extract::State;
use axum::{response::IntoResponse, Json};
use serde_json::json;
use std::time::{SystemTime, UNIX_EPOCH};

static START_TIME: std::sync::OnceLock<u64> = std::sync::OnceLock::new();

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub fn init_start_time() {
    START_TIME.get_or_init(now_secs);
}

/// GET /health - Health check endpoint
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = now_secs().saturating_sub(*START_TIME.get().unwrap_or(&0));
    let active_job = state.orchestrator.registry().lock().await.active_id().map(str::to_string);
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "hostname": hostname,
        "uptime_secs": uptime,
        "active_job": active_job,
        "components": state.orchestrator.components(),
    }))
}

/// GET /version - Version information endpoint
pub async fn version() -> impl IntoResponse {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
