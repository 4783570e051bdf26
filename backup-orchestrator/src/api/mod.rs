//! Control API for the backup orchestrator.

pub mod backups;
pub mod error;
pub mod health;
pub mod jobs;

use crate::orchestrator::Orchestrator;
use crate::ws::EventBus;
use axum::{routing::get, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub events: EventBus,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator, events: EventBus) -> Self {
        Self { orchestrator, events }
    }
}

/// Create the API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health endpoints
        .route("/health", get(health::health))
        .route("/version", get(health::version))
        .merge(jobs::router())
        .merge(backups::router())
        // WebSocket endpoint
        .route("/ws", get(crate::ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
