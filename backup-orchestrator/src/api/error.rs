use crate::utils::errors::OrchestratorError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// HTTP face of [`OrchestratorError`].
#[derive(thiserror::Error, Debug)]
#[error(transparent)]
pub struct AppError(#[from] pub OrchestratorError);

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self(OrchestratorError::InvalidRequest(msg.into()))
    }

    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match &self.0 {
            OrchestratorError::AlreadyRunning { .. } => (StatusCode::CONFLICT, "already_running"),
            OrchestratorError::InUse(_) => (StatusCode::CONFLICT, "in_use"),
            OrchestratorError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            OrchestratorError::UnknownComponent(_) => {
                (StatusCode::BAD_REQUEST, "unknown_component")
            }
            OrchestratorError::UnknownTarget(_) => (StatusCode::BAD_REQUEST, "unknown_target"),
            OrchestratorError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let body = match &self.0 {
            OrchestratorError::AlreadyRunning { active_job_id } => json!({
                "error": self.0.to_string(),
                "code": code,
                "active_job_id": active_job_id,
            }),
            _ if status == StatusCode::INTERNAL_SERVER_ERROR => {
                tracing::error!("Internal error: {}", self.0);
                json!({ "error": self.0.to_string(), "code": code })
            }
            _ => json!({ "error": self.0.to_string(), "code": code }),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (OrchestratorError::AlreadyRunning { active_job_id: "j".into() }, StatusCode::CONFLICT),
            (OrchestratorError::InUse("b".into()), StatusCode::CONFLICT),
            (OrchestratorError::NotFound("job x".into()), StatusCode::NOT_FOUND),
            (OrchestratorError::UnknownComponent("tapes".into()), StatusCode::BAD_REQUEST),
            (OrchestratorError::AbortTimeout(12), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            assert_eq!(AppError(err).into_response().status(), expected);
        }
    }
}
