//! Custom error types for the backup orchestrator.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Job {active_job_id} is already running")]
    AlreadyRunning { active_job_id: String },

    #[error("Unknown component: {0}")]
    UnknownComponent(String),

    #[error("Unknown target: {0}")]
    UnknownTarget(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Backup {0} is in use by a running restore")]
    InUse(String),

    #[error("No such process group: {0}")]
    NoSuchProcess(i32),

    #[error("Signal error: {0}")]
    Signal(#[from] nix::Error),

    #[error("Process group {0} survived SIGKILL")]
    AbortTimeout(i32),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
