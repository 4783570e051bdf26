//! Job model shared by the registry, the executor and the HTTP API.

pub mod registry;

use crate::supervisor::ProcessGroup;
use crate::utils::errors::OrchestratorError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

pub use registry::{AbortTicket, JobRegistry, RegistryState};

/// Exit reason recorded for every aborted job.
pub const ABORT_SENTINEL: &str = "aborted by operator";

pub type JobId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Backup,
    Restore,
}

impl JobKind {
    /// Mode flag handed to the transfer engine.
    pub fn mode(&self) -> &'static str {
        match self {
            JobKind::Backup => "backup",
            JobKind::Restore => "restore",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mode())
    }
}

/// Destination class for backups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    Nvme,
    Usb,
    Network,
}

impl Target {
    pub const ALL: [Target; 3] = [Target::Nvme, Target::Usb, Target::Network];

    pub fn as_str(&self) -> &'static str {
        match self {
            Target::Nvme => "nvme",
            Target::Usb => "usb",
            Target::Network => "network",
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Target {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nvme" => Ok(Target::Nvme),
            "usb" | "usb_ssd" => Ok(Target::Usb),
            "network" | "net" => Ok(Target::Network),
            other => Err(OrchestratorError::UnknownTarget(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Aborted,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed | JobStatus::Aborted)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Terminal outcome handed to `finalize`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed(String),
    Aborted,
}

impl Outcome {
    pub fn status(&self) -> JobStatus {
        match self {
            Outcome::Succeeded => JobStatus::Succeeded,
            Outcome::Failed(_) => JobStatus::Failed,
            Outcome::Aborted => JobStatus::Aborted,
        }
    }
}

/// Everything the registry needs to admit a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: JobId,
    pub kind: JobKind,
    pub target: Target,
    pub components: Vec<String>,
    /// Artifact id: the backup being written, or the backup being restored.
    pub backup_id: String,
    pub log_path: PathBuf,
}

/// A job as tracked by the registry.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub target: Target,
    pub components: Vec<String>,
    pub backup_id: String,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub process: Option<ProcessGroup>,
    pub log_path: PathBuf,
    pub exit_reason: Option<String>,
    pub abort_requested: bool,
}

impl Job {
    fn admitted(new: NewJob) -> Self {
        Self {
            id: new.id,
            kind: new.kind,
            target: new.target,
            components: new.components,
            backup_id: new.backup_id,
            status: JobStatus::Pending,
            started_at: Utc::now(),
            ended_at: None,
            process: None,
            log_path: new.log_path,
            exit_reason: None,
            abort_requested: false,
        }
    }

    pub fn view(&self) -> JobView {
        JobView {
            id: self.id.clone(),
            kind: self.kind,
            target: self.target,
            components: self.components.clone(),
            backup_id: self.backup_id.clone(),
            status: self.status,
            started_at: self.started_at,
            ended_at: self.ended_at,
            exit_reason: self.exit_reason.clone(),
            pgid: self.process.map(|p| p.pgid()),
            log_path: self.log_path.clone(),
        }
    }
}

/// Read-only snapshot of a job returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobView {
    pub id: JobId,
    pub kind: JobKind,
    pub target: Target,
    pub components: Vec<String>,
    pub backup_id: String,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pgid: Option<i32>,
    pub log_path: PathBuf,
}
