//! Job registry: the single source of truth for which job is active.
//!
//! All state lives behind one async mutex. Admission, abort bookkeeping,
//! process attachment and finalization go through [`RegistryState`] while the
//! lock is held, so "is a job running" and "start a job" can never interleave.

use super::{Job, JobId, JobKind, JobStatus, JobView, NewJob, Outcome, ABORT_SENTINEL};
use crate::supervisor::ProcessGroup;
use crate::utils::errors::{OrchestratorError, Result};
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

/// Terminal jobs kept in memory for status and log lookups.
const MAX_JOB_HISTORY: usize = 256;

/// Shared handle to the registry state.
#[derive(Clone, Default)]
pub struct JobRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the registry lock for a multi-step critical section.
    pub async fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().await
    }

    pub async fn admit(&self, new: NewJob) -> Result<JobView> {
        self.lock().await.admit(new)
    }

    pub async fn get(&self, id: &str) -> Result<JobView> {
        self.lock()
            .await
            .view(id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("job {id}")))
    }

    /// Returns `false` when the job was already terminal.
    pub async fn finalize(&self, id: &str, outcome: Outcome) -> bool {
        self.lock().await.finalize(id, outcome)
    }

    /// The active job if there is one, otherwise the most recently admitted.
    pub async fn current(&self) -> Option<JobView> {
        let state = self.lock().await;
        state
            .active
            .as_deref()
            .or_else(|| state.order.back().map(String::as_str))
            .and_then(|id| state.view(id))
    }

    /// All known jobs, newest first.
    pub async fn list(&self) -> Vec<JobView> {
        let state = self.lock().await;
        state
            .order
            .iter()
            .rev()
            .filter_map(|id| state.view(id))
            .collect()
    }
}

/// What an abort request has to do once the lock is released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortTicket {
    /// The job already reached a terminal state; nothing to do.
    Finished(JobView),
    /// Another abort is already tearing the job down.
    InProgress(JobView),
    /// Signal this group (if any) and finalize as aborted.
    Signal(Option<ProcessGroup>),
}

#[derive(Debug, Default)]
pub struct RegistryState {
    jobs: HashMap<JobId, Job>,
    order: VecDeque<JobId>,
    active: Option<JobId>,
}

impl RegistryState {
    pub fn active_id(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn view(&self, id: &str) -> Option<JobView> {
        self.jobs.get(id).map(Job::view)
    }

    fn conflict(&self) -> Option<OrchestratorError> {
        self.active.as_ref().map(|id| OrchestratorError::AlreadyRunning {
            active_job_id: id.clone(),
        })
    }

    /// Fails with `AlreadyRunning` while any job is pending or running.
    pub fn ensure_idle(&self) -> Result<()> {
        match self.conflict() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Create the job in `Pending` and claim the single active slot.
    pub fn admit(&mut self, new: NewJob) -> Result<JobView> {
        self.ensure_idle()?;
        if new.components.is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "components must not be empty".into(),
            ));
        }
        if self.jobs.contains_key(&new.id) {
            return Err(OrchestratorError::InvalidRequest(format!(
                "duplicate job id {}",
                new.id
            )));
        }

        let job = Job::admitted(new);
        let view = job.view();
        tracing::info!(job_id = %job.id, kind = %job.kind, target = %job.target, "Job admitted");

        self.active = Some(job.id.clone());
        self.order.push_back(job.id.clone());
        self.jobs.insert(job.id.clone(), job);
        self.evict_history();
        Ok(view)
    }

    /// Hand a freshly spawned process group to the job. Moves `Pending` to
    /// `Running`. Returns `false` if the job no longer wants a process
    /// (aborted or already terminal); the caller must then kill the group.
    pub fn attach(&mut self, id: &str, group: ProcessGroup) -> bool {
        let Some(job) = self.jobs.get_mut(id) else {
            return false;
        };
        if job.status.is_terminal() || job.abort_requested {
            return false;
        }
        job.process = Some(group);
        if job.status == JobStatus::Pending {
            job.status = JobStatus::Running;
            tracing::info!(job_id = %id, pgid = group.pgid(), "Job running");
        }
        true
    }

    /// Release the handle to a group that has exited. A newer group attached
    /// for a later step is left alone.
    pub fn detach(&mut self, id: &str, group: ProcessGroup) {
        if let Some(job) = self.jobs.get_mut(id) {
            if job.process == Some(group) {
                job.process = None;
            }
        }
    }

    pub fn is_abort_requested(&self, id: &str) -> bool {
        self.jobs.get(id).is_some_and(|j| j.abort_requested)
    }

    pub fn is_terminal(&self, id: &str) -> bool {
        self.jobs.get(id).is_some_and(|j| j.status.is_terminal())
    }

    /// Mark the job as aborting. Idempotent: later calls report the current state.
    pub fn request_abort(&mut self, id: &str) -> Result<AbortTicket> {
        let job = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("job {id}")))?;

        if job.status.is_terminal() {
            return Ok(AbortTicket::Finished(job.view()));
        }
        if job.abort_requested {
            return Ok(AbortTicket::InProgress(job.view()));
        }
        job.abort_requested = true;
        tracing::info!(job_id = %id, status = %job.status, "Abort requested");
        Ok(AbortTicket::Signal(job.process))
    }

    /// Record the terminal outcome. Only the first call has any effect.
    pub fn finalize(&mut self, id: &str, outcome: Outcome) -> bool {
        let Some(job) = self.jobs.get_mut(id) else {
            tracing::warn!(job_id = %id, "Finalize for unknown job ignored");
            return false;
        };
        if job.status.is_terminal() {
            tracing::debug!(job_id = %id, status = %job.status, "Duplicate finalize ignored");
            return false;
        }

        job.status = outcome.status();
        job.ended_at = Some(Utc::now());
        job.process = None;
        job.exit_reason = match outcome {
            Outcome::Succeeded => None,
            Outcome::Failed(reason) if reason.trim().is_empty() => Some("job failed".to_string()),
            Outcome::Failed(reason) => Some(reason),
            Outcome::Aborted => Some(ABORT_SENTINEL.to_string()),
        };
        tracing::info!(
            job_id = %id,
            status = %job.status,
            reason = job.exit_reason.as_deref().unwrap_or(""),
            "Job finalized"
        );

        if self.active.as_deref() == Some(id) {
            self.active = None;
        }
        true
    }

    /// True while a non-terminal restore reads from `backup_id`.
    pub fn restore_in_use(&self, backup_id: &str) -> bool {
        self.jobs.values().any(|j| {
            j.kind == JobKind::Restore && j.backup_id == backup_id && !j.status.is_terminal()
        })
    }

    fn evict_history(&mut self) {
        while self.order.len() > MAX_JOB_HISTORY {
            let oldest_terminal = self
                .order
                .iter()
                .position(|id| self.jobs.get(id).is_some_and(|j| j.status.is_terminal()));
            match oldest_terminal {
                Some(pos) => {
                    if let Some(id) = self.order.remove(pos) {
                        self.jobs.remove(&id);
                    }
                }
                None => break,
            }
        }
    }
}
