//! The backup job orchestrator.
//!
//! Ties the registry, manifest writer, transfer engine, process supervisor and
//! backup store together behind the operations the Control API exposes.

use crate::config::Config;
use crate::executor::manifest::{Manifest, ManifestWriter, MANIFEST_VERSION};
use crate::executor::{JobLog, JobRun, TransferEngine};
use crate::job::{AbortTicket, JobId, JobKind, JobRegistry, JobView, NewJob, Outcome, Target};
use crate::store::{self, BackupRecord, BackupStats, BackupStore, LOG_FILE};
use crate::supervisor::Supervisor;
use crate::utils::errors::{OrchestratorError, Result};
use crate::ws::{EventBus, JobEvent};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Default page size for log reads.
pub const DEFAULT_LOG_LIMIT: usize = 1000;

/// A slice of a job log, addressed by line offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogChunk {
    pub job_id: JobId,
    pub offset: usize,
    pub next_offset: usize,
    pub lines: Vec<String>,
    /// True once the job is terminal and `next_offset` reached the end.
    pub complete: bool,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    registry: JobRegistry,
    store: BackupStore,
    manifests: ManifestWriter,
    engine: TransferEngine,
    default_target: Target,
    events: EventBus,
}

impl Orchestrator {
    pub fn new(config: &Config, events: EventBus) -> Self {
        let supervisor = Supervisor::new(config.engine.grace_period());
        Self {
            inner: Arc::new(Inner {
                registry: JobRegistry::new(),
                store: BackupStore::new(config.targets.roots()),
                manifests: ManifestWriter::new(config.components.clone()),
                engine: TransferEngine::new(
                    config.engine.program.clone(),
                    config.engine.args.clone(),
                    supervisor,
                ),
                default_target: config.targets.default,
                events,
            }),
        }
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.inner.registry
    }

    /// Configured component names, sorted.
    pub fn components(&self) -> Vec<String> {
        self.inner.manifests.known_components().map(str::to_string).collect()
    }

    /// Start a backup of `components` to `target` (or the default target).
    ///
    /// Returns once the engine is running, or once the job has already been
    /// finalized as failed because it could not be launched.
    pub async fn start_backup(
        &self,
        target: Option<Target>,
        components: Vec<String>,
    ) -> Result<JobView> {
        let components = dedup(components);
        if components.is_empty() {
            return Err(OrchestratorError::InvalidRequest("components must not be empty".into()));
        }
        let target = target.unwrap_or(self.inner.default_target);
        let source_paths = self.inner.manifests.resolve(&components)?;

        let job_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let backup_id = store::backup_id(&job_id, now);
        let backup_dir = self.inner.store.backup_dir(target, &backup_id)?;
        let log_path = backup_dir.join(LOG_FILE);

        self.inner
            .registry
            .admit(NewJob {
                id: job_id.clone(),
                kind: JobKind::Backup,
                target,
                components: components.clone(),
                backup_id: backup_id.clone(),
                log_path: log_path.clone(),
            })
            .await?;

        let manifest = Manifest {
            version: MANIFEST_VERSION,
            job_id: job_id.clone(),
            kind: JobKind::Backup,
            target,
            backup_id,
            components,
            generated_at: now,
            source_paths,
        };
        self.launch(manifest, backup_dir.clone(), backup_dir, log_path).await
    }

    /// Restore a backup, optionally limited to a subset of its components.
    pub async fn start_restore(
        &self,
        backup_id: &str,
        components: Option<Vec<String>>,
    ) -> Result<JobView> {
        let job_id = Uuid::new_v4().to_string();

        // Held across the lookup so a concurrent delete cannot slip in
        // between finding the backup and admitting the restore.
        let mut state = self.inner.registry.lock().await;
        state.ensure_idle()?;

        let (backup_dir, record) = self
            .inner
            .store
            .find(backup_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("backup {backup_id}")))?;

        let components = match components {
            None => record.manifest.components.clone(),
            Some(requested) => {
                let requested = dedup(requested);
                if requested.is_empty() {
                    return Err(OrchestratorError::InvalidRequest(
                        "components must not be empty".into(),
                    ));
                }
                if let Some(unknown) = requested
                    .iter()
                    .find(|c| !record.manifest.components.contains(*c))
                {
                    return Err(OrchestratorError::UnknownComponent(unknown.clone()));
                }
                requested
            }
        };
        let source_paths: BTreeMap<String, PathBuf> = components
            .iter()
            .map(|c| {
                record
                    .manifest
                    .source_paths
                    .get(c)
                    .map(|p| (c.clone(), p.clone()))
                    .ok_or_else(|| OrchestratorError::UnknownComponent(c.clone()))
            })
            .collect::<Result<_>>()?;

        let target = record.target;
        let restore_dir = self.inner.store.restore_dir(target, &job_id)?;
        let log_path = restore_dir.join(LOG_FILE);

        state.admit(NewJob {
            id: job_id.clone(),
            kind: JobKind::Restore,
            target,
            components: components.clone(),
            backup_id: record.id.clone(),
            log_path: log_path.clone(),
        })?;
        drop(state);

        let manifest = Manifest {
            version: MANIFEST_VERSION,
            job_id,
            kind: JobKind::Restore,
            target,
            backup_id: record.id,
            components,
            generated_at: Utc::now(),
            source_paths,
        };
        self.launch(manifest, restore_dir, backup_dir, log_path).await
    }

    /// Persist the manifest, start the runner task and wait for the first
    /// engine process (or for the job to fail before one existed).
    async fn launch(
        &self,
        manifest: Manifest,
        artifact_dir: PathBuf,
        backup_dir: PathBuf,
        log_path: PathBuf,
    ) -> Result<JobView> {
        let job_id = manifest.job_id.clone();
        let run = JobRun::plan(&manifest, &backup_dir, log_path);

        let handle = match self.inner.manifests.write(&artifact_dir, manifest).await {
            Ok(handle) => handle,
            Err(e) => {
                let reason = format!("failed to write manifest: {e}");
                error!(job_id = %job_id, "{}", reason);
                self.finish(&run, Outcome::Failed(reason), None).await;
                return self.inner.registry.get(&job_id).await;
            }
        };
        debug!(job_id = %job_id, manifest = %handle.path.display(), "Launching job");

        let (ready_tx, ready_rx) = oneshot::channel();
        let this = self.clone();
        tokio::spawn(async move {
            // Dropped only after finish, so a job that never started is
            // already terminal when the caller looks at it.
            let mut ready = Some(ready_tx);
            match JobLog::open(&run.log_path).await {
                Ok(mut log) => {
                    let outcome = this
                        .inner
                        .engine
                        .run(&this.inner.registry, &run, &mut log, &mut ready)
                        .await;
                    this.finish(&run, outcome, Some(&mut log)).await;
                }
                Err(e) => {
                    let reason = format!("cannot open job log {}: {e}", run.log_path.display());
                    error!(job_id = %run.job_id, "{}", reason);
                    this.finish(&run, Outcome::Failed(reason), None).await;
                }
            }
            drop(ready);
        });

        // Err means the runner finished without ever starting a process.
        let spawned = ready_rx.await.is_ok();

        let view = self.inner.registry.get(&job_id).await?;
        if spawned {
            self.inner.events.broadcast(JobEvent::Started(view.clone()));
        }
        Ok(view)
    }

    /// Finalize a job from its runner: publish the backup record on success,
    /// record the outcome, and close the log with the final status.
    async fn finish(&self, run: &JobRun, outcome: Outcome, log: Option<&mut JobLog>) {
        // Size the backup before taking the lock; the walk can be slow.
        let size_bytes = match (&outcome, run.kind) {
            (Outcome::Succeeded, JobKind::Backup) => match run.log_path.parent() {
                Some(dir) => Some(store::dir_size(dir).await),
                None => None,
            },
            _ => None,
        };

        let (applied, view) = {
            let mut state = self.inner.registry.lock().await;
            let mut outcome = if state.is_abort_requested(&run.job_id) {
                Outcome::Aborted
            } else {
                outcome
            };

            if outcome == Outcome::Succeeded
                && run.kind == JobKind::Backup
                && !state.is_terminal(&run.job_id)
            {
                if let Err(e) = self.publish_record(run, size_bytes.unwrap_or(0)).await {
                    error!(job_id = %run.job_id, "Failed to publish backup record: {}", e);
                    outcome = Outcome::Failed(format!("failed to record backup: {e}"));
                }
            }

            let applied = state.finalize(&run.job_id, outcome);
            let view = state.view(&run.job_id);

            // Written under the lock so readers never see a terminal job
            // whose log is still growing.
            if let (Some(log), Some(view)) = (log, view.as_ref()) {
                let note = match &view.exit_reason {
                    Some(reason) => format!("job {}: {}", view.status, reason),
                    None => format!("job {}", view.status),
                };
                log.annotate(&note).await;
                log.flush().await;
            }
            (applied, view)
        };

        let Some(view) = view else { return };
        if applied {
            self.inner.events.broadcast(JobEvent::Finished(view));
        }
    }

    async fn publish_record(&self, run: &JobRun, size_bytes: u64) -> Result<()> {
        let dir = run
            .log_path
            .parent()
            .ok_or_else(|| OrchestratorError::Config("job log has no parent directory".into()))?;
        let manifest = crate::executor::manifest::read(dir).await?;
        let record = BackupRecord {
            id: manifest.backup_id.clone(),
            job_id: run.job_id.clone(),
            target: run.target,
            created_at: Utc::now(),
            size_bytes,
            manifest,
        };
        self.inner.store.publish(dir, &record).await
    }

    pub async fn status(&self, job_id: &str) -> Result<JobView> {
        self.inner.registry.get(job_id).await
    }

    /// Abort a job. Idempotent: aborting a terminal or already-aborting job
    /// returns its current state.
    pub async fn abort(&self, job_id: &str) -> Result<JobView> {
        let ticket = self.inner.registry.lock().await.request_abort(job_id)?;
        let group = match ticket {
            AbortTicket::Finished(view) | AbortTicket::InProgress(view) => return Ok(view),
            AbortTicket::Signal(group) => group,
        };

        if let Some(group) = group {
            match self.inner.engine.supervisor().abort(group).await {
                Ok(result) => {
                    info!(job_id = %job_id, pgid = group.pgid(), ?result, "Process group stopped")
                }
                Err(OrchestratorError::NoSuchProcess(_)) => {
                    debug!(job_id = %job_id, pgid = group.pgid(), "Process group already gone");
                }
                Err(e) => {
                    error!(job_id = %job_id, pgid = group.pgid(), "Abort failed: {}", e);
                    return Err(e);
                }
            }
        }

        let (applied, view) = {
            let mut state = self.inner.registry.lock().await;
            let applied = state.finalize(job_id, Outcome::Aborted);
            (applied, state.view(job_id))
        };
        let view = view.ok_or_else(|| OrchestratorError::NotFound(format!("job {job_id}")))?;
        if applied {
            self.inner.events.broadcast(JobEvent::Finished(view.clone()));
        }
        Ok(view)
    }

    pub async fn list_backups(&self, target: Option<Target>) -> Result<Vec<BackupRecord>> {
        self.inner.store.list(target).await
    }

    pub async fn backup_stats(&self) -> Result<BackupStats> {
        self.inner.store.stats().await
    }

    /// Delete a backup unless a running restore reads from it.
    pub async fn delete_backup(&self, backup_id: &str) -> Result<BackupRecord> {
        // The registry lock keeps restores from being admitted until the
        // record is gone. The tree itself is removed without the lock.
        let state = self.inner.registry.lock().await;
        if state.restore_in_use(backup_id) {
            return Err(OrchestratorError::InUse(backup_id.to_string()));
        }
        let (dir, record) = self.inner.store.retire(backup_id).await?;
        drop(state);

        self.inner.store.purge(&dir).await?;
        Ok(record)
    }

    /// Lines `offset..offset+limit` of a job log as currently on disk.
    pub async fn read_log(
        &self,
        job_id: &str,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<LogChunk> {
        let view = self.inner.registry.get(job_id).await?;
        let content = match tokio::fs::read(&view.log_path).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };

        // A trailing fragment without newline may still be being written.
        let complete_part = match content.rfind('\n') {
            Some(idx) => &content[..=idx],
            None => "",
        };
        let all: Vec<&str> = complete_part.lines().collect();
        let limit = limit.unwrap_or(DEFAULT_LOG_LIMIT);
        let lines: Vec<String> = all
            .iter()
            .skip(offset)
            .take(limit)
            .map(|l| l.to_string())
            .collect();
        let next_offset = offset + lines.len();

        Ok(LogChunk {
            job_id: view.id,
            offset,
            next_offset,
            complete: view.status.is_terminal() && next_offset >= all.len(),
            lines,
        })
    }

    /// Log of the active job, else the most recent one.
    pub async fn read_current_log(&self, offset: usize, limit: Option<usize>) -> Result<LogChunk> {
        let current = self
            .inner
            .registry
            .current()
            .await
            .ok_or_else(|| OrchestratorError::NotFound("no job has run yet".into()))?;
        self.read_log(&current.id, offset, limit).await
    }

    /// Abort whatever is active; used on orchestrator shutdown.
    pub async fn shutdown(&self) {
        let active = self.inner.registry.lock().await.active_id().map(str::to_string);
        if let Some(job_id) = active {
            warn!(job_id = %job_id, "Aborting active job for shutdown");
            if let Err(e) = self.abort(&job_id).await {
                error!(job_id = %job_id, "Failed to abort job during shutdown: {}", e);
            }
        }
    }
}

/// Drop duplicate names, keeping first occurrence order.
fn dedup(names: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    names
        .into_iter()
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty() && seen.insert(n.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_keeps_order() {
        let names = vec!["data".into(), "config".into(), "data".into(), " ".into()];
        assert_eq!(dedup(names), vec!["data".to_string(), "config".to_string()]);
    }
}
