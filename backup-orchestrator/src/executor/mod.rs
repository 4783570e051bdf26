//! Transfer engine adapter.
//!
//! Runs the external transfer program once per component, strictly in order,
//! and stops at the first component that fails. Each invocation leads its own
//! process group (see [`crate::supervisor`]); its stdout and stderr are merged
//! line by line into the job log and scanned for fatal markers.

pub mod classify;
pub mod manifest;

use crate::job::{JobId, JobKind, JobRegistry, Outcome, Target};
use crate::store::DATA_DIR;
use crate::supervisor::{ProcessGroup, Supervisor};
use crate::utils::errors::OrchestratorError;
use classify::FatalMarkers;
use manifest::Manifest;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

/// Prefix for lines the orchestrator itself writes into a job log.
pub const ANNOTATION_PREFIX: &str = "[orchestrator]";

/// How long to keep draining output after the group leader exited.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

const LINE_CHANNEL_CAPACITY: usize = 1024;

/// Failure reason when the engine exits but members of its group remain.
pub const STRAGGLERS_REASON: &str = "engine left processes running";

/// One engine invocation: a single component moved from `source` to `destination`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub component: String,
    pub source: PathBuf,
    pub destination: PathBuf,
}

/// Everything the adapter needs to run a job.
#[derive(Debug, Clone)]
pub struct JobRun {
    pub job_id: JobId,
    pub kind: JobKind,
    pub target: Target,
    pub log_path: PathBuf,
    pub steps: Vec<Step>,
}

impl JobRun {
    /// Build the step list from a manifest.
    ///
    /// Backups copy each source path into `<backup_dir>/data/<component>`;
    /// restores copy `<backup_dir>/data/<component>` back to the recorded
    /// source path.
    pub fn plan(manifest: &Manifest, backup_dir: &Path, log_path: PathBuf) -> Self {
        let data_dir = backup_dir.join(DATA_DIR);
        let steps = manifest
            .components
            .iter()
            .filter_map(|component| {
                let original = manifest.source_paths.get(component)?.clone();
                let stored = data_dir.join(component);
                let (source, destination) = match manifest.kind {
                    JobKind::Backup => (original, stored),
                    JobKind::Restore => (stored, original),
                };
                Some(Step {
                    component: component.clone(),
                    source,
                    destination,
                })
            })
            .collect();

        Self {
            job_id: manifest.job_id.clone(),
            kind: manifest.kind,
            target: manifest.target,
            log_path,
            steps,
        }
    }
}

/// Result of a single engine invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Ok,
    FatalError(String),
    Aborted,
}

/// Append-only writer for a job log.
pub struct JobLog {
    file: tokio::fs::File,
    path: PathBuf,
}

impl JobLog {
    pub async fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Append one line verbatim.
    pub async fn line(&mut self, line: &str) {
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        if let Err(e) = self.file.write_all(&buf).await {
            warn!(path = %self.path.display(), "Failed to append to job log: {}", e);
        }
    }

    /// Append an orchestrator note; these are never classified.
    pub async fn annotate(&mut self, message: &str) {
        let line = format!("{ANNOTATION_PREFIX} {message}");
        self.line(&line).await;
    }

    pub async fn flush(&mut self) {
        if let Err(e) = self.file.flush().await {
            warn!(path = %self.path.display(), "Failed to flush job log: {}", e);
        }
    }
}

/// Bridges jobs to the external transfer program.
#[derive(Debug, Clone)]
pub struct TransferEngine {
    program: PathBuf,
    args: Vec<String>,
    supervisor: Supervisor,
}

impl TransferEngine {
    pub fn new(program: PathBuf, args: Vec<String>, supervisor: Supervisor) -> Self {
        Self {
            program,
            args,
            supervisor,
        }
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Run every step in order. `ready` fires once the first process group
    /// has been attached to the job; it is left untouched if no process was
    /// ever started. The log is flushed before returning.
    pub async fn run(
        &self,
        registry: &JobRegistry,
        run: &JobRun,
        log: &mut JobLog,
        ready: &mut Option<oneshot::Sender<()>>,
    ) -> Outcome {
        let outcome = self.run_steps(registry, run, log, ready).await;
        log.flush().await;
        outcome
    }

    async fn run_steps(
        &self,
        registry: &JobRegistry,
        run: &JobRun,
        log: &mut JobLog,
        ready: &mut Option<oneshot::Sender<()>>,
    ) -> Outcome {
        for step in &run.steps {
            if registry.lock().await.is_abort_requested(&run.job_id) {
                return Outcome::Aborted;
            }

            log.annotate(&format!(
                "{} {}: {} -> {}",
                run.kind,
                step.component,
                step.source.display(),
                step.destination.display()
            ))
            .await;

            match self.run_step(registry, run, step, log, ready).await {
                StepOutcome::Ok => {
                    log.annotate(&format!("component {} done", step.component)).await;
                }
                StepOutcome::FatalError(reason) => {
                    log.annotate(&format!(
                        "stopping at component {}, remaining components skipped",
                        step.component
                    ))
                    .await;
                    return Outcome::Failed(reason);
                }
                StepOutcome::Aborted => return Outcome::Aborted,
            }
        }
        Outcome::Succeeded
    }

    async fn run_step(
        &self,
        registry: &JobRegistry,
        run: &JobRun,
        step: &Step,
        log: &mut JobLog,
        ready: &mut Option<oneshot::Sender<()>>,
    ) -> StepOutcome {
        if run.kind == JobKind::Backup {
            if let Some(parent) = step.destination.parent() {
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    let reason = format!("cannot create {}: {e}", parent.display());
                    log.annotate(&reason).await;
                    return StepOutcome::FatalError(reason);
                }
            }
        }

        let mut cmd = self.supervisor.command(&self.program);
        cmd.args(&self.args)
            .arg(run.kind.mode())
            .arg(&step.component)
            .arg(&step.source)
            .arg(&step.destination)
            .env("BACKUP_JOB_ID", &run.job_id)
            .env("BACKUP_TARGET", run.target.as_str())
            .env("BACKUP_MODE", run.kind.mode());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let reason =
                    format!("failed to launch engine {}: {e}", self.program.display());
                error!(job_id = %run.job_id, "{}", reason);
                log.annotate(&reason).await;
                return StepOutcome::FatalError(reason);
            }
        };

        let group = match ProcessGroup::track(&child) {
            Ok(group) => group,
            Err(e) => {
                let reason = format!("engine exited before it could be tracked: {e}");
                let _ = child.wait().await;
                log.annotate(&reason).await;
                return StepOutcome::FatalError(reason);
            }
        };

        if !registry.lock().await.attach(&run.job_id, group) {
            // Aborted between the previous check and the spawn.
            if let Err(e) = self.supervisor.abort(group).await {
                warn!(
                    job_id = %run.job_id,
                    pgid = group.pgid(),
                    "Abort of late process group: {}",
                    e
                );
            }
            let _ = child.wait().await;
            return StepOutcome::Aborted;
        }
        if let Some(tx) = ready.take() {
            let _ = tx.send(());
        }
        info!(
            job_id = %run.job_id,
            component = %step.component,
            pgid = group.pgid(),
            "Engine started"
        );

        let (tx, mut rx) = mpsc::channel::<String>(LINE_CHANNEL_CAPACITY);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_lines(stderr, tx.clone()));
        }
        drop(tx);

        let mut markers = FatalMarkers::default();
        let mut output_open = true;
        let status = loop {
            tokio::select! {
                line = rx.recv(), if output_open => match line {
                    Some(line) => {
                        markers.observe(&line);
                        log.line(&line).await;
                    }
                    None => output_open = false,
                },
                status = self.supervisor.wait(&mut child) => break status,
            }
        };

        // Background children of the engine must not outlive the step.
        let stragglers = group.is_alive();
        if stragglers {
            warn!(
                job_id = %run.job_id,
                pgid = group.pgid(),
                "Engine exited but left processes running"
            );
            log.annotate(&format!("{STRAGGLERS_REASON}, stopping process group")).await;
            match self.supervisor.abort(group).await {
                Ok(_) | Err(OrchestratorError::NoSuchProcess(_)) => {}
                Err(e) => error!(
                    job_id = %run.job_id,
                    pgid = group.pgid(),
                    "Failed to stop leftover processes: {}",
                    e
                ),
            }
        }

        // With the group gone the pipes close; the timeout only covers
        // writers that escaped the group.
        if output_open {
            let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
                while let Some(line) = rx.recv().await {
                    markers.observe(&line);
                    log.line(&line).await;
                }
            })
            .await;
            if drained.is_err() {
                warn!(
                    job_id = %run.job_id,
                    pgid = group.pgid(),
                    "Engine output still open after exit, detaching"
                );
            }
        }
        log.flush().await;

        {
            let mut state = registry.lock().await;
            if !group.is_alive() {
                state.detach(&run.job_id, group);
            }
            if state.is_abort_requested(&run.job_id) {
                return StepOutcome::Aborted;
            }
        }

        if stragglers {
            let reason = markers.into_first().unwrap_or_else(|| STRAGGLERS_REASON.to_string());
            return StepOutcome::FatalError(reason);
        }
        match status {
            Ok(status) => classify_exit(status, markers),
            Err(e) => StepOutcome::FatalError(format!("failed to wait for engine: {e}")),
        }
    }
}

/// Explicit fatal markers win over the exit code.
fn classify_exit(status: ExitStatus, markers: FatalMarkers) -> StepOutcome {
    if let Some(line) = markers.into_first() {
        return StepOutcome::FatalError(line);
    }
    if status.success() {
        return StepOutcome::Ok;
    }
    match (status.code(), status.signal()) {
        (Some(code), _) => StepOutcome::FatalError(format!("non-zero exit (code {code})")),
        (None, Some(signal)) => StepOutcome::FatalError(format!("terminated by signal {signal}")),
        (None, None) => StepOutcome::FatalError("non-zero exit".to_string()),
    }
}

/// Forward raw output lines; invalid UTF-8 is replaced rather than dropped.
async fn pump_lines(reader: impl AsyncRead + Unpin, tx: mpsc::Sender<String>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                while matches!(buf.last(), Some(b'\n' | b'\r')) {
                    buf.pop();
                }
                let line = String::from_utf8_lossy(&buf).into_owned();
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("Failed to read engine output: {}", e);
                break;
            }
        }
    }
}
