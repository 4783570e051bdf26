//! End-to-end job scenarios against a fake `/bin/sh` transfer engine.

use backup_orchestrator::executor::STRAGGLERS_REASON;
use backup_orchestrator::job::{JobKind, JobStatus, JobView, Target, ABORT_SENTINEL};
use backup_orchestrator::supervisor::ProcessGroup;
use backup_orchestrator::ws::{EventBus, JobEvent};
use backup_orchestrator::{Config, Orchestrator, OrchestratorError};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

/// `$1` mode, `$2` component, `$3` source, `$4` destination.
const COPYING_ENGINE: &str = r#"
echo "$1 $2"
mkdir -p "$4"
echo payload > "$4/$2.bin"
"#;

struct Harness {
    dir: TempDir,
    events: EventBus,
    orchestrator: Orchestrator,
}

fn harness_with_program(program: impl FnOnce(&Path) -> PathBuf) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.targets.nvme = dir.path().join("nvme");
    config.targets.usb = dir.path().join("usb");
    config.targets.network = dir.path().join("network");
    config.engine.program = program(dir.path());
    config.engine.grace_period_secs = 1;
    config.components = ["config", "data", "recordings"]
        .into_iter()
        .map(|name| (name.to_string(), dir.path().join("src").join(name)))
        .collect();

    let events = EventBus::new();
    let orchestrator = Orchestrator::new(&config, events.clone());
    Harness {
        dir,
        events,
        orchestrator,
    }
}

fn harness(engine_body: &str) -> Harness {
    harness_with_program(|dir| {
        let path = dir.join("engine.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{engine_body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    })
}

fn names(components: &[&str]) -> Vec<String> {
    components.iter().map(|c| c.to_string()).collect()
}

async fn wait_terminal(orchestrator: &Orchestrator, job_id: &str) -> JobView {
    for _ in 0..400 {
        let view = orchestrator.status(job_id).await.unwrap();
        if view.status.is_terminal() {
            return view;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("job {job_id} did not reach a terminal state");
}

async fn log_lines(orchestrator: &Orchestrator, job_id: &str) -> Vec<String> {
    orchestrator.read_log(job_id, 0, None).await.unwrap().lines
}

#[tokio::test]
async fn backup_succeeds_and_is_listed() {
    let h = harness(COPYING_ENGINE);
    let started = h
        .orchestrator
        .start_backup(Some(Target::Nvme), names(&["config", "data"]))
        .await
        .unwrap();
    assert_eq!(started.kind, JobKind::Backup);

    let done = wait_terminal(&h.orchestrator, &started.id).await;
    assert_eq!(done.status, JobStatus::Succeeded);
    assert!(done.exit_reason.is_none());
    assert!(done.ended_at.is_some());

    let backups = h.orchestrator.list_backups(Some(Target::Nvme)).await.unwrap();
    assert_eq!(backups.len(), 1);
    let record = &backups[0];
    assert_eq!(record.id, started.backup_id);
    assert_eq!(record.manifest.components, names(&["config", "data"]));
    assert!(record.size_bytes > 0);

    let data = h.dir.path().join("nvme").join(&record.id).join("data");
    assert!(data.join("config/config.bin").exists());
    assert!(data.join("data/data.bin").exists());

    let lines = log_lines(&h.orchestrator, &started.id).await;
    assert!(lines.contains(&"backup config".to_string()));
    assert!(lines.contains(&"backup data".to_string()));

    let stats = h.orchestrator.backup_stats().await.unwrap();
    assert_eq!(stats.total_count, 1);
    assert_eq!(stats.last_backup, Some(record.created_at));
}

#[tokio::test]
async fn abort_leaves_no_record_and_no_process() {
    let h = harness("echo started; sleep 30; echo completed");
    let started = h
        .orchestrator
        .start_backup(None, names(&["config"]))
        .await
        .unwrap();
    assert_eq!(started.status, JobStatus::Running);
    let pgid = started.pgid.unwrap();

    let aborted = h.orchestrator.abort(&started.id).await.unwrap();
    assert_eq!(aborted.status, JobStatus::Aborted);
    assert_eq!(aborted.exit_reason.as_deref(), Some(ABORT_SENTINEL));
    assert!(!ProcessGroup::from_raw(pgid).is_alive());

    // Aborting again reports the same terminal state.
    let again = h.orchestrator.abort(&started.id).await.unwrap();
    assert_eq!(again.ended_at, aborted.ended_at);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(h.orchestrator.list_backups(None).await.unwrap().is_empty());
    let lines = log_lines(&h.orchestrator, &started.id).await;
    assert!(!lines.iter().any(|l| l == "completed"));
}

#[tokio::test]
async fn concurrent_starts_admit_one_job() {
    let h = harness("sleep 30");
    let mut handles = Vec::new();
    for _ in 0..8 {
        let orchestrator = h.orchestrator.clone();
        handles.push(tokio::spawn(async move {
            orchestrator.start_backup(None, names(&["config"])).await
        }));
    }

    let mut winners = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(view) => winners.push(view),
            Err(OrchestratorError::AlreadyRunning { .. }) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(winners.len(), 1);

    let view = h.orchestrator.abort(&winners[0].id).await.unwrap();
    assert_eq!(view.status, JobStatus::Aborted);
}

#[tokio::test]
async fn delete_refused_while_restore_reads_backup() {
    let h = harness(&format!(
        "if [ \"$1\" = restore ]; then sleep 30; fi\n{COPYING_ENGINE}"
    ));
    let backup = h
        .orchestrator
        .start_backup(Some(Target::Usb), names(&["config"]))
        .await
        .unwrap();
    assert_eq!(wait_terminal(&h.orchestrator, &backup.id).await.status, JobStatus::Succeeded);

    let restore = h.orchestrator.start_restore(&backup.backup_id, None).await.unwrap();
    assert_eq!(restore.kind, JobKind::Restore);
    assert_eq!(restore.status, JobStatus::Running);
    assert_eq!(restore.target, Target::Usb);

    let err = h.orchestrator.delete_backup(&backup.backup_id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::InUse(_)));

    h.orchestrator.abort(&restore.id).await.unwrap();
    h.orchestrator.delete_backup(&backup.backup_id).await.unwrap();
    assert!(h.orchestrator.list_backups(None).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delete_does_not_block_status_while_removing_tree() {
    let h = harness(COPYING_ENGINE);
    let backup = h
        .orchestrator
        .start_backup(Some(Target::Nvme), names(&["config"]))
        .await
        .unwrap();
    assert_eq!(wait_terminal(&h.orchestrator, &backup.id).await.status, JobStatus::Succeeded);

    let backup_dir = h.dir.path().join("nvme").join(&backup.backup_id);
    let bulk = backup_dir.join("data").join("bulk");
    std::fs::create_dir_all(&bulk).unwrap();
    for i in 0..20_000 {
        std::fs::write(bulk.join(format!("f{i}")), b"x").unwrap();
    }

    let orchestrator = h.orchestrator.clone();
    let backup_id = backup.backup_id.clone();
    let delete = tokio::spawn(async move { orchestrator.delete_backup(&backup_id).await });

    while backup_dir.join("record.json").exists() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    let view = tokio::time::timeout(Duration::from_secs(1), h.orchestrator.status(&backup.id))
        .await
        .expect("status blocked behind delete")
        .unwrap();
    assert_eq!(view.status, JobStatus::Succeeded);
    assert!(backup_dir.exists(), "tree removed before the lock was released");
    assert!(h.orchestrator.list_backups(None).await.unwrap().is_empty());

    let record = delete.await.unwrap().unwrap();
    assert_eq!(record.id, backup.backup_id);
    assert!(!backup_dir.exists());
}

#[tokio::test]
async fn leftover_engine_processes_fail_job_and_are_stopped() {
    let h = harness("echo \"leader $$\"; sleep 30 >/dev/null 2>&1 & echo done");
    let started = h
        .orchestrator
        .start_backup(None, names(&["config"]))
        .await
        .unwrap();

    let done = wait_terminal(&h.orchestrator, &started.id).await;
    assert_eq!(done.status, JobStatus::Failed);
    assert_eq!(done.exit_reason.as_deref(), Some(STRAGGLERS_REASON));
    assert!(h.orchestrator.list_backups(None).await.unwrap().is_empty());

    let lines = log_lines(&h.orchestrator, &started.id).await;
    let pgid: i32 = lines
        .iter()
        .find_map(|l| l.strip_prefix("leader "))
        .unwrap()
        .parse()
        .unwrap();
    assert!(!ProcessGroup::from_raw(pgid).is_alive());

    let next = h
        .orchestrator
        .start_backup(None, names(&["config"]))
        .await
        .unwrap();
    assert_ne!(next.id, started.id);
    wait_terminal(&h.orchestrator, &next.id).await;
}

#[tokio::test]
async fn restore_rejects_components_outside_backup() {
    let h = harness(COPYING_ENGINE);
    let backup = h
        .orchestrator
        .start_backup(None, names(&["config"]))
        .await
        .unwrap();
    wait_terminal(&h.orchestrator, &backup.id).await;

    let err = h
        .orchestrator
        .start_restore(&backup.backup_id, Some(names(&["data"])))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::UnknownComponent(c) if c == "data"));

    let err = h.orchestrator.start_restore("19700101T000000Z-deadbeef", None).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::NotFound(_)));
}

#[tokio::test]
async fn spawn_failure_fails_job_immediately() {
    let h = harness_with_program(|dir| dir.join("missing-engine"));
    let view = h
        .orchestrator
        .start_backup(None, names(&["config"]))
        .await
        .unwrap();
    assert_eq!(view.status, JobStatus::Failed);
    assert!(view
        .exit_reason
        .as_deref()
        .unwrap()
        .starts_with("failed to launch engine"));

    // The slot is free again.
    let next = h.orchestrator.start_backup(None, names(&["config"])).await.unwrap();
    assert_eq!(next.status, JobStatus::Failed);
    assert!(h.orchestrator.list_backups(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn fatal_marker_fails_despite_zero_exit() {
    let h = harness(
        "if [ \"$2\" = data ]; then echo 'rsync: ERROR: disk full'; fi\necho \"ran $2\"\nexit 0",
    );
    let started = h
        .orchestrator
        .start_backup(None, names(&["config", "data", "recordings"]))
        .await
        .unwrap();
    let done = wait_terminal(&h.orchestrator, &started.id).await;
    assert_eq!(done.status, JobStatus::Failed);
    assert_eq!(done.exit_reason.as_deref(), Some("rsync: ERROR: disk full"));

    let lines = log_lines(&h.orchestrator, &started.id).await;
    assert!(lines.contains(&"ran config".to_string()));
    assert!(!lines.contains(&"ran recordings".to_string()));
    assert!(h.orchestrator.list_backups(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn lifecycle_events_are_broadcast() {
    let h = harness(COPYING_ENGINE);
    let mut rx = h.events.subscribe();
    let started = h
        .orchestrator
        .start_backup(None, names(&["config"]))
        .await
        .unwrap();

    let first = tokio::time::timeout(Duration::from_secs(10), rx.recv()).await.unwrap().unwrap();
    let second = tokio::time::timeout(Duration::from_secs(10), rx.recv()).await.unwrap().unwrap();

    // The runner may finish before the caller announces the start.
    let mut kinds: Vec<&str> = [&first, &second]
        .iter()
        .map(|event| match event {
            JobEvent::Started(view) => {
                assert_eq!(view.id, started.id);
                "started"
            }
            JobEvent::Finished(view) => {
                assert_eq!(view.id, started.id);
                assert_eq!(view.status, JobStatus::Succeeded);
                "finished"
            }
        })
        .collect();
    kinds.sort();
    assert_eq!(kinds, vec!["finished", "started"]);
}

#[tokio::test]
async fn shutdown_aborts_active_job() {
    let h = harness("sleep 30");
    let started = h
        .orchestrator
        .start_backup(None, names(&["config"]))
        .await
        .unwrap();
    h.orchestrator.shutdown().await;
    let view = h.orchestrator.status(&started.id).await.unwrap();
    assert_eq!(view.status, JobStatus::Aborted);
}
