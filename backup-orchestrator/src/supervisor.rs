//! Process supervision for the transfer engine.
//!
//! Every engine invocation is spawned as the leader of a fresh process group
//! so that the data movers it starts can be signaled together. Termination is
//! two-phase: SIGTERM to the group, a bounded grace period, then SIGKILL.

use crate::utils::errors::{OrchestratorError, Result};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How often group liveness is polled while waiting for it to exit.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Upper bound on waiting for the group to vanish after SIGKILL.
const KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to a supervised process group (pgid == leader pid).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessGroup {
    pgid: i32,
}

impl ProcessGroup {
    /// Record the group of a child spawned through [`Supervisor::command`].
    pub fn track(child: &Child) -> Result<Self> {
        child
            .id()
            .map(|pid| Self { pgid: pid as i32 })
            .ok_or(OrchestratorError::NoSuchProcess(0))
    }

    pub fn from_raw(pgid: i32) -> Self {
        Self { pgid }
    }

    pub fn pgid(&self) -> i32 {
        self.pgid
    }

    /// Send `signal` to every member of the group.
    pub fn signal(&self, signal: Signal) -> Result<()> {
        match killpg(Pid::from_raw(self.pgid), signal) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => Err(OrchestratorError::NoSuchProcess(self.pgid)),
            Err(e) => Err(e.into()),
        }
    }

    /// True while at least one non-zombie member remains.
    pub fn is_alive(&self) -> bool {
        match killpg(Pid::from_raw(self.pgid), None) {
            Ok(()) => has_live_member(self.pgid),
            Err(Errno::ESRCH) => false,
            // EPERM: the group exists but belongs to someone else.
            Err(_) => true,
        }
    }
}

#[cfg(target_os = "linux")]
fn has_live_member(pgid: i32) -> bool {
    let Ok(processes) = procfs::process::all_processes() else {
        return true;
    };
    processes
        .filter_map(|p| p.ok())
        .filter_map(|p| p.stat().ok())
        .any(|stat| stat.pgrp == pgid && !matches!(stat.state, 'Z' | 'X'))
}

#[cfg(not(target_os = "linux"))]
fn has_live_member(_pgid: i32) -> bool {
    true
}

/// How an abort ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortResult {
    /// The group exited within the grace period after SIGTERM.
    Terminated,
    /// The group had to be SIGKILLed.
    Killed,
}

#[derive(Debug, Clone)]
pub struct Supervisor {
    grace_period: Duration,
}

impl Supervisor {
    pub fn new(grace_period: Duration) -> Self {
        Self { grace_period }
    }

    /// Command preconfigured to lead its own process group with captured output.
    pub fn command(&self, program: &Path) -> Command {
        let mut cmd = Command::new(program);
        cmd.process_group(0)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        cmd
    }

    /// Block the calling task until the group leader exits.
    pub async fn wait(&self, child: &mut Child) -> Result<ExitStatus> {
        Ok(child.wait().await?)
    }

    /// Two-phase termination of the whole group.
    ///
    /// Returns `NoSuchProcess` if the group was already gone before the first
    /// signal; callers treat that as a successful abort.
    pub async fn abort(&self, group: ProcessGroup) -> Result<AbortResult> {
        group.signal(Signal::SIGTERM)?;
        info!(
            pgid = group.pgid(),
            grace_ms = self.grace_period.as_millis() as u64,
            "Sent SIGTERM to process group"
        );

        if wait_until_gone(group, self.grace_period).await {
            return Ok(AbortResult::Terminated);
        }

        warn!(pgid = group.pgid(), "Process group survived grace period, sending SIGKILL");
        match group.signal(Signal::SIGKILL) {
            Ok(()) => {}
            Err(OrchestratorError::NoSuchProcess(_)) => return Ok(AbortResult::Terminated),
            Err(e) => return Err(e),
        }

        if wait_until_gone(group, KILL_TIMEOUT).await {
            Ok(AbortResult::Killed)
        } else {
            Err(OrchestratorError::AbortTimeout(group.pgid()))
        }
    }
}

async fn wait_until_gone(group: ProcessGroup, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !group.is_alive() {
            debug!(pgid = group.pgid(), "Process group gone");
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    fn sh(supervisor: &Supervisor, script: &str) -> Child {
        let mut cmd = supervisor.command(Path::new("/bin/sh"));
        cmd.arg("-c").arg(script);
        cmd.spawn().unwrap()
    }

    #[tokio::test]
    async fn test_wait_returns_exit_code() {
        let supervisor = Supervisor::new(Duration::from_secs(1));
        let mut child = sh(&supervisor, "exit 3");
        let status = supervisor.wait(&mut child).await.unwrap();
        assert_eq!(status.code(), Some(3));
    }

    #[tokio::test]
    async fn test_child_leads_its_own_group() {
        let supervisor = Supervisor::new(Duration::from_secs(1));
        let mut child = sh(&supervisor, "sleep 5");
        let group = ProcessGroup::track(&child).unwrap();

        let pgid = nix::unistd::getpgid(Some(Pid::from_raw(group.pgid()))).unwrap();
        assert_eq!(pgid.as_raw(), group.pgid());
        assert_ne!(pgid, nix::unistd::getpgrp());

        supervisor.abort(group).await.unwrap();
        let status = child.wait().await.unwrap();
        assert_eq!(status.signal(), Some(Signal::SIGTERM as i32));
    }

    #[tokio::test]
    async fn test_abort_kills_descendants() {
        let supervisor = Supervisor::new(Duration::from_secs(2));
        // Background grandchild plus a foreground sleep.
        let mut child = sh(&supervisor, "sleep 30 & sleep 30; wait");
        let group = ProcessGroup::track(&child).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(group.is_alive());

        let waiter = tokio::spawn(async move { child.wait().await });
        let result = supervisor.abort(group).await.unwrap();
        assert_eq!(result, AbortResult::Terminated);
        waiter.await.unwrap().unwrap();
        assert!(!group.is_alive());
    }

    #[tokio::test]
    async fn test_abort_escalates_to_sigkill() {
        let supervisor = Supervisor::new(Duration::from_millis(300));
        let mut child = sh(&supervisor, "trap '' TERM; sleep 30 & wait; sleep 30");
        let group = ProcessGroup::track(&child).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let waiter = tokio::spawn(async move { child.wait().await });
        let result = supervisor.abort(group).await.unwrap();
        assert_eq!(result, AbortResult::Killed);
        let status = waiter.await.unwrap().unwrap();
        assert_eq!(status.signal(), Some(Signal::SIGKILL as i32));
        assert!(!group.is_alive());
    }

    #[tokio::test]
    async fn test_abort_after_exit_is_no_such_process() {
        let supervisor = Supervisor::new(Duration::from_millis(100));
        let mut child = sh(&supervisor, "exit 0");
        let group = ProcessGroup::track(&child).unwrap();
        child.wait().await.unwrap();

        let err = supervisor.abort(group).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NoSuchProcess(pgid) if pgid == group.pgid()));
    }
}
