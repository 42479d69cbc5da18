//! Process lifecycle — spawn, output capture, suspend/resume, kill, reap.

pub mod signal;

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::error::ProcessError;
use crate::job::Job;

pub use signal::{KillOnly, SignalBackend, UnixSignals};

/// A spawned job process owned by one worker slot.
#[derive(Debug)]
pub struct RunningChild {
    /// Claim-time snapshot of the job record.
    pub job: Job,
    /// Process (group) id.
    pub pid: i32,
    /// Whether the group is currently suspended.
    pub paused: bool,
    child: Child,
}

impl RunningChild {
    /// Non-blocking exit check. Returns the exit code once the process
    /// has exited: the real code when it exited normally, `128 + signal`
    /// when a signal ended it.
    pub fn try_reap(&mut self) -> Result<Option<i32>, ProcessError> {
        match self.child.try_wait()? {
            Some(status) => Ok(Some(exit_code_of(status))),
            None => Ok(None),
        }
    }

    /// Block until the process exits.
    pub async fn wait(&mut self) -> Result<i32, ProcessError> {
        let status = self.child.wait().await?;
        Ok(exit_code_of(status))
    }
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return 128 + sig;
        }
    }
    status.code().unwrap_or(-1)
}

/// Spawns job processes and applies lifecycle control via a
/// [`SignalBackend`].
pub struct ProcessController {
    backend: Arc<dyn SignalBackend>,
    kill_grace: Duration,
}

impl ProcessController {
    pub fn new(backend: Arc<dyn SignalBackend>, kill_grace: Duration) -> Self {
        Self {
            backend,
            kill_grace,
        }
    }

    pub fn supports_suspend(&self) -> bool {
        self.backend.supports_suspend()
    }

    /// Start the job's command with stdout/stderr redirected to its log
    /// files (created/truncated here, so concurrent readers observe a
    /// growing append-only stream). The child gets its own process group
    /// so signals reach everything it spawns.
    ///
    /// On failure the cause is also written into the error file; the
    /// caller marks the job FAILED and no slot remains held.
    pub fn spawn(&self, job: Job) -> Result<RunningChild, ProcessError> {
        let out = std::fs::File::create(&job.out_file)?;
        let err = std::fs::File::create(&job.err_file)?;

        let mut command = Command::new("sh");
        command
            .args(["-c", &job.command])
            .stdin(Stdio::null())
            .stdout(Stdio::from(out))
            .stderr(Stdio::from(err));

        if let Some(cwd) = &job.cwd {
            command.current_dir(cwd);
        }
        if let Some(gpu) = job.gpu {
            command.env("CUDA_VISIBLE_DEVICES", gpu.to_string());
        }
        #[cfg(unix)]
        command.process_group(0);

        let child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                let _ = std::fs::write(
                    &job.err_file,
                    format!("Failed to run job: {source}\n"),
                );
                return Err(ProcessError::Spawn {
                    command: job.command.clone(),
                    source,
                });
            }
        };

        // Present right after a successful spawn.
        let pid = child.id().map(|p| p as i32).unwrap_or(-1);
        debug!(job = job.id, pid, "Spawned job process");

        Ok(RunningChild {
            job,
            pid,
            paused: false,
            child,
        })
    }

    /// Suspend the process group in place. No-op if already paused.
    pub fn pause(&self, child: &mut RunningChild) -> Result<(), ProcessError> {
        if child.paused {
            return Ok(());
        }
        self.backend.suspend(child.pid)?;
        child.paused = true;
        debug!(job = child.job.id, pid = child.pid, "Paused job");
        Ok(())
    }

    /// Resume a suspended process group.
    pub fn resume(&self, child: &mut RunningChild) -> Result<(), ProcessError> {
        self.backend.resume(child.pid)?;
        child.paused = false;
        debug!(job = child.job.id, pid = child.pid, "Resumed job");
        Ok(())
    }

    /// Terminate the process group: SIGTERM, bounded grace period, then
    /// SIGKILL escalation. Returns the exit code once the process is
    /// gone. A paused group is resumed first so the termination signal
    /// can be delivered.
    pub async fn kill(&self, child: &mut RunningChild) -> Result<i32, ProcessError> {
        if child.paused {
            // Best effort: escalation below covers a group that cannot
            // be woken.
            if let Err(e) = self.backend.resume(child.pid) {
                warn!(job = child.job.id, error = %e, "Failed to resume before kill");
            }
            child.paused = false;
        }

        self.backend.terminate(child.pid)?;

        match tokio::time::timeout(self.kill_grace, child.child.wait()).await {
            Ok(status) => Ok(exit_code_of(status?)),
            Err(_) => {
                warn!(
                    job = child.job.id,
                    pid = child.pid,
                    grace = ?self.kill_grace,
                    "Process ignored SIGTERM, escalating"
                );
                self.backend.force_kill(child.pid)?;
                Ok(exit_code_of(child.child.wait().await?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobSpec, JobState};
    use chrono::Utc;

    fn controller() -> ProcessController {
        ProcessController::new(Arc::new(UnixSignals), Duration::from_secs(2))
    }

    fn job_for(command: &str, dir: &std::path::Path) -> Job {
        let spec = JobSpec::new(command);
        Job {
            id: 1,
            command: spec.command,
            cwd: None,
            priority: 0,
            gpu: None,
            state: JobState::Running,
            worker: None,
            pid: None,
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            finished_at: None,
            exit_code: None,
            out_file: dir.join("1.out"),
            err_file: dir.join("1.err"),
            control: None,
        }
    }

    #[tokio::test]
    async fn spawn_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut child = controller()
            .spawn(job_for("echo hello", dir.path()))
            .unwrap();
        let code = child.wait().await.unwrap();
        assert_eq!(code, 0);
        let out = std::fs::read_to_string(dir.path().join("1.out")).unwrap();
        assert_eq!(out, "hello\n");
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut child = controller()
            .spawn(job_for("exit 3", dir.path()))
            .unwrap();
        assert_eq!(child.wait().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn spawn_failure_writes_error_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = job_for("echo never", dir.path());
        job.cwd = Some(dir.path().join("no/such/dir"));

        let err = controller().spawn(job).unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
        let written = std::fs::read_to_string(dir.path().join("1.err")).unwrap();
        assert!(written.contains("Failed to run job"));
    }

    #[tokio::test]
    async fn kill_terminates_promptly() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller();
        let mut child = ctl.spawn(job_for("sleep 100", dir.path())).unwrap();
        let code = ctl.kill(&mut child).await.unwrap();
        // SIGTERM → 128 + 15
        assert_eq!(code, 128 + libc::SIGTERM);
    }

    #[tokio::test]
    async fn kill_escalates_past_a_trapped_sigterm() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = ProcessController::new(Arc::new(UnixSignals), Duration::from_millis(200));
        let mut child = ctl
            .spawn(job_for("trap '' TERM; sleep 100", dir.path()))
            .unwrap();
        // Give the shell a moment to install the trap.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let code = ctl.kill(&mut child).await.unwrap();
        assert_eq!(code, 128 + libc::SIGKILL);
    }

    #[tokio::test]
    async fn kill_reaches_a_paused_job() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller();
        let mut child = ctl.spawn(job_for("sleep 100", dir.path())).unwrap();
        ctl.pause(&mut child).unwrap();
        assert!(child.paused);
        let code = ctl.kill(&mut child).await.unwrap();
        assert_eq!(code, 128 + libc::SIGTERM);
    }

    #[tokio::test]
    async fn pause_resume_preserves_output() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller();
        let mut child = ctl
            .spawn(job_for("echo one; sleep 0.3; echo two", dir.path()))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        ctl.pause(&mut child).unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        // Still suspended: the second line must not have appeared.
        let mid = std::fs::read_to_string(dir.path().join("1.out")).unwrap();
        assert_eq!(mid, "one\n");
        ctl.resume(&mut child).unwrap();
        assert_eq!(child.wait().await.unwrap(), 0);
        let out = std::fs::read_to_string(dir.path().join("1.out")).unwrap();
        assert_eq!(out, "one\ntwo\n");
    }
}
