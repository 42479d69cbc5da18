//! Signal backends — the capability seam for pause/resume/kill.
//!
//! Process suspension is not available in every execution environment,
//! so signaling goes through a trait: the scheduler and allocator never
//! see which backend is in use. `UnixSignals` is the default; `KillOnly`
//! supports termination but rejects suspension.

use crate::error::ProcessError;

/// Signals a job's process group.
pub trait SignalBackend: Send + Sync {
    /// Whether `suspend`/`resume` are usable on this backend.
    fn supports_suspend(&self) -> bool;

    /// Suspend the process group (SIGSTOP semantics).
    fn suspend(&self, pid: i32) -> Result<(), ProcessError>;

    /// Resume a suspended process group (SIGCONT semantics).
    fn resume(&self, pid: i32) -> Result<(), ProcessError>;

    /// Request graceful termination of the process group.
    fn terminate(&self, pid: i32) -> Result<(), ProcessError>;

    /// Forcibly kill the process group.
    fn force_kill(&self, pid: i32) -> Result<(), ProcessError>;
}

/// Default backend: raw signals to the job's process group.
#[derive(Debug, Default)]
pub struct UnixSignals;

impl UnixSignals {
    fn send(&self, pid: i32, signal: libc::c_int, name: &'static str) -> Result<(), ProcessError> {
        // Children are spawned with their own process group (pgid == pid),
        // so killpg reaches the whole tree.
        let rc = unsafe { libc::killpg(pid, signal) };
        if rc == 0 {
            Ok(())
        } else {
            Err(ProcessError::Signal {
                pid,
                signal: name,
                message: std::io::Error::last_os_error().to_string(),
            })
        }
    }
}

impl SignalBackend for UnixSignals {
    fn supports_suspend(&self) -> bool {
        true
    }

    fn suspend(&self, pid: i32) -> Result<(), ProcessError> {
        self.send(pid, libc::SIGSTOP, "SIGSTOP")
    }

    fn resume(&self, pid: i32) -> Result<(), ProcessError> {
        self.send(pid, libc::SIGCONT, "SIGCONT")
    }

    fn terminate(&self, pid: i32) -> Result<(), ProcessError> {
        self.send(pid, libc::SIGTERM, "SIGTERM")
    }

    fn force_kill(&self, pid: i32) -> Result<(), ProcessError> {
        self.send(pid, libc::SIGKILL, "SIGKILL")
    }
}

/// Backend for environments that disallow process suspension: kill works,
/// pause/resume surface `ProcessError::Unsupported`.
#[derive(Debug, Default)]
pub struct KillOnly {
    inner: UnixSignals,
}

impl SignalBackend for KillOnly {
    fn supports_suspend(&self) -> bool {
        false
    }

    fn suspend(&self, _pid: i32) -> Result<(), ProcessError> {
        Err(ProcessError::Unsupported {
            operation: "suspend",
        })
    }

    fn resume(&self, _pid: i32) -> Result<(), ProcessError> {
        Err(ProcessError::Unsupported { operation: "resume" })
    }

    fn terminate(&self, pid: i32) -> Result<(), ProcessError> {
        self.inner.terminate(pid)
    }

    fn force_kill(&self, pid: i32) -> Result<(), ProcessError> {
        self.inner.force_kill(pid)
    }
}
