//! Job model and state machine.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Monotonically increasing job identifier, assigned by the store and
/// never reused.
pub type JobId = i64;

/// State of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting to be claimed by a worker.
    Queued,
    /// Claimed; its process is executing.
    Running,
    /// Claimed; its process is suspended.
    Paused,
    /// Process exited with code 0.
    Completed,
    /// Process exited non-zero, or spawning it failed.
    Failed,
    /// Terminated by an explicit kill request.
    Killed,
}

impl JobState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: JobState) -> bool {
        use JobState::*;

        matches!(
            (self, target),
            (Queued, Running)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Killed)
                | (Paused, Running)
                | (Paused, Killed)
                // A suspended process can still die (external SIGKILL,
                // OOM killer); its exit must close the record.
                | (Paused, Completed)
                | (Paused, Failed)
                // Conflict-recovery path: the claiming worker may release a
                // claim it could not act on, before a process exists.
                | (Running, Queued)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Killed)
    }

    /// Check if the job currently holds a claim (and its GPU, if any).
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    /// Database string for this state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Killed => "killed",
        }
    }

    /// Parse a database string. Unknown strings map to `Queued` so a
    /// forward-migrated database stays readable.
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "paused" => Self::Paused,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "killed" => Self::Killed,
            _ => Self::Queued,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pending control request relayed through the store to the owning
/// worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlRequest {
    Pause,
    Resume,
    Kill,
}

impl ControlRequest {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Kill => "kill",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pause" => Some(Self::Pause),
            "resume" => Some(Self::Resume),
            "kill" => Some(Self::Kill),
            _ => None,
        }
    }

    /// Whether this request is legal for a job in `state`.
    ///
    /// Pause is also accepted while already paused (no-op at apply time);
    /// everything else requires the exact source state.
    pub fn valid_for(&self, state: JobState) -> bool {
        match self {
            Self::Pause => matches!(state, JobState::Running | JobState::Paused),
            Self::Resume => state == JobState::Paused,
            Self::Kill => state.is_live(),
        }
    }
}

impl std::fmt::Display for ControlRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User-supplied attributes of a job, fixed at enqueue time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    /// Shell command line to run.
    pub command: String,
    /// Working directory; the worker's own cwd when absent.
    pub cwd: Option<PathBuf>,
    /// Higher priority is scheduled sooner.
    pub priority: i64,
    /// Exclusive GPU index; absent means a CPU job.
    pub gpu: Option<u32>,
}

impl JobSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            cwd: None,
            priority: 0,
            gpu: None,
        }
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn gpu(mut self, gpu: u32) -> Self {
        self.gpu = Some(gpu);
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

/// A persisted job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub command: String,
    pub cwd: Option<PathBuf>,
    pub priority: i64,
    pub gpu: Option<u32>,
    pub state: JobState,
    /// Session id of the worker that claimed this job.
    pub worker: Option<uuid::Uuid>,
    /// OS process id while a child exists.
    pub pid: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub out_file: PathBuf,
    pub err_file: PathBuf,
    /// Pending pause/resume/kill request, cleared by the owning worker.
    pub control: Option<ControlRequest>,
}

impl Job {
    /// Elapsed runtime, up to now for live jobs.
    pub fn elapsed(&self) -> Option<chrono::Duration> {
        self.started_at.map(|start| {
            let end = self.finished_at.unwrap_or_else(Utc::now);
            end.signed_duration_since(start)
        })
    }
}
