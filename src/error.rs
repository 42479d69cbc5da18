//! Error types for tspy.

use std::time::Duration;

use crate::job::{JobId, JobState};

/// Top-level error type for the spooler.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("No such job: {0}")]
    NotFound(JobId),

    #[error("Job {id} is {state}, cannot {attempted}")]
    InvalidState {
        id: JobId,
        state: JobState,
        attempted: String,
    },

    /// A claimed GPU turned out to have more than one non-terminal holder.
    /// This is an invariant violation in the shared store, never a
    /// user-visible condition: the claim is released and retried.
    #[error("GPU {gpu} reserved by jobs {holders:?} at once")]
    ResourceConflict { gpu: u32, holders: Vec<JobId> },

    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// OS process spawn/signal failures.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to send {signal} to pid {pid}: {message}")]
    Signal {
        pid: i32,
        signal: &'static str,
        message: String,
    },

    #[error("Process backend does not support {operation}")]
    Unsupported { operation: &'static str },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Persisted-store failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to open database: {0}")]
    Open(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Could not acquire database lock within {timeout:?}")]
    LockTimeout { timeout: Duration },

    #[error("Corrupt job record {id}: {message}")]
    Corrupt { id: JobId, message: String },

    #[error("Migration failed: {0}")]
    Migration(String),
}

impl StoreError {
    /// Map a libsql error, recognizing busy/locked conditions so callers
    /// can retry with backoff instead of surfacing them immediately.
    pub fn from_libsql(err: libsql::Error, busy_timeout: Duration) -> Self {
        let text = err.to_string();
        if text.contains("database is locked") || text.contains("busy") {
            StoreError::LockTimeout {
                timeout: busy_timeout,
            }
        } else {
            StoreError::Query(text)
        }
    }
}

/// Result type alias for the spooler.
pub type Result<T> = std::result::Result<T, Error>;
