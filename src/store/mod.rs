//! Persistence layer — the shared job queue.

pub mod libsql_backend;
pub mod migrations;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;
use uuid::Uuid;

use crate::alloc::Capabilities;
use crate::error::{Error, Result, StoreError};
use crate::job::{ControlRequest, Job, JobId, JobSpec};

pub use libsql_backend::LibSqlStore;

/// Run a store operation, retrying a bounded number of times when the
/// database lock could not be acquired. Backoff grows linearly; any
/// other error (and an exhausted retry budget) surfaces unchanged.
pub async fn with_lock_retries<T, F, Fut>(retries: u32, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(Error::Store(StoreError::LockTimeout { timeout })) if attempt < retries => {
                attempt += 1;
                warn!(attempt, ?timeout, "Database locked, retrying");
                tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
            }
            other => return other,
        }
    }
}

/// Outcome of a `remove` request.
#[derive(Debug)]
pub enum RemoveOutcome {
    /// The record was deleted; the returned job carries the log file
    /// paths so the caller can unlink them.
    Removed(Job),
    /// The job was live and `force` was set: a kill was relayed to the
    /// owning worker. The caller should wait for the job to reach a
    /// terminal state and then delete it.
    KillRequested(Job),
}

/// Backend-agnostic job store. All cross-process coordination goes
/// through these operations; a lock is held only for the duration of a
/// single statement, never across a child process's lifetime.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new QUEUED job, assigning a fresh id and log file paths.
    async fn enqueue(&self, spec: JobSpec) -> Result<Job>;

    /// Fetch a job by id.
    async fn get(&self, id: JobId) -> Result<Job>;

    /// Snapshot of all jobs, ordered by id.
    async fn list(&self) -> Result<Vec<Job>>;

    /// Atomically claim the best eligible QUEUED job: highest priority
    /// first, FIFO among equals, GPU jobs only when their index is free.
    /// Selection and the QUEUED→RUNNING transition (with worker and start
    /// time) happen in one indivisible statement, so no two callers can
    /// ever claim the same job.
    async fn claim_next(&self, caps: &Capabilities, worker: Uuid) -> Result<Option<Job>>;

    /// Record (or clear) the spawned process id.
    async fn set_pid(&self, id: JobId, pid: Option<i32>) -> Result<()>;

    /// RUNNING→PAUSED.
    async fn mark_paused(&self, id: JobId) -> Result<()>;

    /// PAUSED→RUNNING.
    async fn mark_resumed(&self, id: JobId) -> Result<()>;

    /// RUNNING/PAUSED→COMPLETED/FAILED from a process exit, recording
    /// exit code and end time. The GPU reservation ends with this same
    /// write. PAUSED is accepted because a suspended process can still
    /// be killed out from under the worker.
    async fn finish(&self, id: JobId, exit_code: i32) -> Result<()>;

    /// Mark a job FAILED without an exit code (spawn failure).
    async fn mark_failed(&self, id: JobId) -> Result<()>;

    /// RUNNING/PAUSED→KILLED.
    async fn mark_killed(&self, id: JobId) -> Result<()>;

    /// Release a claim the worker could not act on (consistency fault
    /// recovery). Only valid while no process exists for the job.
    async fn requeue(&self, id: JobId) -> Result<()>;

    /// Relay a pause/resume/kill request to the owning worker, after
    /// validating it is legal for the job's current state.
    async fn request_control(&self, id: JobId, control: ControlRequest) -> Result<()>;

    /// Read and clear the pending control flag for a job.
    async fn take_control(&self, id: JobId) -> Result<Option<ControlRequest>>;

    /// Live (RUNNING/PAUSED) jobs claimed by a worker session.
    async fn owned(&self, worker: Uuid) -> Result<Vec<Job>>;

    /// All live jobs, regardless of owner.
    async fn live(&self) -> Result<Vec<Job>>;

    /// Live holders of a GPU index (allocator consistency check).
    async fn gpu_holders(&self, gpu: u32) -> Result<Vec<JobId>>;

    /// Remove a job. Fails with InvalidState if the job is live and
    /// `force` is not set; a forced removal of a live job relays a kill
    /// first (see [`RemoveOutcome`]).
    async fn remove(&self, id: JobId, force: bool) -> Result<RemoveOutcome>;

    /// Delete a record regardless of state. Used after a forced removal's
    /// kill grace expires (the owning worker may be dead).
    async fn delete_unchecked(&self, id: JobId) -> Result<Job>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn lock_timeout<T>() -> Result<T> {
        Err(StoreError::LockTimeout {
            timeout: Duration::from_millis(1),
        }
        .into())
    }

    #[tokio::test]
    async fn lock_timeouts_are_retried() {
        let attempts = Cell::new(0u32);
        let result = with_lock_retries(3, || {
            attempts.set(attempts.get() + 1);
            let n = attempts.get();
            async move { if n < 3 { lock_timeout() } else { Ok(7) } }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.get(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_the_lock_timeout() {
        let attempts = Cell::new(0u32);
        let result: Result<()> = with_lock_retries(2, || {
            attempts.set(attempts.get() + 1);
            async { lock_timeout() }
        })
        .await;
        assert!(matches!(
            result,
            Err(Error::Store(StoreError::LockTimeout { .. }))
        ));
        // Initial attempt plus two retries.
        assert_eq!(attempts.get(), 3);
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let attempts = Cell::new(0u32);
        let result: Result<()> = with_lock_retries(3, || {
            attempts.set(attempts.get() + 1);
            async { Err(Error::NotFound(1)) }
        })
        .await;
        assert!(matches!(result, Err(Error::NotFound(1))));
        assert_eq!(attempts.get(), 1);
    }
}
