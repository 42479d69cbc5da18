//! libSQL backend — the shared, crash-surviving job queue.
//!
//! One local database file coordinates every worker and CLI invocation.
//! SQLite serializes writers, so the claim statement (a single
//! `UPDATE … WHERE id = (SELECT …) RETURNING …`) is race-free under any
//! number of concurrent callers: selection, the QUEUED→RUNNING
//! transition, and the GPU reservation it implies are one indivisible
//! write.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database, params};
use tracing::info;
use uuid::Uuid;

use crate::alloc::Capabilities;
use crate::config::Config;
use crate::error::{Error, Result, StoreError};
use crate::job::{ControlRequest, Job, JobId, JobSpec, JobState};
use crate::store::{JobStore, RemoveOutcome, migrations};

/// Column list shared by every query that maps a full job row.
const JOB_COLUMNS: &str = "id, command, cwd, priority, gpu, state, worker, pid, \
     created_at, started_at, finished_at, exit_code, out_file, err_file, control";

/// libSQL job store backend.
///
/// Holds a single connection; `libsql::Connection` is `Send + Sync` and
/// safe for concurrent async use.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<Database>,
    conn: Connection,
    out_dir: PathBuf,
    busy_timeout: Duration,
}

impl LibSqlStore {
    /// Open (or create) the queue database file and run migrations.
    pub async fn open(config: &Config) -> Result<Self> {
        Self::open_at(&config.db_path, &config.out_dir, config.busy_timeout).await
    }

    /// Open a specific database file (tests use a tempdir path).
    pub async fn open_at(
        path: &Path,
        out_dir: &Path,
        busy_timeout: Duration,
    ) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Open(format!("Failed to create database directory: {e}")))?;
        }
        std::fs::create_dir_all(out_dir)
            .map_err(|e| StoreError::Open(format!("Failed to create output directory: {e}")))?;

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Open(format!("Failed to open queue database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Open(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
            out_dir: out_dir.to_path_buf(),
            busy_timeout,
        };
        store.init(path).await?;
        Ok(store)
    }

    /// Create an in-memory store (for tests).
    pub async fn new_memory(out_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(out_dir)
            .map_err(|e| StoreError::Open(format!("Failed to create output directory: {e}")))?;

        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Open(format!("Failed to create in-memory database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Open(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
            out_dir: out_dir.to_path_buf(),
            busy_timeout: Duration::from_secs(5),
        };
        store.init(Path::new(":memory:")).await?;
        Ok(store)
    }

    async fn init(&self, path: &Path) -> Result<()> {
        // Bounded blocking on a contended write lock; contention beyond
        // this surfaces as StoreError::LockTimeout and is retried by the
        // caller. The PRAGMA returns the applied value as a row, so it
        // must go through query, not execute.
        let pragma = format!("PRAGMA busy_timeout = {}", self.busy_timeout.as_millis());
        let mut rows = self
            .conn
            .query(&pragma, ())
            .await
            .map_err(|e| self.store_err(e))?;
        while rows.next().await.map_err(|e| self.store_err(e))?.is_some() {}
        migrations::run_migrations(&self.conn).await?;
        info!(path = %path.display(), "Queue database opened");
        Ok(())
    }

    fn store_err(&self, err: libsql::Error) -> Error {
        StoreError::from_libsql(err, self.busy_timeout).into()
    }

    /// Check the outcome of a state-guarded UPDATE. Zero rows changed
    /// means the guard failed: a concurrent transition won, and the
    /// caller gets InvalidState (or NotFound) instead of clobbering.
    async fn check_transition(&self, changed: u64, id: JobId, attempted: &str) -> Result<()> {
        if changed == 0 {
            let job = self.get(id).await?;
            return Err(Error::InvalidState {
                id,
                state: job.state,
                attempted: attempted.to_string(),
            });
        }
        Ok(())
    }
}

// ── Row mapping helpers ─────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

/// Map a libsql Row to a Job. Column order matches JOB_COLUMNS.
fn row_to_job(row: &libsql::Row) -> std::result::Result<Job, libsql::Error> {
    let id: i64 = row.get(0)?;
    let state_str: String = row.get(5)?;
    let worker_str: Option<String> = row.get(6).ok();
    let created_str: String = row.get(8)?;
    let started_str: Option<String> = row.get(9).ok();
    let finished_str: Option<String> = row.get(10).ok();
    let control_str: Option<String> = row.get(14).ok();

    Ok(Job {
        id,
        command: row.get(1)?,
        cwd: row.get::<String>(2).ok().map(PathBuf::from),
        priority: row.get(3)?,
        gpu: row.get::<i64>(4).ok().map(|g| g as u32),
        state: JobState::from_str_lossy(&state_str),
        worker: worker_str.and_then(|w| Uuid::parse_str(&w).ok()),
        pid: row.get::<i64>(7).ok().map(|p| p as i32),
        created_at: parse_datetime(&created_str),
        started_at: started_str.as_deref().map(parse_datetime),
        finished_at: finished_str.as_deref().map(parse_datetime),
        exit_code: row.get::<i64>(11).ok().map(|c| c as i32),
        out_file: PathBuf::from(row.get::<String>(12)?),
        err_file: PathBuf::from(row.get::<String>(13)?),
        control: control_str.as_deref().and_then(ControlRequest::parse),
    })
}

#[async_trait]
impl JobStore for LibSqlStore {
    async fn enqueue(&self, spec: JobSpec) -> Result<Job> {
        // The log file paths derive from the id, so the row is inserted
        // and completed inside one transaction: no other connection can
        // claim a half-initialized record.
        let tx = self
            .conn
            .transaction()
            .await
            .map_err(|e| self.store_err(e))?;

        tx.execute(
            "INSERT INTO jobs (command, cwd, priority, gpu, state, created_at, out_file, err_file) \
             VALUES (?1, ?2, ?3, ?4, 'queued', ?5, '', '')",
            params![
                spec.command.clone(),
                spec.cwd.as_ref().map(|p| p.display().to_string()),
                spec.priority,
                spec.gpu.map(|g| g as i64),
                now_rfc3339(),
            ],
        )
        .await
        .map_err(|e| self.store_err(e))?;

        let id = tx.last_insert_rowid();
        let out_file = self.out_dir.join(format!("{id}.out"));
        let err_file = self.out_dir.join(format!("{id}.err"));

        tx.execute(
            "UPDATE jobs SET out_file = ?1, err_file = ?2 WHERE id = ?3",
            params![
                out_file.display().to_string(),
                err_file.display().to_string(),
                id
            ],
        )
        .await
        .map_err(|e| self.store_err(e))?;

        tx.commit().await.map_err(|e| self.store_err(e))?;
        self.get(id).await
    }

    async fn get(&self, id: JobId) -> Result<Job> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| self.store_err(e))?;

        match rows.next().await.map_err(|e| self.store_err(e))? {
            Some(row) => row_to_job(&row).map_err(|e| {
                StoreError::Corrupt {
                    id,
                    message: e.to_string(),
                }
                .into()
            }),
            None => Err(Error::NotFound(id)),
        }
    }

    async fn list(&self) -> Result<Vec<Job>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY id"),
                (),
            )
            .await
            .map_err(|e| self.store_err(e))?;

        let mut jobs = Vec::new();
        while let Some(row) = rows.next().await.map_err(|e| self.store_err(e))? {
            if let Ok(job) = row_to_job(&row) {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn claim_next(&self, caps: &Capabilities, worker: Uuid) -> Result<Option<Job>> {
        if !caps.free_slot {
            return Ok(None);
        }

        // Eligibility, ordering, and the QUEUED→RUNNING transition in a
        // single statement. `priority DESC, id ASC` is the one global
        // deterministic order: ids are enqueue-monotonic, so the id
        // tie-break is strict FIFO.
        let sql = format!(
            "UPDATE jobs SET state = 'running', worker = ?1, started_at = ?2 \
             WHERE id = (\
                 SELECT id FROM jobs \
                 WHERE state = 'queued' AND {} \
                 ORDER BY priority DESC, id ASC LIMIT 1\
             ) \
             RETURNING {JOB_COLUMNS}",
            caps.eligibility_sql()
        );

        let mut rows = self
            .conn
            .query(&sql, params![worker.to_string(), now_rfc3339()])
            .await
            .map_err(|e| self.store_err(e))?;

        match rows.next().await.map_err(|e| self.store_err(e))? {
            Some(row) => {
                let job = row_to_job(&row).map_err(|e| StoreError::Query(e.to_string()))?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    async fn set_pid(&self, id: JobId, pid: Option<i32>) -> Result<()> {
        self.conn
            .execute(
                "UPDATE jobs SET pid = ?1 WHERE id = ?2",
                params![pid.map(|p| p as i64), id],
            )
            .await
            .map_err(|e| self.store_err(e))?;
        Ok(())
    }

    async fn mark_paused(&self, id: JobId) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE jobs SET state = 'paused' WHERE id = ?1 AND state = 'running'",
                params![id],
            )
            .await
            .map_err(|e| self.store_err(e))?;
        self.check_transition(changed, id, "pause").await
    }

    async fn mark_resumed(&self, id: JobId) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE jobs SET state = 'running' WHERE id = ?1 AND state = 'paused'",
                params![id],
            )
            .await
            .map_err(|e| self.store_err(e))?;
        self.check_transition(changed, id, "resume").await
    }

    async fn finish(&self, id: JobId, exit_code: i32) -> Result<()> {
        let state = if exit_code == 0 {
            JobState::Completed
        } else {
            JobState::Failed
        };
        // PAUSED is accepted too: a suspended process can still die
        // (external SIGKILL, OOM killer), and its exit is ground truth.
        let changed = self
            .conn
            .execute(
                "UPDATE jobs SET state = ?1, finished_at = ?2, exit_code = ?3, \
                 pid = NULL, control = NULL \
                 WHERE id = ?4 AND state IN ('running', 'paused')",
                params![state.as_str(), now_rfc3339(), exit_code as i64, id],
            )
            .await
            .map_err(|e| self.store_err(e))?;
        self.check_transition(changed, id, "finish").await
    }

    async fn mark_failed(&self, id: JobId) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE jobs SET state = 'failed', finished_at = ?1, \
                 pid = NULL, control = NULL \
                 WHERE id = ?2 AND state = 'running'",
                params![now_rfc3339(), id],
            )
            .await
            .map_err(|e| self.store_err(e))?;
        self.check_transition(changed, id, "mark failed").await
    }

    async fn mark_killed(&self, id: JobId) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE jobs SET state = 'killed', finished_at = ?1, \
                 pid = NULL, control = NULL \
                 WHERE id = ?2 AND state IN ('running', 'paused')",
                params![now_rfc3339(), id],
            )
            .await
            .map_err(|e| self.store_err(e))?;
        self.check_transition(changed, id, "kill").await
    }

    async fn requeue(&self, id: JobId) -> Result<()> {
        // Only valid before a process exists: the pid guard keeps a
        // spawned job from silently losing its claim.
        let changed = self
            .conn
            .execute(
                "UPDATE jobs SET state = 'queued', worker = NULL, started_at = NULL \
                 WHERE id = ?1 AND state = 'running' AND pid IS NULL",
                params![id],
            )
            .await
            .map_err(|e| self.store_err(e))?;

        if changed == 0 {
            let job = self.get(id).await?;
            return Err(Error::InvalidState {
                id,
                state: job.state,
                attempted: "requeue".to_string(),
            });
        }
        Ok(())
    }

    async fn request_control(&self, id: JobId, control: ControlRequest) -> Result<()> {
        let job = self.get(id).await?;
        if !control.valid_for(job.state) {
            return Err(Error::InvalidState {
                id,
                state: job.state,
                attempted: control.to_string(),
            });
        }

        // Guarded on the state we validated against; a concurrent
        // transition invalidates the request rather than racing it.
        let changed = self
            .conn
            .execute(
                "UPDATE jobs SET control = ?1 WHERE id = ?2 AND state = ?3",
                params![control.as_str(), id, job.state.as_str()],
            )
            .await
            .map_err(|e| self.store_err(e))?;

        if changed == 0 {
            let job = self.get(id).await?;
            return Err(Error::InvalidState {
                id,
                state: job.state,
                attempted: control.to_string(),
            });
        }
        Ok(())
    }

    async fn take_control(&self, id: JobId) -> Result<Option<ControlRequest>> {
        let job = self.get(id).await?;
        let Some(control) = job.control else {
            return Ok(None);
        };

        let changed = self
            .conn
            .execute(
                "UPDATE jobs SET control = NULL WHERE id = ?1 AND control = ?2",
                params![id, control.as_str()],
            )
            .await
            .map_err(|e| self.store_err(e))?;

        // A concurrent overwrite (e.g. pause superseded by kill) is left
        // for the next iteration.
        if changed == 0 {
            return Ok(None);
        }
        Ok(Some(control))
    }

    async fn owned(&self, worker: Uuid) -> Result<Vec<Job>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs \
                     WHERE worker = ?1 AND state IN ('running', 'paused') ORDER BY id"
                ),
                params![worker.to_string()],
            )
            .await
            .map_err(|e| self.store_err(e))?;

        let mut jobs = Vec::new();
        while let Some(row) = rows.next().await.map_err(|e| self.store_err(e))? {
            jobs.push(row_to_job(&row).map_err(|e| StoreError::Query(e.to_string()))?);
        }
        Ok(jobs)
    }

    async fn live(&self) -> Result<Vec<Job>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs \
                     WHERE state IN ('running', 'paused') ORDER BY id"
                ),
                (),
            )
            .await
            .map_err(|e| self.store_err(e))?;

        let mut jobs = Vec::new();
        while let Some(row) = rows.next().await.map_err(|e| self.store_err(e))? {
            jobs.push(row_to_job(&row).map_err(|e| StoreError::Query(e.to_string()))?);
        }
        Ok(jobs)
    }

    async fn gpu_holders(&self, gpu: u32) -> Result<Vec<JobId>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id FROM jobs \
                 WHERE gpu = ?1 AND state IN ('running', 'paused') ORDER BY id",
                params![gpu as i64],
            )
            .await
            .map_err(|e| self.store_err(e))?;

        let mut ids = Vec::new();
        while let Some(row) = rows.next().await.map_err(|e| self.store_err(e))? {
            ids.push(
                row.get::<i64>(0)
                    .map_err(|e| StoreError::Query(e.to_string()))?,
            );
        }
        Ok(ids)
    }

    async fn remove(&self, id: JobId, force: bool) -> Result<RemoveOutcome> {
        let job = self.get(id).await?;

        if job.state.is_live() {
            if !force {
                return Err(Error::InvalidState {
                    id,
                    state: job.state,
                    attempted: "remove without force".to_string(),
                });
            }
            self.request_control(id, ControlRequest::Kill).await?;
            return Ok(RemoveOutcome::KillRequested(job));
        }

        let removed = self.delete_unchecked(id).await?;
        Ok(RemoveOutcome::Removed(removed))
    }

    async fn delete_unchecked(&self, id: JobId) -> Result<Job> {
        let job = self.get(id).await?;
        self.conn
            .execute("DELETE FROM jobs WHERE id = ?1", params![id])
            .await
            .map_err(|e| self.store_err(e))?;
        Ok(job)
    }
}
