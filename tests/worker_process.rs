//! End-to-end worker tests: real child processes, real store, control
//! relayed the way a separate CLI invocation would.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use tspy::alloc::Capabilities;
use tspy::config::{Config, ShutdownMode};
use tspy::error::{Result, StoreError};
use tspy::job::{ControlRequest, Job, JobId, JobSpec, JobState};
use tspy::process::{ProcessController, UnixSignals};
use tspy::store::{JobStore, LibSqlStore, RemoveOutcome};
use tspy::worker::Worker;

fn test_config(dir: &Path) -> Config {
    Config {
        db_path: dir.join("queue.db"),
        out_dir: dir.to_path_buf(),
        poll_interval: Duration::from_millis(50),
        reap_interval: Duration::from_millis(30),
        kill_grace: Duration::from_secs(2),
        ..Default::default()
    }
}

async fn open_store(config: &Config) -> Arc<LibSqlStore> {
    Arc::new(LibSqlStore::open(config).await.unwrap())
}

fn spawn_worker(
    store: Arc<LibSqlStore>,
    config: Config,
    parallelism: usize,
    gpu_filter: Option<Vec<u32>>,
) -> (JoinHandle<()>, watch::Sender<bool>) {
    let controller = ProcessController::new(Arc::new(UnixSignals), config.kill_grace);
    let mut worker = Worker::new(store, controller, config, parallelism, gpu_filter);
    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        worker.run(rx).await.unwrap();
    });
    (handle, tx)
}

/// Poll the store until `pred` holds for the job, panicking after the
/// deadline.
async fn wait_for(
    store: &LibSqlStore,
    id: JobId,
    what: &str,
    pred: impl Fn(&tspy::job::Job) -> bool,
) -> tspy::job::Job {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let job = store.get(id).await.unwrap();
        if pred(&job) {
            return job;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for job {id} to be {what}; got {job:?}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn worker_runs_queued_jobs_to_completion() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let store = open_store(&config).await;

    let ok = store.enqueue(JobSpec::new("echo hi")).await.unwrap();
    let bad = store.enqueue(JobSpec::new("exit 7")).await.unwrap();

    let (handle, shutdown) = spawn_worker(store.clone(), config, 2, None);

    let ok = wait_for(&store, ok.id, "terminal", |j| j.state.is_terminal()).await;
    let bad = wait_for(&store, bad.id, "terminal", |j| j.state.is_terminal()).await;

    assert_eq!(ok.state, JobState::Completed);
    assert_eq!(ok.exit_code, Some(0));
    assert!(ok.pid.is_some());
    assert_eq!(
        std::fs::read_to_string(&ok.out_file).unwrap(),
        "hi\n"
    );

    assert_eq!(bad.state, JobState::Failed);
    assert_eq!(bad.exit_code, Some(7));

    shutdown.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn same_gpu_jobs_never_run_concurrently() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let store = open_store(&config).await;

    let a = store
        .enqueue(JobSpec::new("sleep 0.4").gpu(0))
        .await
        .unwrap();
    let b = store
        .enqueue(JobSpec::new("sleep 0.4").gpu(0))
        .await
        .unwrap();

    // Two slots, but the shared device must serialize them.
    let (handle, shutdown) = spawn_worker(store.clone(), config, 2, None);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let jobs = store.list().await.unwrap();
        let live = jobs.iter().filter(|j| j.state.is_live()).count();
        assert!(live <= 1, "GPU 0 held by {live} jobs at once");
        if jobs.iter().all(|j| j.state == JobState::Completed) {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("jobs did not finish: {jobs:?}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let a = store.get(a.id).await.unwrap();
    let b = store.get(b.id).await.unwrap();
    assert_eq!(a.exit_code, Some(0));
    assert_eq!(b.exit_code, Some(0));

    shutdown.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn gpu_job_sees_its_device() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let store = open_store(&config).await;

    let job = store
        .enqueue(JobSpec::new("echo $CUDA_VISIBLE_DEVICES").gpu(1))
        .await
        .unwrap();

    let (handle, shutdown) = spawn_worker(store.clone(), config, 1, Some(vec![1]));

    let job = wait_for(&store, job.id, "terminal", |j| j.state.is_terminal()).await;
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(std::fs::read_to_string(&job.out_file).unwrap(), "1\n");

    shutdown.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn kill_request_is_relayed_to_the_owning_worker() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let store = open_store(&config).await;

    let job = store.enqueue(JobSpec::new("sleep 100")).await.unwrap();

    let (handle, shutdown) = spawn_worker(store.clone(), config, 1, None);

    wait_for(&store, job.id, "running", |j| j.state == JobState::Running).await;

    // A second process would do exactly this through the CLI.
    let client = open_store(&test_config(dir.path())).await;
    client
        .request_control(job.id, ControlRequest::Kill)
        .await
        .unwrap();

    let job = wait_for(&store, job.id, "terminal", |j| j.state.is_terminal()).await;
    assert_eq!(job.state, JobState::Killed);

    shutdown.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn pause_and_resume_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let store = open_store(&config).await;

    let job = store
        .enqueue(JobSpec::new("echo start; sleep 2; echo end"))
        .await
        .unwrap();

    let (handle, shutdown) = spawn_worker(store.clone(), config, 1, None);

    wait_for(&store, job.id, "running", |j| j.state == JobState::Running).await;

    store
        .request_control(job.id, ControlRequest::Pause)
        .await
        .unwrap();
    wait_for(&store, job.id, "paused", |j| j.state == JobState::Paused).await;

    store
        .request_control(job.id, ControlRequest::Resume)
        .await
        .unwrap();
    let job = wait_for(&store, job.id, "terminal", |j| j.state.is_terminal()).await;

    assert_eq!(job.state, JobState::Completed);
    assert_eq!(
        std::fs::read_to_string(&job.out_file).unwrap(),
        "start\nend\n"
    );

    shutdown.send(true).unwrap();
    handle.await.unwrap();
}

/// A paused process can still be killed out from under the worker
/// (external SIGKILL, OOM killer). The reaper must still close the
/// record instead of leaving it PAUSED with its claim held.
#[tokio::test]
async fn externally_killed_paused_job_is_closed() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let store = open_store(&config).await;

    let job = store.enqueue(JobSpec::new("sleep 100")).await.unwrap();

    let (handle, shutdown) = spawn_worker(store.clone(), config, 1, None);

    wait_for(&store, job.id, "running", |j| j.state == JobState::Running).await;
    store
        .request_control(job.id, ControlRequest::Pause)
        .await
        .unwrap();
    let paused = wait_for(&store, job.id, "paused", |j| j.state == JobState::Paused).await;

    let pid = paused.pid.unwrap();
    unsafe {
        assert_eq!(libc::killpg(pid, libc::SIGKILL), 0);
    }

    let job = wait_for(&store, job.id, "terminal", |j| j.state.is_terminal()).await;
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.exit_code, Some(128 + libc::SIGKILL));

    shutdown.send(true).unwrap();
    handle.await.unwrap();
}

/// Wraps a real store but fails every GPU-holder consistency read.
struct FlakyHolders {
    inner: Arc<LibSqlStore>,
}

#[async_trait]
impl JobStore for FlakyHolders {
    async fn enqueue(&self, spec: JobSpec) -> Result<Job> {
        self.inner.enqueue(spec).await
    }
    async fn get(&self, id: JobId) -> Result<Job> {
        self.inner.get(id).await
    }
    async fn list(&self) -> Result<Vec<Job>> {
        self.inner.list().await
    }
    async fn claim_next(&self, caps: &Capabilities, worker: Uuid) -> Result<Option<Job>> {
        self.inner.claim_next(caps, worker).await
    }
    async fn set_pid(&self, id: JobId, pid: Option<i32>) -> Result<()> {
        self.inner.set_pid(id, pid).await
    }
    async fn mark_paused(&self, id: JobId) -> Result<()> {
        self.inner.mark_paused(id).await
    }
    async fn mark_resumed(&self, id: JobId) -> Result<()> {
        self.inner.mark_resumed(id).await
    }
    async fn finish(&self, id: JobId, exit_code: i32) -> Result<()> {
        self.inner.finish(id, exit_code).await
    }
    async fn mark_failed(&self, id: JobId) -> Result<()> {
        self.inner.mark_failed(id).await
    }
    async fn mark_killed(&self, id: JobId) -> Result<()> {
        self.inner.mark_killed(id).await
    }
    async fn requeue(&self, id: JobId) -> Result<()> {
        self.inner.requeue(id).await
    }
    async fn request_control(&self, id: JobId, control: ControlRequest) -> Result<()> {
        self.inner.request_control(id, control).await
    }
    async fn take_control(&self, id: JobId) -> Result<Option<ControlRequest>> {
        self.inner.take_control(id).await
    }
    async fn owned(&self, worker: Uuid) -> Result<Vec<Job>> {
        self.inner.owned(worker).await
    }
    async fn live(&self) -> Result<Vec<Job>> {
        self.inner.live().await
    }
    async fn gpu_holders(&self, _gpu: u32) -> Result<Vec<JobId>> {
        Err(StoreError::Query("holders unavailable".into()).into())
    }
    async fn remove(&self, id: JobId, force: bool) -> Result<RemoveOutcome> {
        self.inner.remove(id, force).await
    }
    async fn delete_unchecked(&self, id: JobId) -> Result<Job> {
        self.inner.delete_unchecked(id).await
    }
}

/// The claim statement is atomic on its own; a failed post-claim
/// consistency read is logged, not fatal, and the job still runs.
#[tokio::test]
async fn claim_survives_a_failed_consistency_read() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let store = open_store(&config).await;

    let job = store.enqueue(JobSpec::new("echo ok").gpu(0)).await.unwrap();

    let flaky: Arc<dyn JobStore> = Arc::new(FlakyHolders {
        inner: store.clone(),
    });
    let controller = ProcessController::new(Arc::new(UnixSignals), config.kill_grace);
    let mut worker = Worker::new(flaky, controller, config, 1, None);
    let (shutdown, rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        worker.run(rx).await.unwrap();
    });

    let job = wait_for(&store, job.id, "terminal", |j| j.state.is_terminal()).await;
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(std::fs::read_to_string(&job.out_file).unwrap(), "ok\n");

    shutdown.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn spawn_failure_marks_the_job_failed() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let store = open_store(&config).await;

    let job = store
        .enqueue(JobSpec::new("echo never").cwd(dir.path().join("no/such/dir")))
        .await
        .unwrap();
    let ok = store.enqueue(JobSpec::new("echo fine")).await.unwrap();

    let (handle, shutdown) = spawn_worker(store.clone(), config, 1, None);

    let job = wait_for(&store, job.id, "terminal", |j| j.state.is_terminal()).await;
    assert_eq!(job.state, JobState::Failed);
    assert!(
        std::fs::read_to_string(&job.err_file)
            .unwrap()
            .contains("Failed to run job")
    );

    // The failure did not wedge the slot.
    let ok = wait_for(&store, ok.id, "terminal", |j| j.state.is_terminal()).await;
    assert_eq!(ok.state, JobState::Completed);

    shutdown.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn kill_shutdown_mode_kills_owned_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.shutdown_mode = ShutdownMode::Kill;
    let store = open_store(&config).await;

    let job = store.enqueue(JobSpec::new("sleep 100")).await.unwrap();

    let (handle, shutdown) = spawn_worker(store.clone(), config, 1, None);

    wait_for(&store, job.id, "running", |j| j.state == JobState::Running).await;

    shutdown.send(true).unwrap();
    handle.await.unwrap();

    let job = store.get(job.id).await.unwrap();
    assert_eq!(job.state, JobState::Killed);
}

#[tokio::test]
async fn wait_shutdown_mode_drains_owned_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let store = open_store(&config).await;

    let job = store
        .enqueue(JobSpec::new("sleep 0.3; echo done"))
        .await
        .unwrap();

    let (handle, shutdown) = spawn_worker(store.clone(), config, 1, None);

    wait_for(&store, job.id, "running", |j| j.state == JobState::Running).await;

    shutdown.send(true).unwrap();
    handle.await.unwrap();

    let job = store.get(job.id).await.unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(std::fs::read_to_string(&job.out_file).unwrap(), "done\n");
}
