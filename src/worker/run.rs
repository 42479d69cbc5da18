//! The worker loop.
//!
//! One cooperative polling loop supervises up to N child processes. Each
//! iteration reaps exited children, applies control requests relayed
//! through the store, and claims eligible jobs into free slots. All
//! cross-process coordination goes through the store's atomic operations;
//! no lock is ever held across a child's lifetime.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::{Config, ShutdownMode};
use crate::error::{Error, Result};
use crate::job::{ControlRequest, JobId};
use crate::process::{ProcessController, RunningChild};
use crate::store::JobStore;
use crate::worker::session::WorkerSession;

/// A running worker invocation.
pub struct Worker {
    store: Arc<dyn JobStore>,
    controller: ProcessController,
    config: Config,
    session: WorkerSession,
}

impl Worker {
    pub fn new(
        store: Arc<dyn JobStore>,
        controller: ProcessController,
        config: Config,
        parallelism: usize,
        gpu_filter: Option<Vec<u32>>,
    ) -> Self {
        Self {
            store,
            controller,
            config,
            session: WorkerSession::new(parallelism, gpu_filter),
        }
    }

    pub fn session_id(&self) -> uuid::Uuid {
        self.session.id
    }

    /// Run until `shutdown` flips to true, then drain per the configured
    /// [`ShutdownMode`].
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            worker = %self.session.id,
            parallelism = self.session.parallelism,
            gpu_filter = ?self.session.gpu_filter,
            "Worker starting"
        );
        self.log_stale_claims().await;

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.reap_exited().await;
            self.apply_controls().await;

            let claimed = match self.claim_into_free_slots().await {
                Ok(claimed) => claimed,
                Err(Error::Store(e)) => {
                    // Never fatal: skip this scheduling attempt, retry
                    // next iteration.
                    warn!(error = %e, "Store error during claim, retrying next iteration");
                    false
                }
                Err(e) => return Err(e),
            };

            // Busy slots need timely reaping; an idle worker backs off so
            // it does not busy-poll the shared store.
            let interval = if self.session.is_idle() && !claimed {
                self.config.poll_interval
            } else {
                self.config.reap_interval
            };
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {}
            }
        }

        self.drain().await;
        info!(worker = %self.session.id, "Worker stopped");
        Ok(())
    }

    /// Jobs left RUNNING/PAUSED by a previous (crashed) worker stay in
    /// the store, inspectable via `status`. Surface them at startup.
    async fn log_stale_claims(&self) {
        match self.store.live().await {
            Ok(jobs) => {
                for job in jobs {
                    warn!(
                        job = job.id,
                        worker = ?job.worker,
                        pid = ?job.pid,
                        state = %job.state,
                        "Job claimed by another worker session (possibly crashed); \
                         use `remove -f` to clear it"
                    );
                }
            }
            Err(e) => warn!(error = %e, "Could not inspect live jobs at startup"),
        }
    }

    /// Check every owned child for exit; write back terminal state and
    /// free the slot. The GPU reservation ends with the same store write.
    async fn reap_exited(&mut self) {
        let mut exited = Vec::new();
        for child in self.session.children_mut() {
            match child.try_reap() {
                Ok(Some(code)) => exited.push((child.job.id, code)),
                Ok(None) => {}
                Err(e) => {
                    error!(job = child.job.id, error = %e, "Failed to check child status");
                }
            }
        }

        for (id, code) in exited {
            // Closes our file handles.
            drop(self.session.take(id));
            match self.store.finish(id, code).await {
                Ok(()) => info!(job = id, exit_code = code, "Job finished"),
                Err(e) => warn!(job = id, error = %e, "Failed to record job exit"),
            }
        }
    }

    /// Apply pending pause/resume/kill requests on owned jobs.
    async fn apply_controls(&mut self) {
        for id in self.session.owned_ids() {
            let control = match self.store.take_control(id).await {
                Ok(Some(control)) => control,
                Ok(None) => continue,
                Err(e) => {
                    warn!(job = id, error = %e, "Failed to read control flag");
                    continue;
                }
            };
            self.apply_control(id, control).await;
        }
    }

    async fn apply_control(&mut self, id: JobId, control: ControlRequest) {
        let Some(mut child) = self.session.take(id) else {
            return;
        };

        match control {
            ControlRequest::Pause => {
                match self.controller.pause(&mut child) {
                    Ok(()) => {
                        if let Err(e) = self.store.mark_paused(id).await {
                            warn!(job = id, error = %e, "Failed to record pause");
                        } else {
                            info!(job = id, pid = child.pid, "Job paused");
                        }
                    }
                    Err(e) => warn!(job = id, error = %e, "Pause failed"),
                }
                self.session.add(child);
            }
            ControlRequest::Resume => {
                match self.controller.resume(&mut child) {
                    Ok(()) => {
                        if let Err(e) = self.store.mark_resumed(id).await {
                            warn!(job = id, error = %e, "Failed to record resume");
                        } else {
                            info!(job = id, pid = child.pid, "Job resumed");
                        }
                    }
                    Err(e) => warn!(job = id, error = %e, "Resume failed"),
                }
                self.session.add(child);
            }
            ControlRequest::Kill => {
                self.kill_child(&mut child).await;
                // Slot freed; child dropped here.
            }
        }
    }

    /// Kill a child and record KILLED. If signaling fails because the
    /// process is already gone, reap it so the record is still closed.
    async fn kill_child(&mut self, child: &mut RunningChild) {
        let id = child.job.id;
        match self.controller.kill(child).await {
            Ok(code) => info!(job = id, exit_code = code, "Job killed"),
            Err(e) => {
                warn!(job = id, error = %e, "Kill signal failed, reaping");
                let _ = child.wait().await;
            }
        }
        if let Err(e) = self.store.mark_killed(id).await {
            warn!(job = id, error = %e, "Failed to record kill");
        }
    }

    /// Claim eligible jobs into every free local slot. Returns whether
    /// anything was claimed.
    async fn claim_into_free_slots(&mut self) -> Result<bool> {
        let mut claimed = false;
        while self.session.free_slots() > 0 {
            let caps = self.session.capabilities();
            let Some(job) = self.store.claim_next(&caps, self.session.id).await? else {
                break;
            };

            // Invariant check: the claimed GPU must now have exactly one
            // live holder. A violation is an internal consistency fault;
            // release the claim and retry from scratch next iteration.
            match crate::alloc::verify_exclusive(self.store.as_ref(), &job).await {
                Ok(()) => {}
                Err(Error::ResourceConflict { gpu, holders }) => {
                    error!(job = job.id, gpu, ?holders, "Releasing conflicting claim");
                    if let Err(e) = self.store.requeue(job.id).await {
                        warn!(job = job.id, error = %e, "Failed to release claim");
                    }
                    break;
                }
                Err(e) => {
                    // The claim itself was one atomic statement; a failed
                    // consistency read does not invalidate it.
                    warn!(job = job.id, error = %e, "Could not verify claim, proceeding");
                }
            }

            let id = job.id;
            match self.controller.spawn(job) {
                Ok(child) => {
                    if let Err(e) = self.store.set_pid(id, Some(child.pid)).await {
                        warn!(job = id, error = %e, "Failed to record pid");
                    }
                    info!(job = id, pid = child.pid, "Job started");
                    self.session.add(child);
                    claimed = true;
                }
                Err(e) => {
                    // Isolated failure: only this job fails, the slot is
                    // not held.
                    error!(job = id, error = %e, "Spawn failed");
                    if let Err(e) = self.store.mark_failed(id).await {
                        warn!(job = id, error = %e, "Failed to record spawn failure");
                    }
                }
            }
        }
        Ok(claimed)
    }

    /// Shutdown: stop claiming, then wait for or kill owned jobs.
    async fn drain(&mut self) {
        if self.session.is_idle() {
            return;
        }

        match self.config.shutdown_mode {
            ShutdownMode::Kill => {
                info!(
                    jobs = self.session.owned_ids().len(),
                    "Shutdown: killing owned jobs"
                );
                for id in self.session.owned_ids() {
                    if let Some(mut child) = self.session.take(id) {
                        self.kill_child(&mut child).await;
                    }
                }
            }
            ShutdownMode::Wait => {
                info!(
                    jobs = self.session.owned_ids().len(),
                    "Shutdown: waiting for owned jobs"
                );
                while !self.session.is_idle() {
                    self.reap_exited().await;
                    // Kill requests still apply while draining.
                    self.apply_controls().await;
                    tokio::time::sleep(self.config.reap_interval).await;
                }
            }
        }
    }
}
