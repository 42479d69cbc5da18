//! Resource allocation — GPU exclusivity and generic worker slots.
//!
//! GPU occupancy is not tracked separately from the queue: a GPU index is
//! reserved exactly while a non-terminal job holds it, so reservation and
//! release are the same atomic store write as the claim or the terminal
//! transition. This module builds the eligibility predicate that
//! `claim_next` evaluates inside that atomic statement, and the post-claim
//! consistency check for the invariant.

use tracing::error;

use crate::error::{Error, Result};
use crate::job::Job;
use crate::store::JobStore;

/// Subquery matching GPU indices currently held by a live job.
const BUSY_GPUS: &str =
    "SELECT gpu FROM jobs WHERE gpu IS NOT NULL AND state IN ('running', 'paused')";

/// What the calling worker can take on right now.
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    /// Worker has a free generic slot (required to claim anything).
    pub free_slot: bool,
    /// Restrict GPU jobs to these indices; `None` means any GPU.
    pub gpu_filter: Option<Vec<u32>>,
}

impl Capabilities {
    pub fn new(free_slot: bool, gpu_filter: Option<Vec<u32>>) -> Self {
        Self {
            free_slot,
            gpu_filter,
        }
    }

    /// SQL predicate selecting jobs this worker may claim.
    ///
    /// GPU indices are integers formatted inline; everything else is
    /// static SQL, so the fragment is safe to splice into the claim
    /// statement.
    pub fn eligibility_sql(&self) -> String {
        let gpu_clause = match &self.gpu_filter {
            None => format!("(gpu IS NOT NULL AND gpu NOT IN ({BUSY_GPUS}))"),
            Some(allowed) if allowed.is_empty() => "0".to_string(),
            Some(allowed) => {
                let list = allowed
                    .iter()
                    .map(|g| g.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("(gpu IN ({list}) AND gpu NOT IN ({BUSY_GPUS}))")
            }
        };
        // A GPU-restricted worker still claims CPU jobs.
        format!("(gpu IS NULL OR {gpu_clause})")
    }
}

/// Post-claim invariant check: the claimed job's GPU must have exactly one
/// live holder. A violation is an internal consistency fault; the caller
/// releases the claim and retries from scratch.
pub async fn verify_exclusive(store: &dyn JobStore, job: &Job) -> Result<()> {
    let Some(gpu) = job.gpu else {
        return Ok(());
    };
    let holders = store.gpu_holders(gpu).await?;
    if holders.len() > 1 {
        error!(job = job.id, gpu, ?holders, "GPU reserved more than once");
        return Err(Error::ResourceConflict { gpu, holders });
    }
    Ok(())
}
