//! Worker session — one invocation's local slots and owned children.

use uuid::Uuid;

use crate::alloc::Capabilities;
use crate::job::JobId;
use crate::process::RunningChild;

/// Ephemeral, in-memory state of one running worker invocation. Never
/// persisted: cross-process truth lives in the store, and a session only
/// tracks the children it spawned itself.
pub struct WorkerSession {
    pub id: Uuid,
    pub parallelism: usize,
    pub gpu_filter: Option<Vec<u32>>,
    children: Vec<RunningChild>,
}

impl WorkerSession {
    pub fn new(parallelism: usize, gpu_filter: Option<Vec<u32>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            parallelism: parallelism.max(1),
            gpu_filter,
            children: Vec::new(),
        }
    }

    pub fn free_slots(&self) -> usize {
        self.parallelism.saturating_sub(self.children.len())
    }

    pub fn is_idle(&self) -> bool {
        self.children.is_empty()
    }

    /// Claim capabilities for the current slot occupancy.
    pub fn capabilities(&self) -> Capabilities {
        Capabilities::new(self.free_slots() > 0, self.gpu_filter.clone())
    }

    /// Occupy a slot with a spawned child.
    pub fn add(&mut self, child: RunningChild) {
        debug_assert!(self.free_slots() > 0);
        self.children.push(child);
    }

    /// Release the slot for a job, returning its child.
    pub fn take(&mut self, id: JobId) -> Option<RunningChild> {
        let idx = self.children.iter().position(|c| c.job.id == id)?;
        Some(self.children.swap_remove(idx))
    }

    pub fn owned_ids(&self) -> Vec<JobId> {
        self.children.iter().map(|c| c.job.id).collect()
    }

    pub fn children_mut(&mut self) -> &mut [RunningChild] {
        &mut self.children
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parallelism_is_at_least_one() {
        let session = WorkerSession::new(0, None);
        assert_eq!(session.parallelism, 1);
        assert_eq!(session.free_slots(), 1);
    }

    #[test]
    fn capabilities_reflect_occupancy() {
        let session = WorkerSession::new(2, Some(vec![1]));
        let caps = session.capabilities();
        assert!(caps.free_slot);
        assert_eq!(caps.gpu_filter, Some(vec![1]));
    }
}
