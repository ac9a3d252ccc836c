//! Worker pools keyed by task type.

use std::collections::{HashMap, HashSet};
use taskbroker_core::{Error, Result, TaskType, WorkerId};

/// Workers serving one task type plus the rotation cursor.
#[derive(Debug, Default)]
struct WorkerPool {
    workers: Vec<WorkerId>,
    cursor: usize,
}

impl WorkerPool {
    fn next(&mut self) -> Option<&WorkerId> {
        if self.workers.is_empty() {
            return None;
        }
        // Reduced on read so workers appended mid-rotation keep their turn.
        let idx = self.cursor % self.workers.len();
        self.cursor = idx + 1;
        self.workers.get(idx)
    }
}

/// All worker pools known to the broker.
///
/// Registration only appends: a worker stays in its pool until the broker
/// stops. Registering the same identity twice gives it two turns per rotation.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    pools: HashMap<TaskType, WorkerPool>,
    /// Every identity in first-registration order, with duplicates removed.
    identities: Vec<WorkerId>,
    seen: HashSet<WorkerId>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `worker` to the pool of `task_type`, creating the pool if
    /// needed.
    pub fn register(&mut self, task_type: TaskType, worker: WorkerId) {
        if self.seen.insert(worker.clone()) {
            self.identities.push(worker.clone());
        }
        self.pools.entry(task_type).or_default().workers.push(worker);
    }

    /// Picks the next worker for `task_type` by round-robin.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoCapacity`] if no worker is registered for the type.
    pub fn next_worker(&mut self, task_type: &TaskType) -> Result<WorkerId> {
        self.pools
            .get_mut(task_type)
            .and_then(WorkerPool::next)
            .cloned()
            .ok_or_else(|| Error::NoCapacity {
                task_type: task_type.to_string(),
            })
    }

    pub fn has_capacity(&self, task_type: &TaskType) -> bool {
        self.pool_len(task_type) > 0
    }

    pub fn pool_len(&self, task_type: &TaskType) -> usize {
        self.pools.get(task_type).map_or(0, |pool| pool.workers.len())
    }

    /// Distinct identities across all pools, in first-registration order.
    pub fn all_workers(&self) -> &[WorkerId] {
        &self.identities
    }
}
