//! Status - 統計情報のスナップショット

use serde::Serialize;

use crate::domain::{TaskId, WorkerId};
use crate::ports::StatusCounts;

/// Point-in-time view of one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub worker_id: WorkerId,
    pub running: bool,
    pub max_concurrent: usize,
    pub in_flight: usize,
    pub in_flight_tasks: Vec<TaskId>,
    /// Lifetime counters since the worker was created.
    pub claimed: u64,
    pub completed: u64,
    pub retried: u64,
    pub failed: u64,
}

/// Aggregate view over every worker plus the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoordinatorStats {
    pub total_workers: usize,
    /// `worker_count * max_concurrent`
    pub total_capacity: usize,
    pub in_flight: usize,
    pub workers: Vec<WorkerStats>,
    pub tasks: StatusCounts,
}

impl CoordinatorStats {
    /// Every stored task is `COMPLETED` or `FAILED`.
    pub fn is_settled(&self) -> bool {
        self.tasks.terminal() == self.tasks.total()
    }
}
