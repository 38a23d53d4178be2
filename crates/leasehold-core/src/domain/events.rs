//! Worker lifecycle events, delivered to an `EventSink`.

use serde::Serialize;

use super::ids::WorkerId;
use super::task::Task;

/// Something a worker observed.
///
/// Every variant carries the worker id; task variants carry the snapshot the
/// worker had when the event fired.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerEvent {
    TaskStarted {
        worker_id: WorkerId,
        task: Task,
    },
    TaskCompleted {
        worker_id: WorkerId,
        task: Task,
    },
    /// Terminal failure.
    TaskFailed {
        worker_id: WorkerId,
        task: Task,
        error: String,
    },
    /// Failed attempt that will be retried.
    TaskRetry {
        worker_id: WorkerId,
        task: Task,
        error: String,
    },
    WorkerError {
        worker_id: WorkerId,
        error: String,
    },
}

impl WorkerEvent {
    pub fn worker_id(&self) -> &WorkerId {
        match self {
            WorkerEvent::TaskStarted { worker_id, .. }
            | WorkerEvent::TaskCompleted { worker_id, .. }
            | WorkerEvent::TaskFailed { worker_id, .. }
            | WorkerEvent::TaskRetry { worker_id, .. }
            | WorkerEvent::WorkerError { worker_id, .. } => worker_id,
        }
    }

    pub fn task(&self) -> Option<&Task> {
        match self {
            WorkerEvent::TaskStarted { task, .. }
            | WorkerEvent::TaskCompleted { task, .. }
            | WorkerEvent::TaskFailed { task, .. }
            | WorkerEvent::TaskRetry { task, .. } => Some(task),
            WorkerEvent::WorkerError { .. } => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            WorkerEvent::TaskStarted { .. } => "task_started",
            WorkerEvent::TaskCompleted { .. } => "task_completed",
            WorkerEvent::TaskFailed { .. } => "task_failed",
            WorkerEvent::TaskRetry { .. } => "task_retry",
            WorkerEvent::WorkerError { .. } => "worker_error",
        }
    }
}
