//! Error types.
//!
//! - `StoreError`: what a `TaskStore` adapter can report.
//! - `ExecutionError`: what a task body can report.
//! - `SchedulerError`: what the public API returns.

use thiserror::Error;

use super::ids::TaskId;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task already exists: {0}")]
    DuplicateId(TaskId),

    /// Transient I/O failure; the caller may retry later.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A row could not be decoded.
    #[error("corrupt task row {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Failure reported by a task body (or a panic inside it).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error("task failed: {0}")]
    Failed(String),

    #[error("task panicked: {0}")]
    Panicked(String),
}

impl ExecutionError {
    pub fn failed(reason: impl Into<String>) -> Self {
        ExecutionError::Failed(reason.into())
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("task already exists: {0}")]
    DuplicateId(TaskId),

    #[error("task not found: {0}")]
    NotFound(TaskId),

    /// A transition's predicate did not match: someone else already acted.
    #[error("lease lost on task {0}")]
    LeaseLost(TaskId),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Stored data could not be decoded; retrying will not help.
    #[error("corrupt task row {id}: {reason}")]
    StoreCorrupt { id: String, reason: String },

    #[error(transparent)]
    TaskExecution(#[from] ExecutionError),

    #[error("dependency cycle: {}", format_cycle(.0))]
    DependencyCycle(Vec<TaskId>),

    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("coordinator is not running")]
    NotRunning,
}

impl From<StoreError> for SchedulerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateId(id) => SchedulerError::DuplicateId(id),
            StoreError::Unavailable(msg) => SchedulerError::StoreUnavailable(msg),
            StoreError::Corrupt { id, reason } => SchedulerError::StoreCorrupt { id, reason },
        }
    }
}

fn format_cycle(path: &[TaskId]) -> String {
    path.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
