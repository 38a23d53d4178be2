//! Task status and the allowed transitions between statuses.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Task status.
///
/// State transitions:
/// - Pending -> Queued (all dependencies completed)
/// - Queued -> Running (claimed under a lease)
/// - Pending -> Running (claimed while ready but not yet promoted)
/// - Running -> Completed
/// - Running -> Queued (retry, or reclaimed after lease expiry)
/// - Running -> Failed (attempts exhausted)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Waiting on dependencies.
    Pending,

    /// Eligible to be claimed.
    Queued,

    /// Leased and executing.
    Running,

    /// Terminal success.
    Completed,

    /// Terminal failure (attempts exhausted).
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Queued,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    /// Initial status for a freshly submitted task.
    pub fn initial(has_dependencies: bool) -> Self {
        if has_dependencies {
            TaskStatus::Pending
        } else {
            TaskStatus::Queued
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Can a worker try to lease a task in this status?
    pub fn is_claimable(self) -> bool {
        matches!(self, TaskStatus::Queued | TaskStatus::Pending)
    }

    /// Candidate ordering: lower sorts first.
    pub fn priority(self) -> u8 {
        match self {
            TaskStatus::Queued => 1,
            TaskStatus::Pending => 2,
            _ => 3,
        }
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Queued)
                | (Pending, Running)
                | (Queued, Running)
                | (Running, Completed)
                | (Running, Queued)
                | (Running, Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Queued => "QUEUED",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown task status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for TaskStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}
