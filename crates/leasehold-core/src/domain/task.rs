//! Task record and submission input.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{TaskId, WorkerId};
use super::state::TaskStatus;

/// A task as persisted in the store.
///
/// Design:
/// - The store row is the single source of truth; workers only hold snapshots.
/// - Every field changes through a conditional update (see `domain::update`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,

    /// Execution budget, used by the simulated executor.
    #[serde(with = "duration_ms")]
    pub duration: Duration,

    pub status: TaskStatus,

    /// Ids that must be `COMPLETED` before this task may run.
    pub dependencies: Vec<TaskId>,

    /// Number of transitions into `RUNNING` so far.
    pub attempts: u32,
    pub max_attempts: u32,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,

    /// Earliest time a retried task may be claimed again.
    pub run_after: Option<DateTime<Utc>>,

    pub last_error: Option<String>,

    pub locked_by: Option<WorkerId>,
    pub locked_until: Option<DateTime<Utc>>,

    pub version: u64,
}

impl Task {
    /// Build the initial record for a submission.
    pub fn from_submission(new_task: NewTask, default_max_attempts: u32, now: DateTime<Utc>) -> Self {
        let status = TaskStatus::initial(!new_task.dependencies.is_empty());
        Self {
            id: new_task.id,
            duration: new_task.duration,
            status,
            dependencies: new_task.dependencies,
            attempts: 0,
            max_attempts: new_task.max_attempts.unwrap_or(default_max_attempts),
            created_at: now,
            started_at: None,
            completed_at: None,
            failed_at: None,
            run_after: None,
            last_error: None,
            locked_by: None,
            locked_until: None,
            version: 0,
        }
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }

    pub fn is_leased_by(&self, worker: &WorkerId) -> bool {
        self.locked_by.as_ref() == Some(worker)
    }

    /// May the retry policy let this task run at `now`?
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.run_after.is_none_or(|at| at <= now)
    }
}

/// Submission input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub id: TaskId,

    #[serde(rename = "duration_ms", with = "duration_ms")]
    pub duration: Duration,

    #[serde(default)]
    pub dependencies: Vec<TaskId>,

    /// Overrides the configured default when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

impl NewTask {
    pub fn new(id: impl Into<TaskId>, duration: Duration) -> Self {
        Self {
            id: id.into(),
            duration,
            dependencies: Vec::new(),
            max_attempts: None,
        }
    }

    pub fn depends_on(mut self, dependency: impl Into<TaskId>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Collapse duplicate dependency ids, keeping first-seen order.
    pub fn normalized(mut self) -> Self {
        let mut seen = std::collections::HashSet::new();
        self.dependencies.retain(|dep| seen.insert(dep.clone()));
        self
    }
}

pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let ms = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(ms)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
