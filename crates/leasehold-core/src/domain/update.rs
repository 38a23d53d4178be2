//! Conditional update vocabulary: a predicate (`Expect`) and a change set
//! (`Patch`).
//!
//! Every mutation of a task row is expressed as `(Expect, Patch)`. A store
//! applies the patch only when the row currently matches the predicate, and
//! reports how many rows it changed. The in-memory store evaluates these
//! directly; the SQL store translates them to an `UPDATE ... WHERE`.

use chrono::{DateTime, Utc};

use super::ids::WorkerId;
use super::state::TaskStatus;
use super::task::Task;

/// Predicate on the lease columns.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LeaseExpect {
    /// No condition.
    #[default]
    Any,

    /// Free, expired at `now`, or already held by `worker`.
    Available { worker: WorkerId, now: DateTime<Utc> },

    /// Held by `worker` (expiry not checked).
    HeldBy(WorkerId),

    /// Held by `worker`, or free. 停止時の release_all 後に届いた結果を受け入れる
    HeldByOrFree(WorkerId),

    /// No live lease at `now`: holder absent, expiry absent, or expiry passed.
    Stale { now: DateTime<Utc> },

    /// Holder set and expiry passed at `now`.
    Expired { now: DateTime<Utc> },
}

impl LeaseExpect {
    pub fn matches(&self, task: &Task) -> bool {
        match self {
            LeaseExpect::Any => true,
            LeaseExpect::Available { worker, now } => match (&task.locked_by, task.locked_until) {
                (None, _) => true,
                (Some(holder), _) if holder == worker => true,
                (Some(_), Some(until)) => until < *now,
                (Some(_), None) => true,
            },
            LeaseExpect::HeldBy(worker) => task.locked_by.as_ref() == Some(worker),
            LeaseExpect::HeldByOrFree(worker) => {
                task.locked_by.as_ref().is_none_or(|holder| holder == worker)
            }
            LeaseExpect::Stale { now } => match (&task.locked_by, task.locked_until) {
                (Some(_), Some(until)) => until < *now,
                _ => true,
            },
            LeaseExpect::Expired { now } => match (&task.locked_by, task.locked_until) {
                (Some(_), Some(until)) => until < *now,
                _ => false,
            },
        }
    }
}

/// Predicate on attempts vs. max attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptsExpect {
    /// `attempts < max_attempts`
    Remaining,
    /// `attempts >= max_attempts`
    Exhausted,
}

/// Row predicate for a conditional update.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Expect {
    /// Empty means any status.
    pub status_in: Vec<TaskStatus>,
    pub lease: LeaseExpect,
    pub attempts: Option<AttemptsExpect>,
    /// Compare-on-write against a previously read version.
    pub version: Option<u64>,
}

impl Expect {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn status(status: TaskStatus) -> Self {
        Self {
            status_in: vec![status],
            ..Self::default()
        }
    }

    pub fn status_in(statuses: &[TaskStatus]) -> Self {
        Self {
            status_in: statuses.to_vec(),
            ..Self::default()
        }
    }

    pub fn lease(mut self, lease: LeaseExpect) -> Self {
        self.lease = lease;
        self
    }

    pub fn attempts(mut self, attempts: AttemptsExpect) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }

    pub fn matches(&self, task: &Task) -> bool {
        if !self.status_in.is_empty() && !self.status_in.contains(&task.status) {
            return false;
        }
        if !self.lease.matches(task) {
            return false;
        }
        match self.attempts {
            Some(AttemptsExpect::Remaining) if task.attempts >= task.max_attempts => return false,
            Some(AttemptsExpect::Exhausted) if task.attempts < task.max_attempts => return false,
            _ => {}
        }
        self.version.is_none_or(|v| v == task.version)
    }
}

/// Change to an optional column.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FieldChange<T> {
    #[default]
    Keep,
    Set(T),
    Clear,
}

impl<T: Clone> FieldChange<T> {
    fn apply(&self, field: &mut Option<T>) {
        match self {
            FieldChange::Keep => {}
            FieldChange::Set(value) => *field = Some(value.clone()),
            FieldChange::Clear => *field = None,
        }
    }
}

/// Lease columns, always written together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub holder: WorkerId,
    pub expires_at: DateTime<Utc>,
}

/// Change set for a conditional update. `version` is always bumped.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Patch {
    pub status: Option<TaskStatus>,
    pub increment_attempts: bool,
    /// Written only if `started_at` is still unset.
    pub started_at_if_unset: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub run_after: FieldChange<DateTime<Utc>>,
    pub last_error: FieldChange<String>,
    pub lease: FieldChange<Lease>,
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn set_lease(mut self, holder: WorkerId, expires_at: DateTime<Utc>) -> Self {
        self.lease = FieldChange::Set(Lease { holder, expires_at });
        self
    }

    pub fn clear_lease(mut self) -> Self {
        self.lease = FieldChange::Clear;
        self
    }

    pub fn apply(&self, task: &mut Task) {
        if let Some(status) = self.status {
            task.status = status;
        }
        if self.increment_attempts {
            task.attempts += 1;
        }
        if task.started_at.is_none() {
            task.started_at = self.started_at_if_unset;
        }
        if let Some(at) = self.completed_at {
            task.completed_at = Some(at);
        }
        if let Some(at) = self.failed_at {
            task.failed_at = Some(at);
        }
        self.run_after.apply(&mut task.run_after);
        self.last_error.apply(&mut task.last_error);
        match &self.lease {
            FieldChange::Keep => {}
            FieldChange::Set(lease) => {
                task.locked_by = Some(lease.holder.clone());
                task.locked_until = Some(lease.expires_at);
            }
            FieldChange::Clear => {
                task.locked_by = None;
                task.locked_until = None;
            }
        }
        task.version += 1;
    }
}
