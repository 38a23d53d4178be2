//! TaskStore port - the persistent source of truth for task rows.
//!
//! # Design
//! - Every mutation is a conditional update `(Expect, Patch)`, atomic per row.
//!   The affected-row count is the only mutual-exclusion primitive the
//!   scheduler relies on; there is no lock table.
//! - Reads return snapshots. A snapshot may be stale by the time it is used,
//!   which is why writes re-check their predicate.
//! - Adapters: `InMemoryTaskStore` (single process, tests) and
//!   `SqliteTaskStore` (shared between processes).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Expect, Patch, StoreError, Task, TaskId, TaskStatus, WorkerId};

/// Ordering for `list`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListOrder {
    /// Oldest first.
    CreatedAsc,
    /// Newest first.
    #[default]
    CreatedDesc,
}

/// Task counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn add(&mut self, status: TaskStatus, n: usize) {
        match status {
            TaskStatus::Pending => self.pending += n,
            TaskStatus::Queued => self.queued += n,
            TaskStatus::Running => self.running += n,
            TaskStatus::Completed => self.completed += n,
            TaskStatus::Failed => self.failed += n,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.queued + self.running + self.completed + self.failed
    }

    pub fn terminal(&self) -> usize {
        self.completed + self.failed
    }
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new row. Fails with `DuplicateId` if the id exists.
    async fn create(&self, task: Task) -> Result<Task, StoreError>;

    async fn get(&self, id: &TaskId) -> Result<Option<Task>, StoreError>;

    async fn list(&self, order: ListOrder, limit: usize) -> Result<Vec<Task>, StoreError>;

    /// Rows in `status`, oldest first.
    async fn list_by_status(
        &self,
        status: TaskStatus,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError>;

    /// Apply `patch` to row `id` iff it matches `expect`. Returns 0 or 1.
    async fn conditional_update(
        &self,
        id: &TaskId,
        expect: &Expect,
        patch: &Patch,
    ) -> Result<u64, StoreError>;

    /// Apply `patch` to every row matching `expect`. Each row is updated
    /// atomically; the statement as a whole need not be.
    async fn update_matching(&self, expect: &Expect, patch: &Patch) -> Result<u64, StoreError>;

    /// Claim candidates: `QUEUED` or `PENDING`, due at `now`, and with no live
    /// lease held by anyone but `worker`. Ordered by status priority
    /// (`QUEUED` first) then `created_at`.
    async fn query_ready(
        &self,
        worker: &WorkerId,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError>;

    async fn counts_by_status(&self) -> Result<StatusCounts, StoreError>;

    /// Release the underlying handle. Later calls may fail with `Unavailable`.
    async fn close(&self) {}
}
