//! In-memory `TaskStore`.
//!
//! One `tokio::sync::Mutex` guards every row, so each conditional update is
//! trivially atomic. Suitable for tests and single-process runs.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{Expect, LeaseExpect, Patch, StoreError, Task, TaskId, TaskStatus, WorkerId};
use crate::ports::{ListOrder, StatusCounts, TaskStore};

struct Row {
    /// Insertion order, breaks `created_at` ties.
    seq: u64,
    task: Task,
}

#[derive(Default)]
struct State {
    rows: HashMap<TaskId, Row>,
    next_seq: u64,
    closed: bool,
}

impl State {
    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed {
            return Err(StoreError::Unavailable("store is closed".to_string()));
        }
        Ok(())
    }

    fn sorted(&self, mut keep: impl FnMut(&Task) -> bool) -> Vec<&Row> {
        let mut rows: Vec<&Row> = self.rows.values().filter(|row| keep(&row.task)).collect();
        rows.sort_by_key(|row| (row.task.created_at, row.seq));
        rows
    }
}

#[derive(Default)]
pub struct InMemoryTaskStore {
    state: Mutex<State>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create(&self, task: Task) -> Result<Task, StoreError> {
        let mut state = self.state.lock().await;
        state.check_open()?;
        if state.rows.contains_key(&task.id) {
            return Err(StoreError::DuplicateId(task.id));
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.rows.insert(
            task.id.clone(),
            Row {
                seq,
                task: task.clone(),
            },
        );
        Ok(task)
    }

    async fn get(&self, id: &TaskId) -> Result<Option<Task>, StoreError> {
        let state = self.state.lock().await;
        state.check_open()?;
        Ok(state.rows.get(id).map(|row| row.task.clone()))
    }

    async fn list(&self, order: ListOrder, limit: usize) -> Result<Vec<Task>, StoreError> {
        let state = self.state.lock().await;
        state.check_open()?;
        let mut rows = state.sorted(|_| true);
        if order == ListOrder::CreatedDesc {
            rows.reverse();
        }
        Ok(rows.into_iter().take(limit).map(|row| row.task.clone()).collect())
    }

    async fn list_by_status(
        &self,
        status: TaskStatus,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError> {
        let state = self.state.lock().await;
        state.check_open()?;
        Ok(state
            .sorted(|task| task.status == status)
            .into_iter()
            .take(limit)
            .map(|row| row.task.clone())
            .collect())
    }

    async fn conditional_update(
        &self,
        id: &TaskId,
        expect: &Expect,
        patch: &Patch,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        state.check_open()?;
        match state.rows.get_mut(id) {
            Some(row) if expect.matches(&row.task) => {
                patch.apply(&mut row.task);
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn update_matching(&self, expect: &Expect, patch: &Patch) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        state.check_open()?;
        let mut affected = 0;
        for row in state.rows.values_mut() {
            if expect.matches(&row.task) {
                patch.apply(&mut row.task);
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn query_ready(
        &self,
        worker: &WorkerId,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError> {
        let state = self.state.lock().await;
        state.check_open()?;
        let lease = LeaseExpect::Available {
            worker: worker.clone(),
            now,
        };
        let mut rows: Vec<&Row> = state
            .rows
            .values()
            .filter(|row| row.task.status.is_claimable())
            .filter(|row| lease.matches(&row.task) && row.task.is_due(now))
            .collect();
        rows.sort_by_key(|row| (row.task.status.priority(), row.task.created_at, row.seq));
        Ok(rows.into_iter().take(limit).map(|row| row.task.clone()).collect())
    }

    async fn counts_by_status(&self) -> Result<StatusCounts, StoreError> {
        let state = self.state.lock().await;
        state.check_open()?;
        let mut counts = StatusCounts::default();
        for row in state.rows.values() {
            counts.add(row.task.status, 1);
        }
        Ok(counts)
    }

    async fn close(&self) {
        self.state.lock().await.closed = true;
    }
}
