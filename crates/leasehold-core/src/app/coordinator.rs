//! Coordinator - worker 群と reclaimer をまとめて起動・停止する
//!
//! Also the public entry point for submitting and inspecting tasks. Build one
//! with `CoordinatorBuilder`.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::reaper_loop::StaleLeaseReclaimer;
use super::status::CoordinatorStats;
use super::worker_loop::{Worker, WorkerContext};
use crate::config::SchedulerConfig;
use crate::domain::{NewTask, SchedulerError, SchedulerResult, Task, TaskId};
use crate::ports::ListOrder;
use crate::queue::DependencyResolver;

const CREATED: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED: u8 = 2;

pub struct Coordinator {
    ctx: WorkerContext,
    workers: Vec<Worker>,
    reclaimer: StaleLeaseReclaimer,
    resolver: DependencyResolver,
    state: AtomicU8,
}

impl Coordinator {
    pub(crate) fn new(ctx: WorkerContext, workers: Vec<Worker>) -> Self {
        let reclaimer = StaleLeaseReclaimer::new(
            Arc::clone(&ctx.store),
            Arc::clone(&ctx.clock),
            ctx.config.reclaim_interval(),
        );
        let resolver = DependencyResolver::new(Arc::clone(&ctx.store));
        Self {
            ctx,
            workers,
            reclaimer,
            resolver,
            state: AtomicU8::new(CREATED),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.ctx.config
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    pub fn reclaimer(&self) -> &StaleLeaseReclaimer {
        &self.reclaimer
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::SeqCst) == RUNNING
    }

    /// Start the reclaimer and every worker.
    ///
    /// Idempotent while running. A stopped coordinator cannot be restarted
    /// because its store has been closed.
    pub async fn start(&self) -> SchedulerResult<()> {
        match self
            .state
            .compare_exchange(CREATED, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => {}
            Err(RUNNING) => return Ok(()),
            Err(_) => return Err(SchedulerError::NotRunning),
        }
        self.reclaimer.start().await;
        for worker in &self.workers {
            worker.start().await;
        }
        info!(
            workers = self.workers.len(),
            capacity = self.ctx.config.total_capacity(),
            "coordinator started"
        );
        Ok(())
    }

    /// Stop every worker (releasing their leases), then the reclaimer, then
    /// close the store.
    ///
    /// Every worker is stopped even if one fails; the first error is
    /// returned.
    pub async fn stop(&self) -> SchedulerResult<()> {
        if self.state.swap(STOPPED, Ordering::SeqCst) == STOPPED {
            return Ok(());
        }
        let mut first_error = None;
        for worker in &self.workers {
            if let Err(e) = worker.stop().await {
                warn!(worker_id = %worker.id(), error = %e, "failed to stop worker cleanly");
                first_error.get_or_insert(e);
            }
        }
        self.reclaimer.stop().await;
        self.ctx.store.close().await;
        info!("coordinator stopped");
        first_error.map_or(Ok(()), Err)
    }

    fn ensure_open(&self) -> SchedulerResult<()> {
        if self.state.load(Ordering::SeqCst) == STOPPED {
            return Err(SchedulerError::NotRunning);
        }
        Ok(())
    }

    /// Validate and persist a new task.
    ///
    /// The task starts `PENDING` if it has dependencies, else `QUEUED`.
    /// Dependencies may name ids not submitted yet; such a task simply waits.
    pub async fn submit(&self, new_task: NewTask) -> SchedulerResult<Task> {
        self.ensure_open()?;
        let new_task = new_task.normalized();
        if new_task.id.is_empty() {
            return Err(SchedulerError::InvalidTask("task id must not be empty".to_string()));
        }
        if let Some(dep) = new_task.dependencies.iter().find(|dep| dep.is_empty()) {
            return Err(SchedulerError::InvalidTask(format!(
                "task {} has an empty dependency id {dep:?}",
                new_task.id
            )));
        }
        if new_task.max_attempts == Some(0) {
            return Err(SchedulerError::InvalidTask(format!(
                "task {} must allow at least one attempt",
                new_task.id
            )));
        }
        if let Some(cycle) = self
            .resolver
            .find_cycle(&new_task.id, &new_task.dependencies)
            .await?
        {
            return Err(SchedulerError::DependencyCycle(cycle));
        }

        let task = Task::from_submission(new_task, self.ctx.config.max_attempts, self.ctx.clock.now());
        let task = self.ctx.store.create(task).await?;
        debug!(task_id = %task.id, status = %task.status, deps = task.dependencies.len(), "task submitted");
        Ok(task)
    }

    /// Submit in order, stopping at the first error.
    pub async fn submit_all(
        &self,
        tasks: impl IntoIterator<Item = NewTask>,
    ) -> SchedulerResult<Vec<Task>> {
        let mut submitted = Vec::new();
        for new_task in tasks {
            submitted.push(self.submit(new_task).await?);
        }
        Ok(submitted)
    }

    pub async fn get(&self, id: &TaskId) -> SchedulerResult<Task> {
        self.ensure_open()?;
        self.ctx
            .store
            .get(id)
            .await?
            .ok_or_else(|| SchedulerError::NotFound(id.clone()))
    }

    pub async fn list(&self, order: ListOrder, limit: usize) -> SchedulerResult<Vec<Task>> {
        self.ensure_open()?;
        Ok(self.ctx.store.list(order, limit).await?)
    }

    pub async fn stats(&self) -> SchedulerResult<CoordinatorStats> {
        self.ensure_open()?;
        let tasks = self.ctx.store.counts_by_status().await?;
        let mut workers = Vec::with_capacity(self.workers.len());
        for worker in &self.workers {
            workers.push(worker.stats().await);
        }
        Ok(CoordinatorStats {
            total_workers: self.workers.len(),
            total_capacity: self.ctx.config.total_capacity(),
            in_flight: workers.iter().map(|w| w.in_flight).sum(),
            workers,
            tasks,
        })
    }

    /// Poll the store until every task is terminal or `timeout` elapses.
    /// Returns whether everything settled.
    ///
    /// A task whose dependency failed stays `PENDING` forever, so a graph
    /// with failures only settles if nothing depends on the failed tasks.
    pub async fn wait_until_settled(
        &self,
        check_every: Duration,
        timeout: Duration,
    ) -> SchedulerResult<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            self.ensure_open()?;
            let counts = self.ctx.store.counts_by_status().await?;
            if counts.terminal() == counts.total() {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(check_every).await;
        }
    }
}
