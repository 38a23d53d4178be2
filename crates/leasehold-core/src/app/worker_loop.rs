//! Worker - タスク実行ループ
//!
//! # フロー (poll ごと)
//! 1. 空きスロット数 = max_concurrent - in_flight
//! 2. `query_ready` で候補を多めに取得 (空き * over_fetch_factor)
//! 3. 依存チェック → lease 取得 → claim (RUNNING)
//! 4. 実行を spawn、lease の renewal timer を起動
//! 5. 完了時に succeed / fail-retry / fail-terminal を適用し、後片付け
//!
//! Losing a race (lease taken, transition predicate no longer matching) is
//! normal and only traced. Store errors while polling are reported to the
//! `EventSink` and the cycle is skipped; nothing but `stop` ends the loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, trace, warn};

use super::lifecycle::{LoopHandle, next_tick};
use super::status::WorkerStats;
use crate::config::SchedulerConfig;
use crate::domain::{
    ExecutionError, SchedulerError, SchedulerResult, StoreError, Task, TaskId, WorkerEvent,
    WorkerId,
};
use crate::ports::{Clock, EventSink, TaskExecutor, TaskStore};
use crate::queue::{DependencyResolver, LeaseManager, Resolution, Transitions};

/// Collaborators shared by every worker of a coordinator.
#[derive(Clone)]
pub struct WorkerContext {
    pub store: Arc<dyn TaskStore>,
    pub executor: Arc<dyn TaskExecutor>,
    pub sink: Arc<dyn EventSink>,
    pub clock: Arc<dyn Clock>,
    pub config: SchedulerConfig,
}

/// Local bookkeeping for one execution.
struct InFlight {
    renewal: JoinHandle<()>,
}

#[derive(Default)]
struct Counters {
    claimed: AtomicU64,
    completed: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
}

struct WorkerInner {
    id: WorkerId,
    ctx: WorkerContext,
    leases: LeaseManager,
    resolver: DependencyResolver,
    transitions: Transitions,
    in_flight: DashMap<TaskId, InFlight>,
    counters: Counters,
}

/// One polling worker.
///
/// Owns its in-flight map; workers share nothing but the store.
pub struct Worker {
    inner: Arc<WorkerInner>,
    run: Mutex<Option<LoopHandle>>,
}

impl Worker {
    pub fn new(id: WorkerId, ctx: WorkerContext) -> Self {
        let transitions = Transitions::new(ctx.config.lease_ttl(), ctx.config.retry_policy());
        let leases = LeaseManager::new(
            Arc::clone(&ctx.store),
            Arc::clone(&ctx.clock),
            id.clone(),
            transitions.clone(),
        );
        let resolver = DependencyResolver::new(Arc::clone(&ctx.store));
        Self {
            inner: Arc::new(WorkerInner {
                id,
                ctx,
                leases,
                resolver,
                transitions,
                in_flight: DashMap::new(),
                counters: Counters::default(),
            }),
            run: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.inner.id
    }

    pub async fn is_running(&self) -> bool {
        self.run.lock().await.is_some()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.len()
    }

    /// Start the poll loop. Starting a running worker is a no-op.
    pub async fn start(&self) {
        let mut run = self.run.lock().await;
        if run.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *run = Some(LoopHandle::spawn(move |shutdown_rx| inner.run(shutdown_rx)));
    }

    /// Stop polling, cancel renewal timers, and release every lease this
    /// worker holds, including executions started through `poll_once`.
    ///
    /// In-flight executions keep running. Their final transition still
    /// applies unless another worker has reclaimed the task in the meantime.
    pub async fn stop(&self) -> SchedulerResult<()> {
        let handle = self.run.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.shutdown().await {
                warn!(worker_id = %self.inner.id, error = %e, "poll loop ended abnormally");
            }
        }
        for entry in self.inner.in_flight.iter() {
            entry.value().renewal.abort();
        }
        let released = self.inner.leases.release_all().await?;
        info!(worker_id = %self.inner.id, released, "worker stopped");
        Ok(())
    }

    /// Run one poll cycle now. Returns how many tasks were claimed.
    pub async fn poll_once(&self) -> usize {
        self.inner.poll_once().await
    }

    pub async fn stats(&self) -> WorkerStats {
        let running = self.is_running().await;
        let inner = &self.inner;
        let mut in_flight_tasks: Vec<TaskId> =
            inner.in_flight.iter().map(|entry| entry.key().clone()).collect();
        in_flight_tasks.sort();
        WorkerStats {
            worker_id: inner.id.clone(),
            running,
            max_concurrent: inner.ctx.config.max_concurrent,
            in_flight: in_flight_tasks.len(),
            in_flight_tasks,
            claimed: inner.counters.claimed.load(Ordering::Relaxed),
            completed: inner.counters.completed.load(Ordering::Relaxed),
            retried: inner.counters.retried.load(Ordering::Relaxed),
            failed: inner.counters.failed.load(Ordering::Relaxed),
        }
    }
}

impl WorkerInner {
    async fn run(self: Arc<Self>, mut shutdown_rx: tokio::sync::watch::Receiver<bool>) {
        info!(
            worker_id = %self.id,
            max_concurrent = self.ctx.config.max_concurrent,
            poll_interval_ms = self.ctx.config.poll_interval_ms,
            "worker started"
        );
        let mut ticker = tokio::time::interval(self.ctx.config.poll_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        while next_tick(&mut ticker, &mut shutdown_rx).await {
            self.poll_once().await;
        }
    }

    async fn poll_once(self: &Arc<Self>) -> usize {
        let available = self
            .ctx
            .config
            .max_concurrent
            .saturating_sub(self.in_flight.len());
        if available == 0 {
            trace!(worker_id = %self.id, "no free slots");
            return 0;
        }

        let now = self.ctx.clock.now();
        let limit = available.saturating_mul(self.ctx.config.over_fetch_factor);
        let candidates = match self.ctx.store.query_ready(&self.id, now, limit).await {
            Ok(candidates) => candidates,
            Err(e) => {
                self.report_error(&e);
                return 0;
            }
        };

        let mut claimed = 0;
        for candidate in candidates {
            if claimed >= available {
                break;
            }
            // 直前に retry で QUEUED に戻ったばかりで、まだ後片付け中のもの
            if self.in_flight.contains_key(&candidate.id) {
                continue;
            }
            match self.try_claim(&candidate).await {
                Ok(Some(task)) => {
                    self.spawn_execution(task);
                    claimed += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    self.report_error(&e);
                    break;
                }
            }
        }
        claimed
    }

    /// Readiness check, lease, claim. `None` means someone else won or the
    /// task is not runnable yet.
    async fn try_claim(&self, candidate: &Task) -> Result<Option<Task>, StoreError> {
        if !self.resolver.is_ready(candidate).await? {
            trace!(worker_id = %self.id, task_id = %candidate.id, "dependencies not satisfied");
            return Ok(None);
        }
        if !self.leases.acquire(candidate).await? {
            trace!(worker_id = %self.id, task_id = %candidate.id, "lost lease race");
            return Ok(None);
        }

        let (expect, patch) = self.transitions.claim(&self.id, self.ctx.clock.now());
        if self
            .ctx
            .store
            .conditional_update(&candidate.id, &expect, &patch)
            .await?
            == 0
        {
            trace!(worker_id = %self.id, task_id = %candidate.id, "claim rejected, giving lease back");
            self.leases.release(&candidate.id).await?;
            return Ok(None);
        }

        // 再読込はしない: ここで失敗すると RUNNING のまま実行されない
        let mut task = candidate.clone();
        patch.apply(&mut task);
        self.counters.claimed.fetch_add(1, Ordering::Relaxed);
        debug!(worker_id = %self.id, task_id = %task.id, attempt = task.attempts, "claimed");
        Ok(Some(task))
    }

    fn spawn_execution(self: &Arc<Self>, task: Task) {
        let renewal = self
            .leases
            .spawn_renewal(task.id.clone(), self.ctx.config.renew_interval());
        self.in_flight.insert(task.id.clone(), InFlight { renewal });
        self.ctx.sink.emit(WorkerEvent::TaskStarted {
            worker_id: self.id.clone(),
            task: task.clone(),
        });

        let worker = Arc::clone(self);
        tokio::spawn(async move {
            let result = worker.execute(&task).await;
            worker.finish(&task, result).await;
            if let Some((_, in_flight)) = worker.in_flight.remove(&task.id) {
                in_flight.renewal.abort();
            }
        });
    }

    /// Run the body in its own task so a panic is caught as a `JoinError`.
    async fn execute(&self, task: &Task) -> Result<(), ExecutionError> {
        let executor = Arc::clone(&self.ctx.executor);
        let snapshot = task.clone();
        match tokio::spawn(async move { executor.execute(&snapshot).await }).await {
            Ok(result) => result,
            Err(e) => Err(ExecutionError::Panicked(panic_message(e))),
        }
    }

    async fn finish(&self, task: &Task, result: Result<(), ExecutionError>) {
        let resolution = self
            .transitions
            .resolve(task, result.map_err(|e| SchedulerError::from(e).to_string()));
        match self.apply_resolution(task, &resolution).await {
            Ok(snapshot) => self.record(snapshot, resolution).await,
            Err(SchedulerError::LeaseLost(id)) => {
                trace!(worker_id = %self.id, task_id = %id, "lease lost before finishing, result dropped");
            }
            Err(e) => self.report_error(&e),
        }
    }

    async fn apply_resolution(&self, task: &Task, resolution: &Resolution) -> SchedulerResult<Task> {
        let (expect, patch) = self
            .transitions
            .finish(resolution, &self.id, self.ctx.clock.now());
        if self
            .ctx
            .store
            .conditional_update(&task.id, &expect, &patch)
            .await?
            == 0
        {
            return Err(SchedulerError::LeaseLost(task.id.clone()));
        }
        let mut snapshot = task.clone();
        patch.apply(&mut snapshot);
        Ok(snapshot)
    }

    async fn record(&self, task: Task, resolution: Resolution) {
        let worker_id = self.id.clone();
        match resolution {
            Resolution::Completed => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                debug!(worker_id = %worker_id, task_id = %task.id, "completed");
                self.ctx.sink.emit(WorkerEvent::TaskCompleted { worker_id, task });
                match self.resolver.promote_ready().await {
                    Ok(promoted) if !promoted.is_empty() => {
                        debug!(worker_id = %self.id, promoted = promoted.len(), "promoted dependents");
                    }
                    Ok(_) => {}
                    Err(e) => self.report_error(&e),
                }
            }
            Resolution::Retry { delay, error } => {
                self.counters.retried.fetch_add(1, Ordering::Relaxed);
                debug!(
                    worker_id = %worker_id,
                    task_id = %task.id,
                    attempt = task.attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "requeued for retry"
                );
                self.ctx.sink.emit(WorkerEvent::TaskRetry { worker_id, task, error });
            }
            Resolution::Failed { error } => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                debug!(worker_id = %worker_id, task_id = %task.id, attempts = task.attempts, "failed permanently");
                self.ctx.sink.emit(WorkerEvent::TaskFailed { worker_id, task, error });
            }
        }
    }

    fn report_error(&self, error: &dyn std::fmt::Display) {
        warn!(worker_id = %self.id, error = %error, "store error, skipping cycle");
        self.ctx.sink.emit(WorkerEvent::WorkerError {
            worker_id: self.id.clone(),
            error: error.to_string(),
        });
    }
}

fn panic_message(err: JoinError) -> String {
    if err.is_cancelled() {
        return "execution cancelled".to_string();
    }
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
