//! StaleLeaseReclaimer - 期限切れ lease の回収
//!
//! # フロー (sweep ごと)
//! 1. RUNNING かつ lease が切れている (または無い) → QUEUED
//!    (attempts を使い切っていれば FAILED)
//! 2. status に関係なく、期限切れの lease フィールドをクリア
//!
//! Runs on its own period, independent of the lease TTL.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::lifecycle::{LoopHandle, next_tick};
use crate::domain::StoreError;
use crate::ports::{Clock, TaskStore};
use crate::queue::Transitions;

/// What one sweep changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReclaimReport {
    /// `RUNNING -> QUEUED`
    pub requeued: u64,
    /// `RUNNING -> FAILED`, attempts exhausted
    pub failed: u64,
    /// Expired lease fields cleared on non-running rows.
    pub released: u64,
}

impl ReclaimReport {
    pub fn is_empty(&self) -> bool {
        self.requeued == 0 && self.failed == 0 && self.released == 0
    }
}

pub struct StaleLeaseReclaimer {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    run: Mutex<Option<LoopHandle>>,
}

impl StaleLeaseReclaimer {
    pub fn new(store: Arc<dyn TaskStore>, clock: Arc<dyn Clock>, interval: Duration) -> Self {
        Self {
            store,
            clock,
            interval,
            run: Mutex::new(None),
        }
    }

    /// One reclaim pass at the clock's current time.
    pub async fn sweep(&self) -> Result<ReclaimReport, StoreError> {
        sweep(self.store.as_ref(), self.clock.as_ref()).await
    }

    /// Start sweeping every `interval`. The first sweep runs immediately.
    pub async fn start(&self) {
        let mut run = self.run.lock().await;
        if run.is_some() {
            return;
        }
        let store = Arc::clone(&self.store);
        let clock = Arc::clone(&self.clock);
        let interval = self.interval;
        *run = Some(LoopHandle::spawn(move |mut shutdown_rx| async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            while next_tick(&mut ticker, &mut shutdown_rx).await {
                if let Err(e) = sweep(store.as_ref(), clock.as_ref()).await {
                    warn!(error = %e, "reclaim sweep failed");
                }
            }
        }));
    }

    pub async fn stop(&self) {
        let Some(handle) = self.run.lock().await.take() else {
            return;
        };
        if let Err(e) = handle.shutdown().await {
            warn!(error = %e, "reclaimer loop ended abnormally");
        }
    }
}

async fn sweep(store: &dyn TaskStore, clock: &dyn Clock) -> Result<ReclaimReport, StoreError> {
    let now = clock.now();

    let (expect, patch) = Transitions::reclaim(now);
    let requeued = store.update_matching(&expect, &patch).await?;

    let (expect, patch) = Transitions::reclaim_exhausted(now);
    let failed = store.update_matching(&expect, &patch).await?;

    let (expect, patch) = Transitions::release_expired(now);
    let released = store.update_matching(&expect, &patch).await?;

    let report = ReclaimReport {
        requeued,
        failed,
        released,
    };
    if report.is_empty() {
        debug!("reclaim sweep: nothing stale");
    } else {
        info!(requeued, failed, released, "reclaimed stale leases");
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Expect, NewTask, Patch, Task, TaskId, TaskStatus, WorkerId};
    use crate::impls::InMemoryTaskStore;
    use crate::ports::ManualClock;
    use chrono::{TimeDelta, TimeZone, Utc};

    struct Fixture {
        store: Arc<InMemoryTaskStore>,
        clock: ManualClock,
        reclaimer: StaleLeaseReclaimer,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryTaskStore::new());
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let reclaimer =
            StaleLeaseReclaimer::new(store.clone(), Arc::new(clock.clone()), Duration::from_secs(30));
        Fixture {
            store,
            clock,
            reclaimer,
        }
    }

    impl Fixture {
        /// Insert a task already RUNNING under `worker` with `attempts` used.
        async fn running(&self, id: &str, max_attempts: u32, attempts: u32, ttl_secs: i64) {
            let mut task = Task::from_submission(
                NewTask::new(id, Duration::ZERO).with_max_attempts(max_attempts),
                3,
                self.clock.now(),
            );
            task.status = TaskStatus::Running;
            task.attempts = attempts;
            task.started_at = Some(self.clock.now());
            task.locked_by = Some(WorkerId::new("w-dead"));
            task.locked_until = Some(self.clock.now() + TimeDelta::seconds(ttl_secs));
            self.store.create(task).await.unwrap();
        }

        async fn get(&self, id: &str) -> Task {
            self.store.get(&TaskId::new(id)).await.unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn live_leases_are_left_alone() {
        let fx = fixture();
        fx.running("a", 3, 1, 30).await;

        let report = fx.reclaimer.sweep().await.unwrap();
        assert!(report.is_empty());
        assert_eq!(fx.get("a").await.status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn expired_running_task_is_requeued() {
        let fx = fixture();
        fx.running("a", 3, 1, 30).await;
        fx.clock.advance(Duration::from_secs(31));

        let report = fx.reclaimer.sweep().await.unwrap();
        assert_eq!(
            report,
            ReclaimReport {
                requeued: 1,
                failed: 0,
                released: 0
            }
        );
        let a = fx.get("a").await;
        assert_eq!(a.status, TaskStatus::Queued);
        assert_eq!(a.locked_by, None);
        assert_eq!(a.attempts, 1);
    }

    #[tokio::test]
    async fn expired_task_without_attempts_left_fails() {
        let fx = fixture();
        fx.running("a", 2, 2, 30).await;
        fx.clock.advance(Duration::from_secs(31));

        let report = fx.reclaimer.sweep().await.unwrap();
        assert_eq!(report.failed, 1);
        let a = fx.get("a").await;
        assert_eq!(a.status, TaskStatus::Failed);
        assert!(a.failed_at.is_some());
        assert!(a.last_error.is_some());
    }

    #[tokio::test]
    async fn running_task_with_released_lease_is_requeued() {
        let fx = fixture();
        fx.running("a", 3, 1, 30).await;
        fx.store
            .conditional_update(&TaskId::new("a"), &Expect::any(), &Patch::new().clear_lease())
            .await
            .unwrap();

        assert_eq!(fx.reclaimer.sweep().await.unwrap().requeued, 1);
        assert_eq!(fx.get("a").await.status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn expired_lease_on_queued_task_is_cleared() {
        let fx = fixture();
        fx.store
            .create(Task::from_submission(NewTask::new("q", Duration::ZERO), 3, fx.clock.now()))
            .await
            .unwrap();
        fx.store
            .conditional_update(
                &TaskId::new("q"),
                &Expect::any(),
                &Patch::new().set_lease(WorkerId::new("w-dead"), fx.clock.now()),
            )
            .await
            .unwrap();
        fx.clock.advance(Duration::from_secs(1));

        let report = fx.reclaimer.sweep().await.unwrap();
        assert_eq!(report.released, 1);
        assert_eq!(fx.get("q").await.locked_by, None);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_sweeps_run_until_stopped() {
        let fx = fixture();
        fx.running("a", 3, 1, 30).await;
        fx.clock.advance(Duration::from_secs(31));

        fx.reclaimer.start().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        fx.reclaimer.stop().await;

        assert_eq!(fx.get("a").await.status, TaskStatus::Queued);
    }
}
