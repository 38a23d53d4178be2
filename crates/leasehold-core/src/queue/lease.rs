//! Lease acquisition, renewal, and release for one worker.
//!
//! A lease is just two columns on the task row (`locked_by`, `locked_until`)
//! written through conditional updates. Whoever gets `affected == 1` owns it.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::transitions::Transitions;
use crate::domain::{StoreError, Task, TaskId, WorkerId};
use crate::ports::{Clock, TaskStore};

#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    worker_id: WorkerId,
    transitions: Transitions,
}

impl LeaseManager {
    pub fn new(
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        worker_id: WorkerId,
        transitions: Transitions,
    ) -> Self {
        Self {
            store,
            clock,
            worker_id,
            transitions,
        }
    }

    /// Try to take the lease on `task`, the snapshot the caller read.
    ///
    /// Succeeds only if the row is still at the snapshot's version and has no
    /// live lease held by another worker.
    pub async fn acquire(&self, task: &Task) -> Result<bool, StoreError> {
        let (expect, patch) = self.transitions.acquire(task, &self.worker_id, self.clock.now());
        let affected = self.store.conditional_update(&task.id, &expect, &patch).await?;
        Ok(affected == 1)
    }

    /// Push the expiry out by one TTL. False means the lease is gone.
    pub async fn renew(&self, task_id: &TaskId) -> Result<bool, StoreError> {
        let (expect, patch) = self.transitions.renew(&self.worker_id, self.clock.now());
        let affected = self.store.conditional_update(task_id, &expect, &patch).await?;
        Ok(affected == 1)
    }

    /// Drop the lease without touching status.
    pub async fn release(&self, task_id: &TaskId) -> Result<bool, StoreError> {
        let (expect, patch) = self.transitions.release(&self.worker_id);
        let affected = self.store.conditional_update(task_id, &expect, &patch).await?;
        Ok(affected == 1)
    }

    /// Drop every lease this worker holds. Used on shutdown.
    pub async fn release_all(&self) -> Result<u64, StoreError> {
        let (expect, patch) = self.transitions.release(&self.worker_id);
        self.store.update_matching(&expect, &patch).await
    }

    /// Renew the lease on `task_id` every `interval` until aborted or the
    /// lease is lost. The first renewal happens one interval from now.
    pub fn spawn_renewal(&self, task_id: TaskId, interval: Duration) -> JoinHandle<()> {
        let leases = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // interval の最初の tick は即時なので捨てる
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match leases.renew(&task_id).await {
                    Ok(true) => {
                        debug!(worker_id = %leases.worker_id, task_id = %task_id, "lease renewed");
                    }
                    Ok(false) => {
                        debug!(worker_id = %leases.worker_id, task_id = %task_id, "lease lost, stopping renewal");
                        break;
                    }
                    Err(e) => {
                        // 次の tick で再試行。TTL 内に回復すれば lease は保たれる
                        warn!(worker_id = %leases.worker_id, task_id = %task_id, error = %e, "lease renewal failed");
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NewTask;
    use crate::impls::InMemoryTaskStore;
    use crate::ports::ManualClock;
    use crate::queue::RetryPolicy;
    use chrono::{TimeZone, Utc};

    struct Fixture {
        store: Arc<InMemoryTaskStore>,
        clock: ManualClock,
    }

    impl Fixture {
        async fn new() -> Self {
            let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
            let store = Arc::new(InMemoryTaskStore::new());
            store
                .create(Task::from_submission(
                    NewTask::new("t1", Duration::ZERO),
                    3,
                    clock.now(),
                ))
                .await
                .unwrap();
            Self { store, clock }
        }

        fn manager(&self, worker: &str) -> LeaseManager {
            LeaseManager::new(
                self.store.clone(),
                Arc::new(self.clock.clone()),
                WorkerId::new(worker),
                Transitions::new(Duration::from_secs(30), RetryPolicy::immediate()),
            )
        }

        async fn task(&self) -> Task {
            self.store.get(&TaskId::new("t1")).await.unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn only_one_of_two_workers_acquires_same_snapshot() {
        let fx = Fixture::new().await;
        let snapshot = fx.task().await;

        let a = fx.manager("w-a");
        let b = fx.manager("w-b");
        let (got_a, got_b) = tokio::join!(a.acquire(&snapshot), b.acquire(&snapshot));

        assert!(got_a.unwrap() ^ got_b.unwrap());
    }

    #[tokio::test]
    async fn renew_extends_and_release_clears() {
        let fx = Fixture::new().await;
        let leases = fx.manager("w-a");
        assert!(leases.acquire(&fx.task().await).await.unwrap());
        let first_until = fx.task().await.locked_until.unwrap();

        fx.clock.advance(Duration::from_secs(10));
        assert!(leases.renew(&TaskId::new("t1")).await.unwrap());
        assert!(fx.task().await.locked_until.unwrap() > first_until);

        assert!(leases.release(&TaskId::new("t1")).await.unwrap());
        let task = fx.task().await;
        assert_eq!(task.locked_by, None);
        assert_eq!(task.locked_until, None);
    }

    #[tokio::test]
    async fn other_worker_cannot_renew_or_release() {
        let fx = Fixture::new().await;
        assert!(fx.manager("w-a").acquire(&fx.task().await).await.unwrap());

        let intruder = fx.manager("w-b");
        assert!(!intruder.renew(&TaskId::new("t1")).await.unwrap());
        assert!(!intruder.release(&TaskId::new("t1")).await.unwrap());
        assert!(fx.task().await.is_leased_by(&WorkerId::new("w-a")));
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over() {
        let fx = Fixture::new().await;
        assert!(fx.manager("w-a").acquire(&fx.task().await).await.unwrap());

        fx.clock.advance(Duration::from_secs(31));
        let b = fx.manager("w-b");
        assert!(b.acquire(&fx.task().await).await.unwrap());
        assert!(fx.task().await.is_leased_by(&WorkerId::new("w-b")));
    }

    #[tokio::test]
    async fn release_all_drops_only_own_leases() {
        let fx = Fixture::new().await;
        fx.store
            .create(Task::from_submission(
                NewTask::new("t2", Duration::ZERO),
                3,
                fx.clock.now(),
            ))
            .await
            .unwrap();
        let t2 = fx.store.get(&TaskId::new("t2")).await.unwrap().unwrap();

        let a = fx.manager("w-a");
        assert!(a.acquire(&fx.task().await).await.unwrap());
        assert!(fx.manager("w-b").acquire(&t2).await.unwrap());

        assert_eq!(a.release_all().await.unwrap(), 1);
        assert_eq!(fx.task().await.locked_by, None);
        let t2 = fx.store.get(&TaskId::new("t2")).await.unwrap().unwrap();
        assert!(t2.is_leased_by(&WorkerId::new("w-b")));
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_loop_keeps_lease_alive() {
        let fx = Fixture::new().await;
        let leases = fx.manager("w-a");
        assert!(leases.acquire(&fx.task().await).await.unwrap());
        let acquired_until = fx.task().await.locked_until.unwrap();

        let handle = leases.spawn_renewal(TaskId::new("t1"), Duration::from_secs(15));
        fx.clock.advance(Duration::from_secs(15));
        tokio::time::sleep(Duration::from_secs(16)).await;

        assert!(fx.task().await.locked_until.unwrap() > acquired_until);
        handle.abort();
    }
}
