//! The task state machine, expressed as conditional updates.
//!
//! Each transition is a pure function returning the `(Expect, Patch)` pair a
//! store must apply. The predicate encodes the transition's guard, so a
//! transition that lost a race simply affects zero rows.
//!
//! | transition      | from            | to        | guard                          |
//! |-----------------|-----------------|-----------|--------------------------------|
//! | promote         | PENDING         | QUEUED    | all deps completed (caller)    |
//! | claim           | QUEUED/PENDING  | RUNNING   | lease held, attempts remaining |
//! | succeed         | RUNNING         | COMPLETED | lease held                     |
//! | fail-retry      | RUNNING         | QUEUED    | lease held, attempts remaining |
//! | fail-terminal   | RUNNING         | FAILED    | lease held, attempts exhausted |
//! | reclaim         | RUNNING         | QUEUED    | lease stale, attempts remaining|
//! | reclaim-exhaust | RUNNING         | FAILED    | lease stale, attempts exhausted|

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::RetryPolicy;
use crate::domain::{AttemptsExpect, Expect, FieldChange, LeaseExpect, Patch, Task, TaskStatus, WorkerId};
use crate::ports::clock::deadline;

/// Message recorded on tasks failed by the reclaimer.
pub const LEASE_EXPIRED_ERROR: &str = "lease expired with attempts exhausted";

/// How a finished attempt resolves.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Completed,
    Retry { delay: Duration, error: String },
    Failed { error: String },
}

/// Builds transition updates for one worker configuration.
#[derive(Debug, Clone)]
pub struct Transitions {
    lease_ttl: Duration,
    retry_policy: RetryPolicy,
}

impl Transitions {
    pub fn new(lease_ttl: Duration, retry_policy: RetryPolicy) -> Self {
        Self {
            lease_ttl,
            retry_policy,
        }
    }

    /// Lease acquisition against the snapshot `task` was read from.
    pub fn acquire(&self, task: &Task, worker: &WorkerId, now: DateTime<Utc>) -> (Expect, Patch) {
        let expect = Expect::status_in(&[TaskStatus::Queued, TaskStatus::Pending])
            .lease(LeaseExpect::Available {
                worker: worker.clone(),
                now,
            })
            .version(task.version);
        let patch = Patch::new().set_lease(worker.clone(), deadline(now, self.lease_ttl));
        (expect, patch)
    }

    /// Extend the lease; only the current holder may.
    pub fn renew(&self, worker: &WorkerId, now: DateTime<Utc>) -> (Expect, Patch) {
        let expect = Expect::any().lease(LeaseExpect::HeldBy(worker.clone()));
        let patch = Patch::new().set_lease(worker.clone(), deadline(now, self.lease_ttl));
        (expect, patch)
    }

    /// Drop a lease without changing status (claim abandoned, shutdown).
    pub fn release(&self, worker: &WorkerId) -> (Expect, Patch) {
        let expect = Expect::any().lease(LeaseExpect::HeldBy(worker.clone()));
        (expect, Patch::new().clear_lease())
    }

    /// `QUEUED | PENDING -> RUNNING` under a lease already held by `worker`.
    pub fn claim(&self, worker: &WorkerId, now: DateTime<Utc>) -> (Expect, Patch) {
        let expect = moving(&[TaskStatus::Queued, TaskStatus::Pending], TaskStatus::Running)
            .lease(LeaseExpect::HeldBy(worker.clone()))
            .attempts(AttemptsExpect::Remaining);
        let patch = Patch {
            status: Some(TaskStatus::Running),
            increment_attempts: true,
            started_at_if_unset: Some(now),
            run_after: FieldChange::Clear,
            ..Patch::new()
        }
        .set_lease(worker.clone(), deadline(now, self.lease_ttl));
        (expect, patch)
    }

    /// Decide how an attempt of `task` (the post-claim snapshot) resolves.
    pub fn resolve(&self, task: &Task, result: Result<(), String>) -> Resolution {
        match result {
            Ok(()) => Resolution::Completed,
            Err(error) if task.has_attempts_left() => Resolution::Retry {
                delay: self.retry_policy.next_delay(task.attempts),
                error,
            },
            Err(error) => Resolution::Failed { error },
        }
    }

    /// `RUNNING -> COMPLETED | QUEUED | FAILED`, releasing the lease.
    ///
    /// A lease already cleared by this worker's shutdown still counts as held;
    /// a lease taken over by another worker, or a task already requeued, does not.
    pub fn finish(
        &self,
        resolution: &Resolution,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> (Expect, Patch) {
        let held = |to| {
            moving(&[TaskStatus::Running], to).lease(LeaseExpect::HeldByOrFree(worker.clone()))
        };
        match resolution {
            Resolution::Completed => {
                let patch = Patch {
                    status: Some(TaskStatus::Completed),
                    completed_at: Some(now),
                    ..Patch::new()
                }
                .clear_lease();
                (held(TaskStatus::Completed), patch)
            }
            Resolution::Retry { delay, error } => {
                let run_after = if delay.is_zero() {
                    FieldChange::Clear
                } else {
                    FieldChange::Set(deadline(now, *delay))
                };
                let patch = Patch {
                    status: Some(TaskStatus::Queued),
                    run_after,
                    last_error: FieldChange::Set(error.clone()),
                    ..Patch::new()
                }
                .clear_lease();
                (held(TaskStatus::Queued).attempts(AttemptsExpect::Remaining), patch)
            }
            Resolution::Failed { error } => {
                let patch = Patch {
                    status: Some(TaskStatus::Failed),
                    failed_at: Some(now),
                    last_error: FieldChange::Set(error.clone()),
                    ..Patch::new()
                }
                .clear_lease();
                (held(TaskStatus::Failed).attempts(AttemptsExpect::Exhausted), patch)
            }
        }
    }

    /// `PENDING -> QUEUED`.
    pub fn promote() -> (Expect, Patch) {
        (
            moving(&[TaskStatus::Pending], TaskStatus::Queued),
            Patch::new().status(TaskStatus::Queued),
        )
    }

    /// Crash recovery: `RUNNING` with no live lease and attempts left.
    pub fn reclaim(now: DateTime<Utc>) -> (Expect, Patch) {
        let expect = moving(&[TaskStatus::Running], TaskStatus::Queued)
            .lease(LeaseExpect::Stale { now })
            .attempts(AttemptsExpect::Remaining);
        (expect, Patch::new().status(TaskStatus::Queued).clear_lease())
    }

    /// Crash recovery for a task that already used its last attempt.
    pub fn reclaim_exhausted(now: DateTime<Utc>) -> (Expect, Patch) {
        let expect = moving(&[TaskStatus::Running], TaskStatus::Failed)
            .lease(LeaseExpect::Stale { now })
            .attempts(AttemptsExpect::Exhausted);
        let patch = Patch {
            status: Some(TaskStatus::Failed),
            failed_at: Some(now),
            last_error: FieldChange::Set(LEASE_EXPIRED_ERROR.to_string()),
            ..Patch::new()
        }
        .clear_lease();
        (expect, patch)
    }

    /// Clear expired lease fields in any status.
    pub fn release_expired(now: DateTime<Utc>) -> (Expect, Patch) {
        (
            Expect::any().lease(LeaseExpect::Expired { now }),
            Patch::new().clear_lease(),
        )
    }
}

/// Status guard for a `from -> to` move; every edge must be in the status table.
fn moving(from: &[TaskStatus], to: TaskStatus) -> Expect {
    debug_assert!(
        from.iter().all(|status| status.can_transition_to(to)),
        "illegal transition {from:?} -> {to}"
    );
    Expect::status_in(from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NewTask;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn transitions() -> Transitions {
        Transitions::new(Duration::from_secs(30), RetryPolicy::immediate())
    }

    fn queued(max_attempts: u32) -> Task {
        Task::from_submission(
            NewTask::new("t", Duration::ZERO).with_max_attempts(max_attempts),
            3,
            at(0),
        )
    }

    fn step(task: &mut Task, (expect, patch): (Expect, Patch)) -> bool {
        if expect.matches(task) {
            patch.apply(task);
            true
        } else {
            false
        }
    }

    fn acquire(t: &Transitions, task: &mut Task, worker: &WorkerId, now: DateTime<Utc>) -> bool {
        let snapshot = task.clone();
        step(task, t.acquire(&snapshot, worker, now))
    }

    #[test]
    fn full_lifecycle_to_completed() {
        let t = transitions();
        let w = WorkerId::new("w1");
        let mut task = queued(3);

        assert!(acquire(&t, &mut task, &w, at(1)));
        assert!(step(&mut task, t.claim(&w, at(1))));
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.attempts, 1);
        assert_eq!(task.started_at, Some(at(1)));

        let resolution = t.resolve(&task, Ok(()));
        assert!(step(&mut task, t.finish(&resolution, &w, at(2))));
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.completed_at, Some(at(2)));
        assert_eq!(task.locked_by, None);
    }

    #[test]
    fn acquire_fails_on_stale_version() {
        let t = transitions();
        let snapshot = queued(3);
        let mut task = snapshot.clone();
        Patch::new().apply(&mut task);

        assert!(!step(&mut task, t.acquire(&snapshot, &WorkerId::new("w1"), at(1))));
    }

    #[test]
    fn second_worker_cannot_acquire_live_lease() {
        let t = transitions();
        let mut task = queued(3);
        assert!(acquire(&t, &mut task, &WorkerId::new("w1"), at(1)));
        assert!(!acquire(&t, &mut task, &WorkerId::new("w2"), at(2)));
        // after expiry (ttl 30s) it is up for grabs
        assert!(acquire(&t, &mut task, &WorkerId::new("w2"), at(32)));
        assert!(task.is_leased_by(&WorkerId::new("w2")));
    }

    #[test]
    fn failure_retries_until_attempts_exhausted() {
        let t = transitions();
        let w = WorkerId::new("w1");
        let mut task = queued(2);

        for attempt in 1..=2 {
            assert!(acquire(&t, &mut task, &w, at(attempt)));
            assert!(step(&mut task, t.claim(&w, at(attempt))));
            let resolution = t.resolve(&task, Err("boom".into()));
            assert!(step(&mut task, t.finish(&resolution, &w, at(attempt))));
        }

        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempts, 2);
        assert_eq!(task.last_error.as_deref(), Some("boom"));

        // terminal: no more claims
        assert!(!acquire(&t, &mut task, &w, at(10)));
    }

    #[test]
    fn claim_refuses_exhausted_task() {
        let t = transitions();
        let w = WorkerId::new("w1");
        let mut task = queued(1);
        task.attempts = 1;
        assert!(acquire(&t, &mut task, &w, at(1)));
        assert!(!step(&mut task, t.claim(&w, at(1))));
    }

    #[test]
    fn finish_after_reclaim_is_lost() {
        let t = transitions();
        let w = WorkerId::new("w1");
        let mut task = queued(3);
        acquire(&t, &mut task, &w, at(0));
        step(&mut task, t.claim(&w, at(0)));

        assert!(step(&mut task, Transitions::reclaim(at(60))));
        assert_eq!(task.status, TaskStatus::Queued);

        let resolution = t.resolve(&task, Ok(()));
        assert!(!step(&mut task, t.finish(&resolution, &w, at(61))));
        assert_eq!(task.status, TaskStatus::Queued);
    }

    #[test]
    fn finish_applies_after_own_lease_was_released() {
        let t = transitions();
        let w = WorkerId::new("w1");
        let mut task = queued(1);
        acquire(&t, &mut task, &w, at(0));
        step(&mut task, t.claim(&w, at(0)));

        // shutdown で release_all 済み
        assert!(step(&mut task, t.release(&w)));
        assert_eq!(task.locked_by, None);

        let resolution = t.resolve(&task, Ok(()));
        assert!(step(&mut task, t.finish(&resolution, &w, at(5))));
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[test]
    fn finish_loses_to_another_holder() {
        let t = transitions();
        let w1 = WorkerId::new("w1");
        let mut task = queued(3);
        acquire(&t, &mut task, &w1, at(0));
        step(&mut task, t.claim(&w1, at(0)));
        task.locked_by = Some(WorkerId::new("w2"));

        let resolution = t.resolve(&task, Ok(()));
        assert!(!step(&mut task, t.finish(&resolution, &w1, at(5))));
        assert_eq!(task.status, TaskStatus::Running);
    }

    #[test]
    fn every_status_change_is_in_the_table() {
        let t = transitions();
        let w = WorkerId::new("w1");
        let mut updates = vec![
            Transitions::promote(),
            t.claim(&w, at(0)),
            Transitions::reclaim(at(0)),
            Transitions::reclaim_exhausted(at(0)),
        ];
        for resolution in [
            Resolution::Completed,
            Resolution::Retry { delay: Duration::ZERO, error: "e".into() },
            Resolution::Failed { error: "e".into() },
        ] {
            updates.push(t.finish(&resolution, &w, at(0)));
        }

        for (expect, patch) in updates {
            let to = patch.status.expect("status-changing transition");
            assert!(!expect.status_in.is_empty());
            for from in &expect.status_in {
                assert!(from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn reclaim_ignores_live_leases() {
        let t = transitions();
        let w = WorkerId::new("w1");
        let mut task = queued(3);
        acquire(&t, &mut task, &w, at(0));
        step(&mut task, t.claim(&w, at(0)));

        assert!(!step(&mut task, Transitions::reclaim(at(10))));
        assert_eq!(task.status, TaskStatus::Running);
    }

    #[test]
    fn reclaim_of_exhausted_task_fails_it() {
        let t = transitions();
        let w = WorkerId::new("w1");
        let mut task = queued(1);
        acquire(&t, &mut task, &w, at(0));
        step(&mut task, t.claim(&w, at(0)));

        assert!(!step(&mut task, Transitions::reclaim(at(60))));
        assert!(step(&mut task, Transitions::reclaim_exhausted(at(60))));
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.failed_at, Some(at(60)));
    }

    #[test]
    fn retry_with_backoff_sets_run_after() {
        let t = Transitions::new(
            Duration::from_secs(30),
            RetryPolicy::exponential(Duration::from_secs(5), 2.0, Duration::from_secs(60)),
        );
        let w = WorkerId::new("w1");
        let mut task = queued(3);
        acquire(&t, &mut task, &w, at(0));
        step(&mut task, t.claim(&w, at(0)));

        let resolution = t.resolve(&task, Err("flaky".into()));
        assert_eq!(
            resolution,
            Resolution::Retry {
                delay: Duration::from_secs(5),
                error: "flaky".into()
            }
        );
        step(&mut task, t.finish(&resolution, &w, at(1)));
        assert_eq!(task.run_after, Some(at(6)));
        assert!(!task.is_due(at(5)));
        assert!(task.is_due(at(6)));
    }
}
