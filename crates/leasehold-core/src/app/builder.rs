//! CoordinatorBuilder - Coordinator の構築とワイヤリング
//!
//! # Fail-fast 設計
//! - `build()` 時に設定を検証し、不正なら `InvalidConfig` を返す
//! - worker id を明示した場合は数と重複もチェック

use std::collections::HashSet;
use std::sync::Arc;

use super::coordinator::Coordinator;
use super::worker_loop::{Worker, WorkerContext};
use crate::config::SchedulerConfig;
use crate::domain::{SchedulerError, SchedulerResult, WorkerId};
use crate::impls::{NoopSink, SimulatedExecutor};
use crate::ports::{Clock, EventSink, IdGenerator, SystemClock, TaskExecutor, TaskStore, UlidGenerator};

/// Builds a `Coordinator`.
///
/// # 使用例
/// ```ignore
/// let coordinator = CoordinatorBuilder::new(Arc::new(InMemoryTaskStore::new()))
///     .executor(SimulatedExecutor)
///     .sink(TracingSink)
///     .config(config)
///     .build()?;
/// ```
///
/// Defaults: `SimulatedExecutor`, `NoopSink`, `SystemClock`, generated
/// worker ids, `SchedulerConfig::default()`.
pub struct CoordinatorBuilder {
    store: Arc<dyn TaskStore>,
    executor: Arc<dyn TaskExecutor>,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    worker_ids: Option<Vec<WorkerId>>,
}

impl CoordinatorBuilder {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            executor: Arc::new(SimulatedExecutor),
            sink: Arc::new(NoopSink),
            clock: Arc::new(SystemClock),
            config: SchedulerConfig::default(),
            worker_ids: None,
        }
    }

    pub fn executor(mut self, executor: impl TaskExecutor + 'static) -> Self {
        self.executor = Arc::new(executor);
        self
    }

    pub fn shared_executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn sink(mut self, sink: impl EventSink + 'static) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Fixed worker ids instead of generated ones; must match
    /// `config.worker_count`.
    pub fn worker_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<WorkerId>,
    {
        self.worker_ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn build(self) -> SchedulerResult<Coordinator> {
        self.config.validate()?;

        let ids = match self.worker_ids {
            Some(ids) => {
                if ids.len() != self.config.worker_count {
                    return Err(SchedulerError::InvalidConfig(format!(
                        "{} worker ids given for worker_count {}",
                        ids.len(),
                        self.config.worker_count
                    )));
                }
                let mut seen = HashSet::new();
                if let Some(dup) = ids.iter().find(|id| !seen.insert(*id)) {
                    return Err(SchedulerError::InvalidConfig(format!(
                        "duplicate worker id {dup}"
                    )));
                }
                if ids.iter().any(WorkerId::is_empty) {
                    return Err(SchedulerError::InvalidConfig(
                        "worker id must not be empty".to_string(),
                    ));
                }
                ids
            }
            None => {
                let id_gen = UlidGenerator::new(Arc::clone(&self.clock));
                (0..self.config.worker_count)
                    .map(|_| id_gen.generate_worker_id())
                    .collect()
            }
        };

        let ctx = WorkerContext {
            store: self.store,
            executor: self.executor,
            sink: self.sink,
            clock: self.clock,
            config: self.config,
        };
        let workers = ids
            .into_iter()
            .map(|id| Worker::new(id, ctx.clone()))
            .collect();
        Ok(Coordinator::new(ctx, workers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::InMemoryTaskStore;

    fn builder() -> CoordinatorBuilder {
        CoordinatorBuilder::new(Arc::new(InMemoryTaskStore::new()))
    }

    #[test]
    fn test_build_with_defaults() {
        let coordinator = builder().build().unwrap();
        assert_eq!(coordinator.workers().len(), 2);
        assert_ne!(coordinator.workers()[0].id(), coordinator.workers()[1].id());
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let result = builder()
            .config(SchedulerConfig {
                lease_ttl_ms: 0,
                ..SchedulerConfig::default()
            })
            .build();
        assert!(matches!(result, Err(SchedulerError::InvalidConfig(_))));
    }

    #[test]
    fn test_build_with_explicit_worker_ids() {
        let coordinator = builder().worker_ids(["w1", "w2"]).build().unwrap();
        let ids: Vec<&str> = coordinator.workers().iter().map(|w| w.id().as_str()).collect();
        assert_eq!(ids, vec!["w1", "w2"]);
    }

    #[test]
    fn test_build_rejects_bad_worker_ids() {
        assert!(matches!(
            builder().worker_ids(["w1"]).build(),
            Err(SchedulerError::InvalidConfig(_))
        ));
        assert!(matches!(
            builder().worker_ids(["w1", "w1"]).build(),
            Err(SchedulerError::InvalidConfig(msg)) if msg.contains("duplicate")
        ));
    }
}
