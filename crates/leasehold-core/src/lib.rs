//! leasehold-core
//!
//! Distributed task scheduling over a shared store: independent workers
//! coordinate only through leases taken with conditional updates.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル (ids, state, task, update, errors, events)
//! - **ports**: 抽象化レイヤー (TaskStore, TaskExecutor, EventSink, Clock, IdGenerator)
//! - **queue**: 状態遷移・lease・依存解決・retry policy
//! - **app**: Coordinator / Worker / StaleLeaseReclaimer
//! - **impls**: ports の実装 (InMemoryTaskStore, SqliteTaskStore, executors, sinks)
//! - **config**: SchedulerConfig

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod queue;

pub use app::{Coordinator, CoordinatorBuilder, CoordinatorStats, WorkerStats};
pub use config::{RetryConfig, SchedulerConfig};
pub use domain::{NewTask, SchedulerError, SchedulerResult, Task, TaskId, TaskStatus, WorkerEvent, WorkerId};
