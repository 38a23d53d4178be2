//! `TaskExecutor` adapters.
//!
//! - `SimulatedExecutor`: sleeps for the task's duration, then succeeds
//! - `FnExecutor`: wraps an async closure (tests, embedding)
//! - `FlakyExecutor`: wraps another executor and fails at random

use std::future::Future;

use async_trait::async_trait;

use crate::domain::{ExecutionError, Task};
use crate::ports::TaskExecutor;

#[derive(Debug, Clone, Copy, Default)]
pub struct SimulatedExecutor;

#[async_trait]
impl TaskExecutor for SimulatedExecutor {
    async fn execute(&self, task: &Task) -> Result<(), ExecutionError> {
        tokio::time::sleep(task.duration).await;
        Ok(())
    }
}

/// Executor backed by a closure returning a future.
///
/// The closure receives an owned snapshot so the future can be `'static`.
pub struct FnExecutor<F> {
    f: F,
}

impl<F, Fut> FnExecutor<F>
where
    F: Fn(Task) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ExecutionError>> + Send,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> TaskExecutor for FnExecutor<F>
where
    F: Fn(Task) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ExecutionError>> + Send,
{
    async fn execute(&self, task: &Task) -> Result<(), ExecutionError> {
        (self.f)(task.clone()).await
    }
}

/// Runs `inner`, then reports failure with probability `fail_rate`.
///
/// Test harness only; the scheduler itself never injects failures.
pub struct FlakyExecutor<E> {
    inner: E,
    fail_rate: f64,
}

impl<E: TaskExecutor> FlakyExecutor<E> {
    /// `fail_rate` is clamped to `[0, 1]`.
    pub fn new(inner: E, fail_rate: f64) -> Self {
        let fail_rate = if fail_rate.is_nan() { 0.0 } else { fail_rate.clamp(0.0, 1.0) };
        Self { inner, fail_rate }
    }

    pub fn fail_rate(&self) -> f64 {
        self.fail_rate
    }
}

#[async_trait]
impl<E: TaskExecutor> TaskExecutor for FlakyExecutor<E> {
    async fn execute(&self, task: &Task) -> Result<(), ExecutionError> {
        self.inner.execute(task).await?;
        if rand::random::<f64>() < self.fail_rate {
            return Err(ExecutionError::failed(format!(
                "simulated failure on attempt {}",
                task.attempts
            )));
        }
        Ok(())
    }
}
