//! TaskExecutor port - what actually runs a task body.
//!
//! The scheduler only cares whether the body succeeded. Adapters live in
//! `impls::executors`.

use async_trait::async_trait;

use crate::domain::{ExecutionError, Task};

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &Task) -> Result<(), ExecutionError>;
}
