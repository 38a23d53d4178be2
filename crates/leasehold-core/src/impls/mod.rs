//! Impls - ports の実装
//!
//! - **InMemoryTaskStore**: テスト・単一プロセス用の正本
//! - **SqliteTaskStore**: プロセス間で共有できる正本 (sqlx)
//! - **executors**: SimulatedExecutor / FnExecutor / FlakyExecutor
//! - **sinks**: NoopSink / TracingSink / ChannelSink

pub mod executors;
pub mod memory_store;
pub mod sinks;
pub mod sqlite_store;

pub use self::executors::{FlakyExecutor, FnExecutor, SimulatedExecutor};
pub use self::memory_store::InMemoryTaskStore;
pub use self::sinks::{ChannelSink, NoopSink, TracingSink};
pub use self::sqlite_store::SqliteTaskStore;
