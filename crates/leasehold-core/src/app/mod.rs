//! App - アプリケーション層
//!
//! ports と queue を組み合わせてスケジューラを動かします。
//!
//! # 主要コンポーネント
//! - **CoordinatorBuilder**: 構築とワイヤリング (起動時検証)
//! - **Coordinator**: worker 群 + reclaimer の起動・停止、submit / get / list / stats
//! - **Worker**: poll → lease → claim → execute → transition
//! - **StaleLeaseReclaimer**: 期限切れ lease の回収
//! - **status**: 統計スナップショット

pub mod builder;
pub mod coordinator;
mod lifecycle;
pub mod reaper_loop;
pub mod status;
pub mod worker_loop;

// 主要な型を再エクスポート
pub use self::builder::CoordinatorBuilder;
pub use self::coordinator::Coordinator;
pub use self::reaper_loop::{ReclaimReport, StaleLeaseReclaimer};
pub use self::status::{CoordinatorStats, WorkerStats};
pub use self::worker_loop::{Worker, WorkerContext};
