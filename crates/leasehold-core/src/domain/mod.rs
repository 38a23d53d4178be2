//! Domain model: ids, task record, status, conditional updates, errors, events.

pub mod errors;
pub mod events;
pub mod ids;
pub mod state;
pub mod task;
pub mod update;

pub use self::errors::{ExecutionError, SchedulerError, SchedulerResult, StoreError};
pub use self::events::WorkerEvent;
pub use self::ids::{TaskId, WorkerId};
pub use self::state::TaskStatus;
pub use self::task::{NewTask, Task};
pub use self::update::{AttemptsExpect, Expect, FieldChange, Lease, LeaseExpect, Patch};
