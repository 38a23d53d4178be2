//! Ports - the seams between the scheduling core and the outside world.
//!
//! - `TaskStore`: durable task rows with conditional updates
//! - `TaskExecutor`: runs a task body
//! - `EventSink`: receives worker events
//! - `Clock`: wall-clock time (lease expiry, timestamps)
//! - `IdGenerator`: worker ids

pub mod clock;
pub mod event_sink;
pub mod executor;
pub mod id_generator;
pub mod task_store;

pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::event_sink::EventSink;
pub use self::executor::TaskExecutor;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::task_store::{ListOrder, StatusCounts, TaskStore};
