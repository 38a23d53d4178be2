//! EventSink port - observer for worker events.
//!
//! Injected at construction. Implementations must not block: they are called
//! from the worker's own tasks.

use crate::domain::WorkerEvent;

pub trait EventSink: Send + Sync {
    fn emit(&self, event: WorkerEvent);
}
