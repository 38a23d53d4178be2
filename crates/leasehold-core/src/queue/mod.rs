//! Queue protocol: the task state machine, leases, dependency resolution,
//! and retry policy, all expressed over the `TaskStore` port.
//!
//! Nothing here holds task state; every decision is re-checked by the store
//! through a conditional update.

mod dependency;
mod lease;
mod retry;
mod transitions;

pub use dependency::{DependencyGraph, DependencyResolver};
pub use lease::LeaseManager;
pub use retry::RetryPolicy;
pub use transitions::{LEASE_EXPIRED_ERROR, Resolution, Transitions};
