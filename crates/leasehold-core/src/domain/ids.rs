//! Domain identifiers (strongly-typed string IDs).
//!
//! Task ids are supplied by the caller and worker ids are either configured or
//! generated, so both wrap a `String`. The phantom marker keeps `TaskId` and
//! `WorkerId` from being mixed up while sharing one implementation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;

/// Marker trait for each id kind.
pub trait IdMarker: Send + Sync + 'static {
    /// Human-readable kind, used in error messages.
    fn kind() -> &'static str;
}

/// Generic string id.
///
/// Serialized as the bare string.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    value: String,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            _marker: PhantomData,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn is_empty(&self) -> bool {
        self.value.trim().is_empty()
    }
}

impl<T: IdMarker> From<&str> for Id<T> {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl<T: IdMarker> From<String> for Id<T> {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

impl<T: IdMarker> fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:?})", T::kind(), self.value)
    }
}

// ========================================
// Markers
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl IdMarker for Task {
    fn kind() -> &'static str {
        "TaskId"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Worker {}

impl IdMarker for Worker {
    fn kind() -> &'static str {
        "WorkerId"
    }
}

/// Identifier of a task (caller-supplied, globally unique).
pub type TaskId = Id<Task>;

/// Identifier of a worker; the value stored in `locked_by`.
pub type WorkerId = Id<Worker>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_display_as_raw_value() {
        let task = TaskId::new("build-1");
        let worker = WorkerId::new("worker-0");

        assert_eq!(task.to_string(), "build-1");
        assert_eq!(worker.as_str(), "worker-0");
        assert_eq!(format!("{task:?}"), "TaskId(\"build-1\")");
    }

    #[test]
    fn ids_serialize_transparently() {
        let task = TaskId::new("a");
        let json = serde_json::to_string(&task).unwrap();
        assert_eq!(json, "\"a\"");

        let back: TaskId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, task);
    }

    #[test]
    fn blank_ids_are_empty() {
        assert!(TaskId::new("  ").is_empty());
        assert!(!TaskId::new("x").is_empty());
    }

    #[test]
    fn ids_are_ordered_by_value() {
        let mut ids = vec![TaskId::new("c"), TaskId::new("a"), TaskId::new("b")];
        ids.sort();
        let raw: Vec<&str> = ids.iter().map(|id| id.as_str()).collect();
        assert_eq!(raw, vec!["a", "b", "c"]);
    }
}
