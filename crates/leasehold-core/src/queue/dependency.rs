//! Dependency readiness, promotion, and submission-time cycle detection.
//!
//! Readiness is always evaluated against the store, never a cached graph:
//! other workers complete tasks concurrently. The `DependencyGraph` below is
//! only built transiently to validate a submission.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use super::Transitions;
use crate::domain::{StoreError, Task, TaskId, TaskStatus};
use crate::ports::TaskStore;

/// Decides whether a task's dependencies are satisfied, and promotes
/// `PENDING` tasks whose dependencies all completed.
#[derive(Clone)]
pub struct DependencyResolver {
    store: Arc<dyn TaskStore>,
}

impl DependencyResolver {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    /// True iff every dependency resolves to a `COMPLETED` task.
    ///
    /// A dependency id with no row is unsatisfied, not an error.
    pub async fn is_ready(&self, task: &Task) -> Result<bool, StoreError> {
        for dep_id in &task.dependencies {
            match self.store.get(dep_id).await? {
                Some(dep) if dep.status == TaskStatus::Completed => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    /// Move every fully satisfied `PENDING` task to `QUEUED`.
    ///
    /// Each promotion is conditioned on the row still being `PENDING`, so a
    /// repeated scan (duplicate completion notice, two workers finishing at
    /// once) changes nothing the second time. Returns the promoted ids.
    ///
    /// Cost is O(pending * dependencies) store reads per call.
    pub async fn promote_ready(&self) -> Result<Vec<TaskId>, StoreError> {
        let pending = self.store.list_by_status(TaskStatus::Pending, usize::MAX).await?;
        let mut promoted = Vec::new();
        for task in pending {
            if !self.is_ready(&task).await? {
                continue;
            }
            let (expect, patch) = Transitions::promote();
            let affected = self.store.conditional_update(&task.id, &expect, &patch).await?;
            if affected == 1 {
                debug!(task_id = %task.id, "dependencies satisfied, promoted to QUEUED");
                promoted.push(task.id);
            }
        }
        Ok(promoted)
    }

    /// Would inserting `id` with `dependencies` close a cycle through rows
    /// already in the store? Returns the cycle path if so.
    pub async fn find_cycle(
        &self,
        id: &TaskId,
        dependencies: &[TaskId],
    ) -> Result<Option<Vec<TaskId>>, StoreError> {
        let mut graph = DependencyGraph::new();
        for dep in dependencies {
            graph.add_dependency(id.clone(), dep.clone());
        }

        let mut frontier: Vec<TaskId> = dependencies.to_vec();
        let mut loaded: HashSet<TaskId> = HashSet::from([id.clone()]);
        while let Some(next) = frontier.pop() {
            if !loaded.insert(next.clone()) {
                continue;
            }
            let Some(task) = self.store.get(&next).await? else {
                continue;
            };
            for dep in task.dependencies {
                graph.add_dependency(next.clone(), dep.clone());
                frontier.push(dep);
            }
        }

        Ok(graph.detect_cycle())
    }
}

/// Dependency graph for cycle detection (`edges`: task -> tasks it depends on).
#[derive(Debug, Default)]
pub struct DependencyGraph {
    edges: HashMap<TaskId, Vec<TaskId>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    /// On the current DFS path.
    Gray,
    /// Fully explored.
    Black,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// `task` depends on `depends_on`.
    pub fn add_dependency(&mut self, task: TaskId, depends_on: TaskId) {
        let deps = self.edges.entry(task.clone()).or_default();
        if !deps.contains(&depends_on) {
            deps.push(depends_on);
        }
    }

    pub fn dependencies(&self, task: &TaskId) -> &[TaskId] {
        self.edges.get(task).map(Vec::as_slice).unwrap_or(&[])
    }

    /// First cycle found, as a path that starts and ends on the same id.
    ///
    /// Iterative three-color DFS, O(V + E). Start nodes are visited in sorted
    /// order so the reported cycle is deterministic.
    pub fn detect_cycle(&self) -> Option<Vec<TaskId>> {
        let mut colors: HashMap<&TaskId, Color> = HashMap::new();
        let mut starts: Vec<&TaskId> = self.edges.keys().collect();
        starts.sort();

        for start in starts {
            if colors.contains_key(start) {
                continue;
            }
            // (node, index of next dependency to explore)
            let mut stack: Vec<(&TaskId, usize)> = vec![(start, 0)];
            colors.insert(start, Color::Gray);

            while let Some((node, next_idx)) = stack.pop() {
                let deps = self.dependencies(node);
                if next_idx >= deps.len() {
                    colors.insert(node, Color::Black);
                    continue;
                }
                stack.push((node, next_idx + 1));

                let dep = &deps[next_idx];
                match colors.get(dep) {
                    Some(Color::Gray) => {
                        let from = stack.iter().position(|(n, _)| *n == dep).unwrap_or(0);
                        let mut cycle: Vec<TaskId> =
                            stack[from..].iter().map(|(n, _)| (*n).clone()).collect();
                        cycle.push(dep.clone());
                        return Some(cycle);
                    }
                    Some(Color::Black) => {}
                    None => {
                        colors.insert(dep, Color::Gray);
                        stack.push((dep, 0));
                    }
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::domain::{Expect, NewTask, Patch};
    use crate::impls::InMemoryTaskStore;
    use chrono::Utc;

    fn id(s: &str) -> TaskId {
        TaskId::new(s)
    }

    async fn seed(store: &InMemoryTaskStore, new_task: NewTask) -> Task {
        store
            .create(Task::from_submission(new_task, 3, Utc::now()))
            .await
            .unwrap()
    }

    async fn set_status(store: &InMemoryTaskStore, task: &str, status: TaskStatus) {
        store
            .conditional_update(&id(task), &Expect::any(), &Patch::new().status(status))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn task_without_dependencies_is_ready() {
        let store = Arc::new(InMemoryTaskStore::new());
        let resolver = DependencyResolver::new(store.clone());
        let a = seed(&store, NewTask::new("a", Duration::ZERO)).await;
        assert!(resolver.is_ready(&a).await.unwrap());
    }

    #[tokio::test]
    async fn missing_dependency_is_never_ready() {
        let store = Arc::new(InMemoryTaskStore::new());
        let resolver = DependencyResolver::new(store.clone());
        let b = seed(&store, NewTask::new("b", Duration::ZERO).depends_on("ghost")).await;
        assert!(!resolver.is_ready(&b).await.unwrap());
    }

    #[tokio::test]
    async fn ready_only_when_every_dependency_completed() {
        let store = Arc::new(InMemoryTaskStore::new());
        let resolver = DependencyResolver::new(store.clone());
        seed(&store, NewTask::new("a", Duration::ZERO)).await;
        seed(&store, NewTask::new("b", Duration::ZERO)).await;
        let c = seed(
            &store,
            NewTask::new("c", Duration::ZERO).depends_on("a").depends_on("b"),
        )
        .await;

        set_status(&store, "a", TaskStatus::Completed).await;
        assert!(!resolver.is_ready(&c).await.unwrap());

        set_status(&store, "b", TaskStatus::Completed).await;
        assert!(resolver.is_ready(&c).await.unwrap());
    }

    #[tokio::test]
    async fn promotion_is_idempotent() {
        let store = Arc::new(InMemoryTaskStore::new());
        let resolver = DependencyResolver::new(store.clone());
        seed(&store, NewTask::new("a", Duration::ZERO)).await;
        seed(&store, NewTask::new("b", Duration::ZERO).depends_on("a")).await;

        assert!(resolver.promote_ready().await.unwrap().is_empty());

        set_status(&store, "a", TaskStatus::Completed).await;
        assert_eq!(resolver.promote_ready().await.unwrap(), vec![id("b")]);

        let version = store.get(&id("b")).await.unwrap().unwrap().version;
        assert!(resolver.promote_ready().await.unwrap().is_empty());
        let b = store.get(&id("b")).await.unwrap().unwrap();
        assert_eq!(b.status, TaskStatus::Queued);
        assert_eq!(b.version, version);
    }

    #[tokio::test]
    async fn find_cycle_through_existing_rows() {
        let store = Arc::new(InMemoryTaskStore::new());
        let resolver = DependencyResolver::new(store.clone());
        // b waits on a, which does not exist yet
        seed(&store, NewTask::new("b", Duration::ZERO).depends_on("a")).await;

        let cycle = resolver.find_cycle(&id("a"), &[id("b")]).await.unwrap();
        assert_eq!(cycle, Some(vec![id("a"), id("b"), id("a")]));

        assert!(resolver.find_cycle(&id("c"), &[id("b")]).await.unwrap().is_none());
    }

    #[test]
    fn detect_self_dependency() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency(id("a"), id("a"));
        assert_eq!(graph.detect_cycle(), Some(vec![id("a"), id("a")]));
    }

    #[test]
    fn detect_longer_cycle() {
        let mut graph = DependencyGraph::new();
        // b -> c -> d -> b, with a hanging off b
        graph.add_dependency(id("b"), id("a"));
        graph.add_dependency(id("c"), id("b"));
        graph.add_dependency(id("d"), id("c"));
        graph.add_dependency(id("b"), id("d"));

        let cycle = graph.detect_cycle().unwrap();
        assert_eq!(cycle.first(), cycle.last());
        assert_eq!(cycle.len(), 4);
    }

    #[test]
    fn diamond_is_not_a_cycle() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency(id("b"), id("a"));
        graph.add_dependency(id("c"), id("a"));
        graph.add_dependency(id("d"), id("b"));
        graph.add_dependency(id("d"), id("c"));

        assert!(graph.detect_cycle().is_none());
        assert_eq!(graph.dependencies(&id("d")).len(), 2);
    }
}
