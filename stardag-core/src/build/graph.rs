//! Discovery: flatten `requires()` from a set of root tasks into a full
//! dependency graph, detecting cycles and running completion pre-checks
//! concurrently (§4.2.1 "Discovery", "Completion pre-check").

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use petgraph::algo::is_cyclic_directed;
use petgraph::graphmap::GraphMap;
use petgraph::Directed;
use uuid::Uuid;

use crate::run::TaskError;
use crate::task::{flatten_task_struct, Task};

#[derive(thiserror::Error, Debug)]
pub enum DiscoveryError {
    #[error("dependency cycle detected involving task {0}")]
    Cycle(Uuid),
    #[error(transparent)]
    Target(#[from] TaskError),
}

/// The fully flattened, acyclic dependency graph discovered from a set of
/// root tasks, plus the completion pre-check result for every node.
pub struct DiscoveredGraph {
    /// Every discovered task, keyed by id (first occurrence wins; tasks
    /// sharing an id are, by construction, parameter-identical).
    pub tasks: HashMap<Uuid, Arc<dyn Task>>,
    /// Directed edges, upstream -> downstream.
    pub edges: GraphMap<Uuid, (), Directed>,
    /// Which discovered tasks were already complete at discovery time.
    pub precomputed_complete: HashSet<Uuid>,
}

impl DiscoveredGraph {
    pub fn upstream_of(&self, id: Uuid) -> Vec<Uuid> {
        self.edges
            .neighbors_directed(id, petgraph::Direction::Incoming)
            .collect()
    }

    pub fn downstream_of(&self, id: Uuid) -> Vec<Uuid> {
        self.edges
            .neighbors_directed(id, petgraph::Direction::Outgoing)
            .collect()
    }
}

/// Recursively flatten `requires()` starting from `roots`, building the
/// adjacency index and running `complete()` pre-checks concurrently
/// (bounded by nothing here — the caller's executor provides the
/// concurrency cap via how many futures are polled at once, matching the
/// cooperative-runner budget in §4.2.1).
pub async fn discover(roots: Vec<Arc<dyn Task>>) -> Result<DiscoveredGraph, DiscoveryError> {
    let mut tasks: HashMap<Uuid, Arc<dyn Task>> = HashMap::new();
    let mut edges: GraphMap<Uuid, (), Directed> = GraphMap::new();
    let mut frontier: Vec<Arc<dyn Task>> = roots;

    while !frontier.is_empty() {
        let mut next_frontier = Vec::new();
        for task in frontier {
            let id = task.id();
            edges.add_node(id);
            if tasks.contains_key(&id) {
                continue;
            }
            tasks.insert(id, task.clone());

            let mut deps = Vec::new();
            flatten_task_struct(&task.requires(), &mut deps);
            for dep in deps {
                let dep_id = dep.id();
                edges.add_node(dep_id);
                edges.add_edge(dep_id, id, ());
                next_frontier.push(dep);
            }
        }
        frontier = next_frontier;
    }

    if is_cyclic_directed(&edges) {
        // Report an arbitrary member of the cycle; good enough for a
        // diagnostic, the caller logs the full edge set separately.
        let offender = edges.nodes().next().unwrap_or_else(Uuid::nil);
        return Err(DiscoveryError::Cycle(offender));
    }

    let mut precomputed_complete = HashSet::new();
    let mut checks = FuturesUnordered::new();
    for (id, task) in tasks.iter() {
        let id = *id;
        let task = task.clone();
        checks.push(async move { (id, task.complete().await) });
    }
    while let Some((id, result)) = checks.next().await {
        if result? {
            precomputed_complete.insert(id);
        }
    }

    Ok(DiscoveredGraph {
        tasks,
        edges,
        precomputed_complete,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::demo_tasks::Add;

    #[tokio::test]
    async fn diamond_dag_discovers_three_distinct_tasks() {
        let left = Arc::new(Add::new(1, 2));
        let right = Arc::new(Add::new(3, 4));
        let root = Arc::new(Add::from_tasks(left.clone(), right.clone()));

        let graph = discover(vec![root.clone()]).await.unwrap();
        assert_eq!(graph.tasks.len(), 3);
        assert!(graph.upstream_of(root.id()).len() == 2);
    }
}
