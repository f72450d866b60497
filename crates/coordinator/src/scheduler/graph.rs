//! Task dependency topology

use ai_agent_common::TaskId;
use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, HashSet, VecDeque};

/// Directed graph over task ids.
///
/// An edge `task -> dependency` means `task` waits for `dependency`. Nodes may
/// exist for ids that were never submitted (placeholders).
#[derive(Debug, Default)]
pub struct DependencyGraph {
    graph: DiGraph<TaskId, ()>,
    index: HashMap<TaskId, NodeIndex>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.index.contains_key(id)
    }

    fn node(&mut self, id: &TaskId) -> NodeIndex {
        if let Some(idx) = self.index.get(id) {
            return *idx;
        }
        let idx = self.graph.add_node(id.clone());
        self.index.insert(id.clone(), idx);
        idx
    }

    pub fn ensure_node(&mut self, id: &TaskId) {
        self.node(id);
    }

    /// Whether adding `task -> dependency` would close a cycle
    pub fn would_cycle(&self, task: &TaskId, dependency: &TaskId) -> bool {
        if task == dependency {
            return true;
        }
        match (self.index.get(task), self.index.get(dependency)) {
            (Some(&t), Some(&d)) => has_path_connecting(&self.graph, d, t, None),
            _ => false,
        }
    }

    pub fn has_edge(&self, task: &TaskId, dependency: &TaskId) -> bool {
        match (self.index.get(task), self.index.get(dependency)) {
            (Some(&t), Some(&d)) => self.graph.contains_edge(t, d),
            _ => false,
        }
    }

    /// Insert an edge; callers check [`would_cycle`](Self::would_cycle) first
    pub fn add_edge(&mut self, task: &TaskId, dependency: &TaskId) {
        let t = self.node(task);
        let d = self.node(dependency);
        self.graph.update_edge(t, d, ());
    }

    pub fn dependencies(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbors(id, Direction::Outgoing)
    }

    pub fn dependents(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbors(id, Direction::Incoming)
    }

    fn neighbors(&self, id: &TaskId, direction: Direction) -> Vec<TaskId> {
        let Some(&idx) = self.index.get(id) else {
            return Vec::new();
        };
        let mut ids: Vec<TaskId> = self
            .graph
            .neighbors_directed(idx, direction)
            .map(|n| self.graph[n].clone())
            .collect();
        ids.sort();
        ids
    }

    /// Every task that transitively waits on `id`, nearest first
    pub fn transitive_dependents(&self, id: &TaskId) -> Vec<TaskId> {
        let Some(&start) = self.index.get(id) else {
            return Vec::new();
        };
        let mut seen = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);
        let mut out = Vec::new();

        while let Some(idx) = queue.pop_front() {
            for next in self.graph.neighbors_directed(idx, Direction::Incoming) {
                if seen.insert(next) {
                    out.push(self.graph[next].clone());
                    queue.push_back(next);
                }
            }
        }
        out
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_acyclic(&self) -> bool {
        !petgraph::algo::is_cyclic_directed(&self.graph)
    }
}
