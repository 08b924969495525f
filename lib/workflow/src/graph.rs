//! Ordering of independent works by their declared dependencies.
//!
//! Works that no condition routes to are started on the first sync. Among
//! them, `depends_on` relations (explicit ids or dependency-map task names)
//! decide the start order. The relations form a directed graph:
//! - Nodes are work ids
//! - An edge `a -> b` means `b` depends on `a`
//!
//! A true cycle is a configuration error unless the template opts into the
//! permissive fallback, which appends the cyclic works in template order.

use crate::error::GraphError;
use crate::node::WorkNode;
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};
use workweave_core::WorkId;

/// Dependency graph over work ids using petgraph.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    graph: DiGraph<WorkId, ()>,
    /// Map from WorkId to petgraph's NodeIndex for O(1) lookup.
    node_index_map: HashMap<WorkId, NodeIndex>,
    /// Insertion order; ties are broken by it.
    insertion: Vec<WorkId>,
}

impl DependencyGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the graph for a set of template nodes, adding an edge
    /// wherever one work depends on another in the same set.
    ///
    /// Nested workflows take part in the order but declare no dependencies.
    ///
    /// # Errors
    ///
    /// Returns an error if a node appears twice.
    pub fn from_nodes<'a>(
        nodes: impl IntoIterator<Item = &'a WorkNode>,
    ) -> Result<Self, GraphError> {
        let nodes: Vec<&WorkNode> = nodes.into_iter().collect();
        let mut graph = Self::new();
        for node in &nodes {
            graph.add_work(node.id())?;
        }
        let works: Vec<_> = nodes.iter().filter_map(|node| node.as_work()).collect();
        for work in &works {
            for other in &works {
                if work.id != other.id && work.depends_on_work(other) {
                    graph.add_dependency(work.id, other.id)?;
                }
            }
        }
        Ok(graph)
    }

    /// Adds a work node.
    ///
    /// # Errors
    ///
    /// Returns an error if the work is already present.
    pub fn add_work(&mut self, work_id: WorkId) -> Result<(), GraphError> {
        if self.node_index_map.contains_key(&work_id) {
            return Err(GraphError::DuplicateWork { work_id });
        }
        let index = self.graph.add_node(work_id);
        self.node_index_map.insert(work_id, index);
        self.insertion.push(work_id);
        Ok(())
    }

    /// Records that `work_id` must start after `depends_on`.
    ///
    /// # Errors
    ///
    /// Returns an error if either work is not in the graph.
    pub fn add_dependency(&mut self, work_id: WorkId, depends_on: WorkId) -> Result<(), GraphError> {
        let target = self.index(work_id)?;
        let source = self.index(depends_on)?;
        self.graph.update_edge(source, target, ());
        Ok(())
    }

    fn index(&self, work_id: WorkId) -> Result<NodeIndex, GraphError> {
        self.node_index_map
            .get(&work_id)
            .copied()
            .ok_or(GraphError::UnknownWork { work_id })
    }

    /// Works this work depends on.
    #[must_use]
    pub fn dependencies(&self, work_id: WorkId) -> Vec<WorkId> {
        let Some(&index) = self.node_index_map.get(&work_id) else {
            return Vec::new();
        };
        self.graph
            .neighbors_directed(index, Direction::Incoming)
            .filter_map(|i| self.graph.node_weight(i).copied())
            .collect()
    }

    /// Works that sit on a cycle, in insertion order.
    #[must_use]
    pub fn cyclic_works(&self) -> Vec<WorkId> {
        let mut cyclic = HashSet::new();
        for component in petgraph::algo::tarjan_scc(&self.graph) {
            let self_loop = component.len() == 1
                && self.graph.contains_edge(component[0], component[0]);
            if component.len() > 1 || self_loop {
                cyclic.extend(component.iter().filter_map(|i| self.graph.node_weight(*i).copied()));
            }
        }
        self.insertion
            .iter()
            .copied()
            .filter(|id| cyclic.contains(id))
            .collect()
    }

    /// Returns the start order: every work after the works it depends on,
    /// ties broken by insertion order.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::CycleDetected` when dependencies are cyclic and
    /// `allow_cycles` is false.
    pub fn order(&self, allow_cycles: bool) -> Result<Vec<WorkId>, GraphError> {
        if petgraph::algo::is_cyclic_directed(&self.graph) && !allow_cycles {
            return Err(GraphError::CycleDetected {
                works: self.cyclic_works(),
            });
        }

        let mut placed: HashSet<WorkId> = HashSet::new();
        let mut ordered = Vec::with_capacity(self.insertion.len());
        loop {
            let mut progress = false;
            for id in &self.insertion {
                if placed.contains(id) {
                    continue;
                }
                if self.dependencies(*id).iter().all(|dep| placed.contains(dep)) {
                    placed.insert(*id);
                    ordered.push(*id);
                    progress = true;
                }
            }
            if !progress {
                break;
            }
        }

        let remaining: Vec<WorkId> = self
            .insertion
            .iter()
            .copied()
            .filter(|id| !placed.contains(id))
            .collect();
        if !remaining.is_empty() {
            tracing::warn!(
                works = ?remaining,
                "dependency cycle among independent works, starting them in template order"
            );
            ordered.extend(remaining);
        }
        Ok(ordered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work::{DependencyItem, Work};

    fn graph_of(works: &[&Work]) -> DependencyGraph {
        let nodes: Vec<WorkNode> = works.iter().map(|w| (*w).clone().into()).collect();
        DependencyGraph::from_nodes(&nodes).unwrap()
    }

    #[test]
    fn orders_by_dependency() {
        let a = Work::new("a");
        let b = Work::new("b")
            .with_dependency_map(vec![DependencyItem::new("x").depends_on("a", "f")])
            .unwrap();
        let mut c = Work::new("c");
        c.depends_on.insert(b.id);

        let graph = graph_of(&[&c, &b, &a]);
        assert_eq!(graph.order(false).unwrap(), vec![a.id, b.id, c.id]);
        assert_eq!(graph.dependencies(c.id), vec![b.id]);
        assert!(graph.dependencies(a.id).is_empty());
    }

    #[test]
    fn independent_works_keep_insertion_order() {
        let a = Work::new("a");
        let b = Work::new("b");
        let graph = graph_of(&[&b, &a]);
        assert_eq!(graph.order(false).unwrap(), vec![b.id, a.id]);
    }

    #[test]
    fn cycle_is_rejected() {
        let mut a = Work::new("a");
        let mut b = Work::new("b");
        let c = Work::new("c");
        a.depends_on.insert(b.id);
        b.depends_on.insert(a.id);

        let graph = graph_of(&[&a, &b, &c]);
        assert_eq!(
            graph.order(false),
            Err(GraphError::CycleDetected {
                works: vec![a.id, b.id]
            })
        );
    }

    #[test]
    fn permissive_fallback_appends_cycle() {
        let mut a = Work::new("a");
        let mut b = Work::new("b");
        let c = Work::new("c");
        a.depends_on.insert(b.id);
        b.depends_on.insert(a.id);

        let graph = graph_of(&[&a, &b, &c]);
        assert_eq!(graph.order(true).unwrap(), vec![c.id, a.id, b.id]);
    }

    #[test]
    fn duplicate_work_is_rejected() {
        let mut graph = DependencyGraph::new();
        let id = WorkId::new();
        graph.add_work(id).unwrap();
        assert_eq!(graph.add_work(id), Err(GraphError::DuplicateWork { work_id: id }));
    }
}
