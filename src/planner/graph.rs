//! Dependency graph between named nodes.
//!
//! Nodes are resource names. An edge `a -> b` means `a` depends on `b`, so
//! `b` comes first in topological order.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::PlanError;

/// Directed dependency graph with deterministic ordering.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// Dependencies of each node.
    edges: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    /// Creates an empty graph.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            edges: BTreeMap::new(),
        }
    }

    /// Adds a node with no dependencies.
    pub fn add_node(&mut self, name: impl Into<String>) {
        self.edges.entry(name.into()).or_default();
    }

    /// Records that `dependent` depends on `dependency`. Adds both nodes.
    pub fn add_edge(&mut self, dependent: &str, dependency: &str) {
        self.add_node(dependency);
        self.edges
            .entry(dependent.to_string())
            .or_default()
            .insert(dependency.to_string());
    }

    /// Returns true if the node exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.edges.contains_key(name)
    }

    /// All nodes, ordered by name.
    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.edges.keys().map(String::as_str)
    }

    /// Direct dependencies of a node.
    pub fn dependencies(&self, name: &str) -> impl Iterator<Item = &str> {
        self.edges
            .get(name)
            .into_iter()
            .flat_map(|deps| deps.iter().map(String::as_str))
    }

    /// Nodes that directly depend on `name`.
    pub fn dependents<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.edges
            .iter()
            .filter(move |(_, deps)| deps.contains(name))
            .map(|(node, _)| node.as_str())
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Orders nodes so every node comes after its dependencies.
    ///
    /// Ties are broken by name.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::CyclicDependency`] naming one cycle if the graph
    /// is not acyclic.
    pub fn topological_order(&self) -> Result<Vec<String>, PlanError> {
        self.topological_order_by(|_| ())
    }

    /// Orders nodes so every node comes after its dependencies.
    ///
    /// Among nodes that are ready at the same time, the one with the smallest
    /// `priority` goes first, then the smallest name.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::CyclicDependency`] naming one cycle if the graph
    /// is not acyclic.
    pub fn topological_order_by<K: Ord>(
        &self,
        priority: impl Fn(&str) -> K,
    ) -> Result<Vec<String>, PlanError> {
        let mut remaining: BTreeMap<&str, usize> = self
            .edges
            .iter()
            .map(|(node, deps)| (node.as_str(), deps.len()))
            .collect();

        let mut ready: BTreeSet<(K, &str)> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(node, _)| (priority(node), *node))
            .collect();

        let mut order = Vec::with_capacity(self.edges.len());
        while let Some((_, node)) = ready.pop_first() {
            remaining.remove(node);
            order.push(node.to_string());
            for dependent in self.dependents(node) {
                if let Some(count) = remaining.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert((priority(dependent), dependent));
                    }
                }
            }
        }

        if order.len() == self.edges.len() {
            return Ok(order);
        }

        let blocked: BTreeSet<&str> = remaining.keys().copied().collect();
        Err(PlanError::CyclicDependency {
            cycle: self.find_cycle(&blocked).join(" -> "),
        })
    }

    /// Finds one cycle among `candidates`, returned with the first node
    /// repeated at the end.
    fn find_cycle(&self, candidates: &BTreeSet<&str>) -> Vec<String> {
        let Some(start) = candidates.iter().next() else {
            return Vec::new();
        };

        // Every blocked node has a blocked dependency, so walking blocked
        // dependencies always revisits a node.
        let mut path: Vec<&str> = vec![start];
        loop {
            let Some(current) = path.last().copied() else {
                return Vec::new();
            };
            let Some(next) = self.dependencies(current).find(|d| candidates.contains(d)) else {
                return path.iter().map(ToString::to_string).collect();
            };
            if let Some(pos) = path.iter().position(|n| *n == next) {
                let mut cycle: Vec<String> = path[pos..].iter().map(ToString::to_string).collect();
                cycle.push(next.to_string());
                return cycle;
            }
            path.push(next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dependencies_come_first() {
        let mut graph = DependencyGraph::new();
        graph.add_edge("vm1", "nic1");
        graph.add_edge("nic1", "subnet");
        graph.add_node("standalone");

        let order = graph.topological_order().unwrap();
        let pos = |n: &str| order.iter().position(|o| o == n).unwrap();
        assert!(pos("subnet") < pos("nic1"));
        assert!(pos("nic1") < pos("vm1"));
        assert_eq!(order.len(), 4);
    }

    #[test]
    fn test_order_is_deterministic() {
        let mut graph = DependencyGraph::new();
        for name in ["c", "a", "b"] {
            graph.add_node(name);
        }
        assert_eq!(graph.topological_order().unwrap(), vec!["a", "b", "c"]);

        let order = graph
            .topological_order_by(|n| if n == "c" { 0 } else { 1 })
            .unwrap();
        assert_eq!(order, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_two_node_cycle() {
        let mut graph = DependencyGraph::new();
        graph.add_edge("a", "b");
        graph.add_edge("b", "a");

        let err = graph.topological_order().unwrap_err();
        let PlanError::CyclicDependency { cycle } = err else {
            panic!("expected a cycle error");
        };
        assert_eq!(cycle, "a -> b -> a");
    }

    #[test]
    fn test_cycle_behind_acyclic_prefix() {
        let mut graph = DependencyGraph::new();
        graph.add_edge("app", "x");
        graph.add_edge("x", "y");
        graph.add_edge("y", "z");
        graph.add_edge("z", "x");

        let err = graph.topological_order().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Cyclic dependency: x -> y -> z -> x"
        );
    }

    #[test]
    fn test_dependents() {
        let mut graph = DependencyGraph::new();
        graph.add_edge("vm1", "nic1");
        graph.add_edge("vm2", "nic1");
        let dependents: Vec<_> = graph.dependents("nic1").collect();
        assert_eq!(dependents, vec!["vm1", "vm2"]);
        assert!(graph.contains("nic1"));
        assert_eq!(graph.dependencies("vm1").collect::<Vec<_>>(), vec!["nic1"]);
    }
}
