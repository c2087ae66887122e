//! Dependency graph over container names.
//!
//! Edges point from a dependency to its dependent, so a topological order
//! is a valid startup order.

use std::collections::HashMap;

use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};

use crate::error::{Error, Result};

#[derive(Debug, Default)]
pub struct DependencyGraph {
    graph: DiGraph<String, ()>,
    node_map: HashMap<String, NodeIndex>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(name, dependencies)` pairs. Dependencies that are not
    /// themselves listed become leaf nodes.
    pub fn from_edges<'a, I, D>(entries: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, D)>,
        D: IntoIterator<Item = &'a str>,
    {
        let mut graph = Self::new();
        for (name, deps) in entries {
            graph.add_node(name);
            for dep in deps {
                graph.add_dependency(name, dep);
            }
        }
        graph
    }

    pub fn add_node(&mut self, name: &str) -> NodeIndex {
        if let Some(idx) = self.node_map.get(name) {
            return *idx;
        }
        let idx = self.graph.add_node(name.to_string());
        self.node_map.insert(name.to_string(), idx);
        idx
    }

    /// `name` depends on `dependency`.
    pub fn add_dependency(&mut self, name: &str, dependency: &str) {
        let to = self.add_node(name);
        let from = self.add_node(dependency);
        if self.graph.find_edge(from, to).is_none() {
            self.graph.add_edge(from, to, ());
        }
    }

    pub fn len(&self) -> usize {
        self.node_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.node_map.is_empty()
    }

    /// Fail with the members of a cycle if there is one.
    pub fn check_acyclic(&self) -> Result<()> {
        self.startup_order().map(|_| ())
    }

    /// Names ordered so that every dependency precedes its dependents.
    pub fn startup_order(&self) -> Result<Vec<String>> {
        match toposort(&self.graph, None) {
            Ok(order) => Ok(order
                .into_iter()
                .map(|idx| self.graph[idx].clone())
                .collect()),
            Err(cycle) => Err(Error::CyclicDependency(self.cycle_through(cycle.node_id()))),
        }
    }

    /// Reverse of the startup order: dependents first.
    pub fn teardown_order(&self) -> Result<Vec<String>> {
        let mut order = self.startup_order()?;
        order.reverse();
        Ok(order)
    }

    /// Names in the strongly connected component containing `start`, closed
    /// back onto the first name.
    fn cycle_through(&self, start: NodeIndex) -> Vec<String> {
        let component = tarjan_scc(&self.graph)
            .into_iter()
            .find(|scc| scc.contains(&start))
            .unwrap_or_else(|| vec![start]);
        let mut names: Vec<String> = component
            .into_iter()
            .map(|idx| self.graph[idx].clone())
            .collect();
        names.sort();
        if let Some(first) = names.first().cloned() {
            names.push(first);
        }
        names
    }
}
