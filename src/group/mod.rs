//! Container groups: compose-style, in code.
//!
//! Each node gets its own startup thread. A node waits for its dependencies'
//! completion signals, starts its container, polls it to readiness and then
//! raises its own signal. The only ordering guarantee is that a container is
//! created after all of its dependencies were ready; siblings race.
//!
//! A node whose dependency failed waits forever, which is why
//! [`ContainerGroup::await_timeout`] exists next to
//! [`ContainerGroup::await_all`]. Cleanup abandons every node first, so a
//! node that is still creating its container removes it instead of
//! starting it.

mod graph;
mod node;
mod signal;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::container::Container;
use crate::error::{Error, Result};

pub use graph::DependencyGraph;
pub use node::{GroupedContainer, NodeFailure};
pub use signal::CompletionSignal;

#[derive(Debug, Default)]
pub struct ContainerGroup {
    nodes: BTreeMap<String, GroupedContainer>,
    started: AtomicBool,
}

impl ContainerGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node keyed by its container name.
    pub fn add(&mut self, node: GroupedContainer) -> Result<()> {
        let name = node.name().to_string();
        if self.nodes.contains_key(&name) {
            return Err(Error::DuplicateName(name));
        }
        self.nodes.insert(name, node);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&GroupedContainer> {
        self.nodes.get(name)
    }

    pub fn container(&self, name: &str) -> Option<&Arc<Container>> {
        self.nodes.get(name).map(GroupedContainer::container)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &GroupedContainer> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn graph(&self) -> DependencyGraph {
        DependencyGraph::from_edges(
            self.nodes
                .values()
                .map(|n| (n.name(), n.dependencies().collect::<Vec<_>>())),
        )
    }

    /// Launch one startup thread per node and return straight away.
    ///
    /// Cycles are rejected before anything is launched. A group starts once.
    pub fn start(&self) -> Result<()> {
        self.graph().check_acyclic()?;
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::GroupAlreadyStarted);
        }

        info!(containers = self.nodes.len(), "starting group");
        for node in self.nodes.values() {
            let node = node.clone();
            thread::Builder::new()
                .name(format!("cntest-{}", node.name()))
                .spawn(move || node.run())?;
        }
        Ok(())
    }

    /// Block until every node has signaled ready.
    pub fn await_all(&self) {
        for node in self.nodes.values() {
            node.await_started();
        }
    }

    /// Like [`Self::await_all`], but give up after `timeout`.
    ///
    /// On timeout the pending nodes and any recorded failures are logged.
    pub fn await_timeout(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        for node in self.nodes.values() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !node.await_started_timeout(remaining) {
                let pending = self.pending();
                warn!(?pending, "group not ready in time");
                for failure in self.failures() {
                    warn!(container = %failure.name, error = %failure.error, "failed to start");
                }
                return Err(Error::Timeout(timeout));
            }
        }
        Ok(())
    }

    /// Nodes that have not signaled yet.
    pub fn pending(&self) -> Vec<String> {
        self.nodes
            .values()
            .filter(|n| !n.is_signaled())
            .map(|n| n.name().to_string())
            .collect()
    }

    pub fn failures(&self) -> Vec<NodeFailure> {
        self.nodes.values().filter_map(GroupedContainer::failure).collect()
    }

    /// No node may start a container from here on.
    fn abandon_all(&self) {
        for node in self.nodes.values() {
            node.container().abandon();
        }
    }

    /// Created containers, dependents before their dependencies.
    fn teardown_order(&self) -> Vec<&Arc<Container>> {
        let order = self
            .graph()
            .teardown_order()
            .unwrap_or_else(|_| self.nodes.keys().cloned().collect());
        order
            .iter()
            .filter_map(|name| self.nodes.get(name))
            .map(GroupedContainer::container)
            .filter(|c| c.id().is_ok())
            .collect()
    }

    /// Stop every container that was created. Keeps going past failures and
    /// returns the first one.
    pub fn stop_all(&self, timeout: Duration) -> Result<()> {
        let mut first_err = None;
        for container in self.teardown_order() {
            if let Err(e) = container.stop(timeout) {
                if matches!(e, Error::Removed(_)) {
                    continue;
                }
                warn!(container = %container.name(), error = %e, "stop failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    pub fn remove_all(&self) -> Result<()> {
        self.abandon_all();
        let mut first_err = None;
        for container in self.teardown_order() {
            if let Err(e) = container.remove() {
                warn!(container = %container.name(), error = %e, "remove failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Stop and remove containers according to each one's after-test policy
    /// and stop timeout. Nodes still starting are abandoned.
    pub fn cleanup(&self) -> Result<()> {
        self.abandon_all();
        let mut first_err = None;
        for container in self.teardown_order() {
            if let Err(e) = cleanup_container(container) {
                warn!(container = %container.name(), error = %e, "cleanup failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Apply a container's stop/remove-after-test policy.
pub(crate) fn cleanup_container(container: &Container) -> Result<()> {
    if container.id().is_err() {
        return Ok(());
    }
    if container.stop_after_test() || container.remove_after_test() {
        match container.stop(container.stop_timeout()) {
            Ok(_) | Err(Error::Removed(_)) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
    }
    if container.remove_after_test() {
        container.remove()?;
    }
    Ok(())
}
