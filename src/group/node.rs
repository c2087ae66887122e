use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, error, info};

use super::signal::CompletionSignal;
use crate::container::Container;
use crate::error::Result;

/// Why a node never signaled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeFailure {
    pub name: String,
    pub error: String,
    /// Container logs captured when the failure happened, if any.
    pub logs: String,
}

/// A container inside a group, plus the containers it waits for.
///
/// Cloning is cheap and shares the container, the signal and the failure
/// slot; the startup thread works on a clone.
#[derive(Debug, Clone)]
pub struct GroupedContainer {
    name: String,
    container: Arc<Container>,
    depends_on: BTreeMap<String, Arc<CompletionSignal>>,
    signal: Arc<CompletionSignal>,
    failure: Arc<Mutex<Option<NodeFailure>>>,
}

impl GroupedContainer {
    pub fn new(container: Container) -> Self {
        let name = container.name().to_string();
        Self {
            signal: Arc::new(CompletionSignal::new(name.clone())),
            name,
            container: Arc::new(container),
            depends_on: BTreeMap::new(),
            failure: Arc::new(Mutex::new(None)),
        }
    }

    /// Don't start this container until every one of `others` is ready.
    pub fn depends_on(&mut self, others: &[&GroupedContainer]) -> &mut Self {
        for other in others {
            self.depends_on
                .insert(other.name.clone(), Arc::clone(&other.signal));
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn container(&self) -> &Arc<Container> {
        &self.container
    }

    pub fn dependencies(&self) -> impl Iterator<Item = &str> {
        self.depends_on.keys().map(String::as_str)
    }

    pub fn is_signaled(&self) -> bool {
        self.signal.is_raised()
    }

    /// Block until this node has started and become ready.
    pub fn await_started(&self) {
        self.signal.wait();
    }

    pub fn await_started_timeout(&self, timeout: Duration) -> bool {
        self.signal.wait_timeout(timeout)
    }

    pub fn failure(&self) -> Option<NodeFailure> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Wait for all dependencies, start the container, wait for readiness and
    /// only then signal. Any failure leaves the signal unraised, so
    /// dependents keep waiting instead of starting against a broken
    /// prerequisite.
    pub fn start(&self) -> Result<()> {
        for (dep, signal) in &self.depends_on {
            debug!(container = %self.name, dependency = %dep, "waiting for dependency");
            signal.wait();
        }

        let id = self.container.start()?;
        debug!(container = %self.name, id = %id, "awaiting readiness");
        self.container.await_is_ready()?;

        info!(container = %self.name, "ready");
        self.signal.raise()
    }

    /// Run [`Self::start`], recording and logging a failure instead of
    /// returning it. This is the body of a node's startup thread.
    pub(crate) fn run(&self) {
        if let Err(err) = self.start() {
            if self.container.is_abandoned() {
                debug!(container = %self.name, error = %err, "group cleaned up before this container was ready");
                return;
            }
            let logs = self.container.logs().unwrap_or_default();
            error!(container = %self.name, error = %err, "failed to start; dependents will not proceed");
            if !logs.is_empty() {
                error!(container = %self.name, "captured logs:\n{logs}");
            }
            *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(NodeFailure {
                name: self.name.clone(),
                error: err.to_string(),
                logs,
            });
        }
    }
}
