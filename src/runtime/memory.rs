//! In-process container runtime.
//!
//! Behaves like a very small Docker: names must be unique, host ports can't
//! be published twice, removed containers vanish from inspect. Each image can
//! be given a scripted [`ImageBehavior`], and every operation is journaled so
//! tests can assert on ordering.

use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use super::{ContainerInfo, ContainerRuntime, ContainerStatus, CreateOptions, Created, ExecOutput};
use crate::error::{Error, Result};

/// Scripted behavior for containers created from one image.
#[derive(Debug, Clone, Default)]
pub struct ImageBehavior {
    /// Log text the container "prints".
    pub logs: String,
    /// Logs stay empty until this long after start.
    pub log_delay: Duration,
    /// `create` blocks for this long before the container exists.
    pub create_delay: Duration,
    /// `start` blocks for this long before returning.
    pub start_delay: Duration,
    /// The process exits right after starting.
    pub exits_on_start: bool,
    /// `start` fails with this message.
    pub reject_start: Option<String>,
    /// Exit code returned by `exec`.
    pub exec_exit_code: i32,
}

impl ImageBehavior {
    pub fn logging(logs: impl Into<String>) -> Self {
        Self {
            logs: logs.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Pull,
    Create,
    Start,
    Stop,
    Remove,
    Exec,
}

#[derive(Debug, Clone)]
pub struct RuntimeEvent {
    pub kind: EventKind,
    /// Container name, or the image reference for pulls.
    pub name: String,
    pub at: Instant,
}

#[derive(Debug)]
struct Record {
    id: String,
    options: CreateOptions,
    behavior: ImageBehavior,
    status: ContainerStatus,
    ip_address: String,
    started_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    images: HashMap<String, ImageBehavior>,
    containers: HashMap<String, Record>,
    journal: Vec<RuntimeEvent>,
}

impl State {
    fn record(&mut self, kind: EventKind, name: &str) {
        self.journal.push(RuntimeEvent {
            kind,
            name: name.to_string(),
            at: Instant::now(),
        });
    }

    fn lookup(&mut self, id: &str) -> Result<&mut Record> {
        self.containers
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    fn published_ports(&self) -> HashSet<u16> {
        self.containers
            .values()
            .filter(|r| r.status == ContainerStatus::Running)
            .flat_map(|r| r.options.port_bindings.iter().map(|b| b.host_port))
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct MemoryRuntime {
    state: Mutex<State>,
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the behavior of every container created from `image`.
    pub fn with_image(self, image: impl Into<String>, behavior: ImageBehavior) -> Self {
        self.lock().images.insert(image.into(), behavior);
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn events(&self) -> Vec<RuntimeEvent> {
        self.lock().journal.clone()
    }

    /// First time `kind` happened to the container called `name`.
    pub fn first(&self, kind: EventKind, name: &str) -> Option<Instant> {
        self.lock()
            .journal
            .iter()
            .find(|e| e.kind == kind && e.name == name)
            .map(|e| e.at)
    }

    /// Options the container called `name` was created with.
    pub fn created_options(&self, name: &str) -> Option<CreateOptions> {
        self.lock()
            .containers
            .values()
            .find(|r| r.options.name == name)
            .map(|r| r.options.clone())
    }

    /// Number of containers that exist (not yet removed).
    pub fn live_count(&self) -> usize {
        self.lock().containers.len()
    }

    /// Make a running container exit, as if its process crashed.
    pub fn crash(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        let record = state.lookup(id)?;
        record.status = ContainerStatus::Exited;
        Ok(())
    }
}

impl ContainerRuntime for MemoryRuntime {
    fn pull(&self, reference: &str) -> Result<()> {
        self.lock().record(EventKind::Pull, reference);
        Ok(())
    }

    fn create(&self, options: &CreateOptions) -> Result<Created> {
        let delay = self
            .lock()
            .images
            .get(&options.image)
            .map_or(Duration::ZERO, |b| b.create_delay);
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let mut state = self.lock();
        if state.containers.values().any(|r| r.options.name == options.name) {
            return Err(Error::runtime(
                "create",
                format!(
                    "Conflict. The container name \"/{}\" is already in use",
                    options.name
                ),
            ));
        }
        state.next_id += 1;
        let id = format!("{:012x}", state.next_id);
        let behavior = state.images.get(&options.image).cloned().unwrap_or_default();
        let ip_address = format!("172.17.0.{}", state.next_id % 250 + 2);
        state.containers.insert(
            id.clone(),
            Record {
                id: id.clone(),
                options: options.clone(),
                behavior,
                status: ContainerStatus::Created,
                ip_address,
                started_at: None,
            },
        );
        state.record(EventKind::Create, &options.name);
        debug!(id, name = %options.name, "memory runtime created container");
        Ok(Created {
            id,
            warnings: Vec::new(),
        })
    }

    fn start(&self, id: &str) -> Result<()> {
        let delay = {
            let mut state = self.lock();
            let published = state.published_ports();
            let record = state.lookup(id)?;
            if let Some(message) = &record.behavior.reject_start {
                return Err(Error::runtime("start", message.clone()));
            }
            if let Some(clash) = record
                .options
                .port_bindings
                .iter()
                .find(|b| published.contains(&b.host_port))
            {
                return Err(Error::runtime(
                    "start",
                    format!("Bind for 0.0.0.0:{} failed: port is already allocated", clash.host_port),
                ));
            }
            record.behavior.start_delay
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let mut state = self.lock();
        let record = state.lookup(id)?;
        record.started_at = Some(Instant::now());
        record.status = if record.behavior.exits_on_start {
            ContainerStatus::Exited
        } else {
            ContainerStatus::Running
        };
        let name = record.options.name.clone();
        state.record(EventKind::Start, &name);
        Ok(())
    }

    fn stop(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        let record = state.lookup(id)?;
        record.status = ContainerStatus::Exited;
        let name = record.options.name.clone();
        state.record(EventKind::Stop, &name);
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        let record = state
            .containers
            .remove(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        state.record(EventKind::Remove, &record.options.name);
        Ok(())
    }

    fn inspect(&self, id: &str) -> Result<ContainerInfo> {
        let mut state = self.lock();
        let record = state.lookup(id)?;
        Ok(ContainerInfo {
            id: record.id.clone(),
            name: record.options.name.clone(),
            status: record.status.clone(),
            ip_address: record.ip_address.clone(),
            exit_code: record.status.is_exited().then_some(0),
        })
    }

    fn logs(&self, id: &str) -> Result<Box<dyn std::io::Read + Send>> {
        let mut state = self.lock();
        let record = state.lookup(id)?;
        let visible = record
            .started_at
            .is_some_and(|t| t.elapsed() >= record.behavior.log_delay);
        let text = if visible {
            record.behavior.logs.clone()
        } else {
            String::new()
        };
        Ok(Box::new(Cursor::new(text.into_bytes())))
    }

    fn exec(&self, id: &str, argv: &[String]) -> Result<ExecOutput> {
        let mut state = self.lock();
        let record = state.lookup(id)?;
        if record.status != ContainerStatus::Running {
            return Err(Error::AlreadyExited(id.to_string()));
        }
        let exit_code = record.behavior.exec_exit_code;
        let name = record.options.name.clone();
        state.record(EventKind::Exec, &name);
        Ok(ExecOutput {
            exit_code: Some(exit_code),
            output: argv.join(" "),
        })
    }
}
