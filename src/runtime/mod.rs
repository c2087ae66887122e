// Container runtime boundary: the trait the handles talk to, a `docker` CLI
// implementation and an in-memory fake for tests.

pub mod docker;
pub mod memory;

use std::io::Read;

use crate::container::{ContainerPort, PortBinding, VolumeMount};
use crate::error::Result;

pub use docker::{DockerCli, ensure_available, invoking_user};
pub use memory::{EventKind, ImageBehavior, MemoryRuntime, RuntimeEvent};

/// Everything the runtime needs to create a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateOptions {
    pub name: String,
    pub image: String,
    /// `KEY=value` entries, in insertion order.
    pub env: Vec<String>,
    pub cmd: Vec<String>,
    pub exposed_ports: Vec<ContainerPort>,
    pub port_bindings: Vec<PortBinding>,
    pub mounts: Vec<VolumeMount>,
    pub tty: bool,
    pub user: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Created {
    pub id: String,
    pub warnings: Vec<String>,
}

/// Runtime-side status, as reported by inspect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown(String),
}

impl ContainerStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "removing" => Self::Removing,
            "exited" => Self::Exited,
            "dead" => Self::Dead,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn is_exited(&self) -> bool {
        matches!(self, Self::Exited | Self::Dead)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub status: ContainerStatus,
    pub ip_address: String,
    pub exit_code: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: Option<i32>,
    pub output: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Operations the core needs from a container engine.
///
/// Implementations report a vanished container as [`crate::Error::NotFound`]
/// so that cleanup can tolerate it.
pub trait ContainerRuntime: Send + Sync {
    fn pull(&self, reference: &str) -> Result<()>;
    fn create(&self, options: &CreateOptions) -> Result<Created>;
    fn start(&self, id: &str) -> Result<()>;
    fn stop(&self, id: &str) -> Result<()>;
    /// Force-remove, killing the container if needed.
    fn remove(&self, id: &str) -> Result<()>;
    fn inspect(&self, id: &str) -> Result<ContainerInfo>;
    /// Full log output so far (stdout and stderr), from the beginning.
    fn logs(&self, id: &str) -> Result<Box<dyn Read + Send>>;
    fn exec(&self, id: &str, argv: &[String]) -> Result<ExecOutput>;
}

/// Reference for an image on Docker Hub's library namespace.
pub fn from_docker_hub(image: &str, version: &str) -> String {
    let version = if version.is_empty() { "latest" } else { version };
    format!("docker.io/library/{image}:{version}")
}
