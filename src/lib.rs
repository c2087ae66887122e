//! Throwaway containers for integration tests.
//!
//! A [`Container`] wraps one container's configuration and lifecycle. A
//! [`ContainerGroup`] starts several of them concurrently, each one only
//! after the containers it depends on are ready, and offers a barrier that
//! returns once all of them are. Readiness is decided by a pluggable
//! [`probe::ReadinessCheck`] polled at a fixed interval.
//!
//! The engine is reached through [`runtime::ContainerRuntime`]:
//! [`runtime::DockerCli`] drives the `docker` binary and
//! [`runtime::MemoryRuntime`] fakes it in-process.

pub mod config;
pub mod container;
pub mod error;
pub mod group;
pub mod harness;
pub mod presets;
pub mod probe;
pub mod random;
pub mod runtime;
pub mod wait;

pub use config::{GroupFile, Settings};
pub use container::{Container, ContainerPort, HostPort, LifecycleState, PropertyMap};
pub use error::{Error, Result};
pub use group::{CompletionSignal, ContainerGroup, GroupedContainer};
pub use probe::ReadinessCheck;
pub use runtime::ContainerRuntime;
pub use wait::Poller;
