//! Run a test body against started containers and always clean up.
//!
//! ```no_run
//! use std::sync::Arc;
//! use cntest::{harness, presets, runtime::DockerCli, PropertyMap};
//!
//! let db = presets::postgres::container(Arc::new(DockerCli::new()), PropertyMap::new())?;
//! harness::run_with_container(&db, |db| {
//!     let url = presets::postgres::connection_url(db)?;
//!     assert!(url.starts_with("postgres://"));
//!     Ok(())
//! })?;
//! # Ok::<(), anyhow::Error>(())
//! ```

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::container::Container;
use crate::group::{ContainerGroup, NodeFailure, cleanup_container};

enum Target<'a> {
    Container(&'a Container),
    Group(&'a ContainerGroup),
}

/// Cleans up its target when dropped, unless [`CleanupGuard::finish`] already
/// did. Dropping during a panic still cleans up; errors are only logged then.
///
/// Each container is stopped with its own stop timeout, which
/// [`Container::from_settings`] takes from `stop_timeout_secs`.
pub struct CleanupGuard<'a> {
    target: Target<'a>,
    armed: bool,
}

impl<'a> CleanupGuard<'a> {
    pub fn container(container: &'a Container) -> Self {
        Self {
            target: Target::Container(container),
            armed: true,
        }
    }

    pub fn group(group: &'a ContainerGroup) -> Self {
        Self {
            target: Target::Group(group),
            armed: true,
        }
    }

    /// Clean up now and report the outcome.
    pub fn finish(mut self) -> Result<()> {
        self.armed = false;
        self.cleanup()
    }

    fn cleanup(&self) -> Result<()> {
        match self.target {
            Target::Container(c) => {
                cleanup_container(c).with_context(|| format!("cleaning up {}", c.name()))
            }
            Target::Group(g) => g.cleanup().context("cleaning up group"),
        }
    }
}

impl Drop for CleanupGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if std::thread::panicking() {
            debug!("cleaning up after panic");
        }
        if let Err(e) = self.cleanup() {
            warn!(error = %format!("{e:#}"), "cleanup failed");
        }
    }
}

/// Start `container`, wait until it is ready, run `body`, then clean up.
pub fn run_with_container<T, F>(container: &Container, body: F) -> Result<T>
where
    F: FnOnce(&Container) -> Result<T>,
{
    let guard = CleanupGuard::container(container);
    container
        .start()
        .map_err(|e| with_logs(container, e.into()))?;
    container
        .await_is_ready()
        .map_err(|e| with_logs(container, e.into()))?;

    let value = body(container)?;
    guard.finish()?;
    Ok(value)
}

/// Start every node of `group`, wait up to `timeout` for all of them, run
/// `body`, then clean up. Node failures are reported with their logs.
pub fn run_with_group<T, F>(group: &ContainerGroup, timeout: Duration, body: F) -> Result<T>
where
    F: FnOnce(&ContainerGroup) -> Result<T>,
{
    let guard = CleanupGuard::group(group);
    group.start()?;
    if let Err(e) = group.await_timeout(timeout) {
        let failures = group.failures();
        let err = anyhow::Error::from(e).context(format!("pending: {}", group.pending().join(", ")));
        return Err(if failures.is_empty() {
            err
        } else {
            err.context(describe_failures(&failures))
        });
    }

    let value = body(group)?;
    guard.finish()?;
    Ok(value)
}

fn with_logs(container: &Container, err: anyhow::Error) -> anyhow::Error {
    match container.logs() {
        Ok(logs) if !logs.trim().is_empty() => {
            err.context(format!("{} failed to start; logs:\n{}", container.name(), logs.trim_end()))
        }
        _ => err.context(format!("{} failed to start", container.name())),
    }
}

/// One paragraph per failed node, logs indented below the error.
pub fn describe_failures(failures: &[NodeFailure]) -> String {
    let mut out = String::new();
    for f in failures {
        out.push_str(&format!("{}: {}\n", f.name, f.error));
        for line in f.logs.lines() {
            out.push_str("    ");
            out.push_str(line);
            out.push('\n');
        }
    }
    out.trim_end().to_string()
}
