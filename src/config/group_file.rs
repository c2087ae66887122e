//! YAML description of a container group.
//!
//! ```yaml
//! containers:
//!   - name: db
//!     preset: postgres
//!     props: { db: orders, initdb_path: ./schema }
//!   - name: api
//!     image: ghcr.io/acme/orders-api:1.4
//!     ports: ["8080", "9090:9090"]
//!     env: { DATABASE_HOST: db }
//!     depends_on: [db]
//!     wait_for: { log: "listening on", tcp: true }
//! ```
//!
//! The first entry in `ports` is the main port. `"8080"` publishes on a
//! random host port, `"9090:9090"` on a fixed one.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::types::Settings;
use crate::container::{Container, ContainerPort, HostPort, PropertyMap};
use crate::error::{Error, Result};
use crate::group::{ContainerGroup, DependencyGraph, GroupedContainer};
use crate::presets;
use crate::probe::{AllOf, ExecSucceeds, IsRunning, LogMatch, TcpConnect};
use crate::runtime::ContainerRuntime;

pub const DEFAULT_GROUP_FILE: &str = "cntest-group.yaml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupFile {
    pub containers: Vec<ContainerSpec>,
    /// Directory relative volume paths resolve against.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    Postgres,
    Mysql,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContainerSpec {
    pub name: String,
    pub preset: Option<Preset>,
    pub image: Option<String>,
    pub ports: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// `host:container` bind mounts.
    pub volumes: Vec<String>,
    pub cmd: Vec<String>,
    pub depends_on: Vec<String>,
    pub props: PropertyMap,
    pub wait_for: Option<WaitFor>,
    pub max_start_time_secs: Option<u64>,
    pub stop_timeout_secs: Option<u64>,
    pub stop_after_test: Option<bool>,
    pub remove_after_test: Option<bool>,
}

/// Readiness conditions, all of which must hold. Running is always implied.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WaitFor {
    pub log: Option<String>,
    pub log_times: Option<usize>,
    pub tcp: bool,
    pub exec: Option<String>,
}

/// Split `"8080"` or `"9090:80/udp"` into host and container sides.
pub fn parse_port_spec(spec: &str) -> Result<(HostPort, ContainerPort)> {
    match spec.split_once(':') {
        None => Ok((HostPort::Auto, ContainerPort::parse(spec)?)),
        Some((host, container)) => {
            let host = host
                .trim()
                .parse::<u16>()
                .map_err(|_| Error::config(format!("invalid host port in {spec:?}")))?;
            Ok((HostPort::Fixed(host), ContainerPort::parse(container)?))
        }
    }
}

impl GroupFile {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {e}", path.display())))?;
        let mut file = Self::parse(&contents)?;
        file.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok(file)
    }

    pub fn parse(yaml: &str) -> Result<Self> {
        let file: GroupFile = serde_yaml::from_str(yaml)?;
        Ok(file)
    }

    /// Names must be present and unique, dependencies must exist, and the
    /// graph must be acyclic. Returns the startup order.
    pub fn validate(&self) -> Result<Vec<String>> {
        let mut seen = HashSet::new();
        for spec in &self.containers {
            if spec.name.is_empty() {
                return Err(Error::config("every container needs a name"));
            }
            if !seen.insert(spec.name.as_str()) {
                return Err(Error::DuplicateName(spec.name.clone()));
            }
            if spec.preset.is_none() && spec.image.is_none() {
                return Err(Error::config(format!("{} needs an image or a preset", spec.name)));
            }
        }
        for spec in &self.containers {
            if let Some(missing) = spec.depends_on.iter().find(|d| !seen.contains(d.as_str())) {
                return Err(Error::config(format!(
                    "{} depends on unknown container {missing}",
                    spec.name
                )));
            }
        }
        DependencyGraph::from_edges(
            self.containers
                .iter()
                .map(|s| (s.name.as_str(), s.depends_on.iter().map(String::as_str))),
        )
        .startup_order()
    }

    /// Build every container and wire up the dependencies.
    pub fn build(&self, runtime: Arc<dyn ContainerRuntime>, settings: &Settings) -> Result<ContainerGroup> {
        let order = self.validate()?;
        let specs: HashMap<&str, &ContainerSpec> = self
            .containers
            .iter()
            .map(|s| (s.name.as_str(), s))
            .collect();

        let mut built: HashMap<String, GroupedContainer> = HashMap::new();
        for name in &order {
            let Some(spec) = specs.get(name.as_str()) else {
                continue;
            };
            let container = self.build_container(spec, Arc::clone(&runtime), settings)?;
            let mut node = GroupedContainer::new(container);
            let deps: Vec<&GroupedContainer> = spec
                .depends_on
                .iter()
                .filter_map(|d| built.get(d))
                .collect();
            node.depends_on(&deps);
            built.insert(name.clone(), node);
        }

        let mut group = ContainerGroup::new();
        for name in order {
            if let Some(node) = built.remove(&name) {
                group.add(node)?;
            }
        }
        Ok(group)
    }

    fn build_container(
        &self,
        spec: &ContainerSpec,
        runtime: Arc<dyn ContainerRuntime>,
        settings: &Settings,
    ) -> Result<Container> {
        let mut c = Container::from_settings(runtime, settings);
        let mut props = spec.props.clone();
        if let Some(path) = props.get("initdb_path").map(|p| self.resolve(p)) {
            props.insert("initdb_path", path.display().to_string());
        }
        match spec.preset {
            Some(Preset::Postgres) => presets::postgres::configure(props)(&mut c)?,
            Some(Preset::Mysql) => presets::mysql::configure(props)(&mut c)?,
            None => c.props_mut().set_all(&props),
        }
        if let Some(image) = &spec.image {
            c.with_image(image.as_str());
        }
        c.set_name(spec.name.as_str());

        for (i, port) in spec.ports.iter().enumerate() {
            let (host, container_port) = parse_port_spec(port)?;
            if i == 0 {
                c.set_port(container_port, host)?;
            } else {
                c.add_port_map(host, container_port.clone())?;
                c.add_exposed_port(container_port);
            }
        }
        c.add_all_env(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        for volume in &spec.volumes {
            let (host, target) = volume
                .split_once(':')
                .ok_or_else(|| Error::config(format!("volume {volume:?} is not host:container")))?;
            c.add_path_map(self.resolve(host), target)?;
        }
        if !spec.cmd.is_empty() {
            c.with_cmd(spec.cmd.iter().map(String::as_str));
        }
        if let Some(secs) = spec.max_start_time_secs {
            c.with_max_start_time(Duration::from_secs(secs));
        }
        if let Some(secs) = spec.stop_timeout_secs {
            c.with_stop_timeout(Duration::from_secs(secs));
        }
        if let Some(stop) = spec.stop_after_test {
            c.set_stop_after_test(stop);
        }
        if let Some(remove) = spec.remove_after_test {
            c.set_remove_after_test(remove);
        }
        if let Some(wait) = &spec.wait_for {
            c.with_readiness(wait.to_check()?);
        }
        Ok(c)
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }
}

impl WaitFor {
    pub fn to_check(&self) -> Result<AllOf> {
        let mut check = AllOf::new().and(IsRunning);
        if let Some(pattern) = &self.log {
            check = check.and(LogMatch::new(pattern)?.times(self.log_times.unwrap_or(1)));
        }
        if let Some(command) = &self.exec {
            check = check.and(ExecSucceeds::parse(command)?);
        }
        if self.tcp {
            check = check.and(TcpConnect::app_port());
        }
        Ok(check)
    }
}
