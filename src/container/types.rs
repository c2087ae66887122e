use std::collections::BTreeMap;
use std::fmt;
use std::net::TcpListener;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A port inside the container, always carrying its protocol (`5432/tcp`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContainerPort {
    port: u16,
    proto: Proto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Proto {
    Tcp,
    Udp,
}

impl ContainerPort {
    pub fn tcp(port: u16) -> Self {
        Self {
            port,
            proto: Proto::Tcp,
        }
    }

    /// Parse `"5432"`, `"5432/tcp"` or `"53/udp"`.
    pub fn parse(spec: &str) -> Result<Self> {
        let (num, proto) = match spec.trim().split_once('/') {
            Some((num, "tcp")) => (num, Proto::Tcp),
            Some((num, "udp")) => (num, Proto::Udp),
            Some((_, other)) => {
                return Err(Error::config(format!(
                    "unsupported protocol {other:?} in port {spec:?}"
                )));
            }
            None => (spec.trim(), Proto::Tcp),
        };
        let port = num
            .parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| Error::config(format!("invalid container port {spec:?}")))?;
        Ok(Self { port, proto })
    }

    pub fn number(&self) -> u16 {
        self.port
    }

    pub fn proto(&self) -> Proto {
        self.proto
    }
}

impl From<u16> for ContainerPort {
    fn from(port: u16) -> Self {
        Self::tcp(port)
    }
}

impl fmt::Display for ContainerPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proto = match self.proto {
            Proto::Tcp => "tcp",
            Proto::Udp => "udp",
        };
        write!(f, "{}/{proto}", self.port)
    }
}

/// Requested host side of a port binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostPort {
    /// Pick a free ephemeral port when the binding is added.
    Auto,
    Fixed(u16),
}

impl HostPort {
    /// Resolve to a concrete port number.
    ///
    /// `Auto` asks the OS for an ephemeral port by binding port 0 and
    /// releasing the listener straight away.
    pub fn resolve(self) -> Result<u16> {
        match self {
            Self::Fixed(port) => Ok(port),
            Self::Auto => {
                let listener = TcpListener::bind(("0.0.0.0", 0))?;
                Ok(listener.local_addr()?.port())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBinding {
    pub container: ContainerPort,
    pub host_ip: String,
    pub host_port: u16,
}

impl PortBinding {
    /// `docker -p` form: `0.0.0.0:49153:5432/tcp`.
    pub fn to_publish_arg(&self) -> String {
        format!("{}:{}:{}", self.host_ip, self.host_port, self.container)
    }
}

/// Bind mount from a host directory into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub host: PathBuf,
    pub container: String,
}

impl VolumeMount {
    /// The host path is made absolute against the current directory.
    pub fn new(host: impl AsRef<Path>, container: impl Into<String>) -> Result<Self> {
        let host = std::path::absolute(host.as_ref())?;
        Ok(Self {
            host,
            container: container.into(),
        })
    }

    pub fn to_mount_arg(&self) -> String {
        format!(
            "type=bind,source={},target={}",
            self.host.display(),
            self.container
        )
    }
}

/// Free-form metadata attached to a container, e.g. the credentials of a
/// database container. Not passed to the container environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertyMap(BTreeMap<String, String>);

impl PropertyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn get_or_default(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn set_if_missing(&mut self, key: &str, value: impl Into<String>) {
        self.0.entry(key.to_string()).or_insert_with(|| value.into());
    }

    pub fn set_all(&mut self, other: &PropertyMap) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for PropertyMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Host-side state of a container handle.
///
/// `Unstarted -> Starting -> Running -> {Ready | Exited}`; `Running` may go
/// straight to `Exited` on a crash, and `Removed` is terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecycleState {
    #[default]
    Unstarted,
    Starting,
    Running,
    Ready,
    Exited,
    Removed,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unstarted => "unstarted",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Ready => "ready",
            Self::Exited => "exited",
            Self::Removed => "removed",
        }
    }
}

/// Make an image reference usable as a container name prefix.
pub(crate) fn sanitize_prefix(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches(|c: char| !c.is_ascii_alphanumeric());
    if trimmed.is_empty() {
        "cntest".to_string()
    } else {
        trimmed.to_string()
    }
}
