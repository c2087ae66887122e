use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::types::{
    ContainerPort, HostPort, LifecycleState, PortBinding, PropertyMap, VolumeMount,
    sanitize_prefix,
};
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::probe::{IsRunning, ReadinessCheck};
use crate::random;
use crate::runtime::{ContainerRuntime, ContainerStatus, CreateOptions, ExecOutput};
use crate::wait::Poller;

const DEFAULT_MAX_START_TIME: Duration = Duration::from_secs(30);
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Default)]
struct Instance {
    id: Option<String>,
    ip_address: Option<String>,
    state: LifecycleState,
    /// Set by cleanup; a start still in flight discards what it creates.
    abandoned: bool,
}

/// One container: its configuration, and once started, its runtime identity.
///
/// Configuration is done through `&mut self` setters before the container is
/// shared; lifecycle operations take `&self` so a started container can be
/// observed from several threads.
pub struct Container {
    runtime: Arc<dyn ContainerRuntime>,
    props: PropertyMap,
    image: String,
    name: OnceLock<String>,
    name_prefix: String,
    app_port: Option<ContainerPort>,
    exposed_ports: BTreeSet<ContainerPort>,
    port_bindings: BTreeMap<ContainerPort, PortBinding>,
    mounts: Vec<VolumeMount>,
    env: Vec<(String, String)>,
    cmd: Vec<String>,
    tty: bool,
    user: Option<String>,
    pull_first: bool,
    max_start_time: Duration,
    stop_timeout: Duration,
    poller: Poller,
    stop_after_test: bool,
    remove_after_test: bool,
    readiness: Arc<dyn ReadinessCheck>,
    instance: Mutex<Instance>,
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("name", &self.name.get())
            .field("image", &self.image)
            .field("app_port", &self.app_port)
            .field("instance", &*self.lock())
            .finish_non_exhaustive()
    }
}

impl Container {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            props: PropertyMap::new(),
            image: String::new(),
            name: OnceLock::new(),
            name_prefix: String::new(),
            app_port: None,
            exposed_ports: BTreeSet::new(),
            port_bindings: BTreeMap::new(),
            mounts: Vec::new(),
            env: Vec::new(),
            cmd: Vec::new(),
            tty: true,
            user: None,
            pull_first: false,
            max_start_time: DEFAULT_MAX_START_TIME,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            poller: Poller::default(),
            stop_after_test: true,
            remove_after_test: true,
            readiness: Arc::new(IsRunning),
            instance: Mutex::new(Instance::default()),
        }
    }

    /// A container carrying the timing and cleanup defaults from `settings`.
    pub fn from_settings(runtime: Arc<dyn ContainerRuntime>, settings: &Settings) -> Self {
        let mut c = Self::new(runtime);
        c.max_start_time = settings.max_start_time();
        c.stop_timeout = settings.stop_timeout();
        c.poller = Poller::new(settings.poll_interval());
        c.stop_after_test = settings.stop_after_test;
        c.remove_after_test = settings.remove_after_test;
        c.pull_first = settings.pull;
        c
    }

    /// Build a container and hand it to `configure` before returning it.
    pub fn configured<F>(runtime: Arc<dyn ContainerRuntime>, configure: F) -> Result<Self>
    where
        F: FnOnce(&mut Container) -> Result<()>,
    {
        let mut c = Self::new(runtime);
        configure(&mut c)?;
        Ok(c)
    }

    fn lock(&self) -> MutexGuard<'_, Instance> {
        self.instance.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── configuration ────────────────────────────────────────────────

    /// Set the image; it also becomes the name prefix.
    pub fn with_image(&mut self, image: impl Into<String>) -> &mut Self {
        self.image = image.into();
        self.name_prefix = self.image.clone();
        self
    }

    pub fn set_name(&mut self, name: impl Into<String>) -> &mut Self {
        self.name = OnceLock::from(name.into());
        self
    }

    pub fn set_name_prefix(&mut self, prefix: impl Into<String>) -> &mut Self {
        self.name_prefix = prefix.into();
        self
    }

    /// Make `port` the main port, published on a random host port.
    pub fn set_app_port(&mut self, port: impl Into<ContainerPort>) -> Result<&mut Self> {
        self.set_port(port, HostPort::Auto)
    }

    /// Make `port` the main port, published on `host`. The main port is the
    /// one TCP readiness checks and connection helpers use.
    pub fn set_port(&mut self, port: impl Into<ContainerPort>, host: HostPort) -> Result<&mut Self> {
        let port = port.into();
        self.app_port = Some(port.clone());
        self.add_port_map(host, port.clone())?;
        Ok(self.add_exposed_port(port))
    }

    pub fn map_to_random_host_port(&mut self, port: impl Into<ContainerPort>) -> Result<&mut Self> {
        let port = port.into();
        self.add_port_map(HostPort::Auto, port.clone())?;
        Ok(self.add_exposed_port(port))
    }

    /// Publish `port` on the host. `HostPort::Auto` is resolved here.
    pub fn add_port_map(&mut self, host: HostPort, port: impl Into<ContainerPort>) -> Result<&mut Self> {
        let port = port.into();
        let host_port = host.resolve()?;
        self.port_bindings.insert(
            port.clone(),
            PortBinding {
                container: port,
                host_ip: "0.0.0.0".to_string(),
                host_port,
            },
        );
        Ok(self)
    }

    pub fn add_exposed_port(&mut self, port: impl Into<ContainerPort>) -> &mut Self {
        self.exposed_ports.insert(port.into());
        self
    }

    pub fn add_path_map(&mut self, host: impl AsRef<Path>, container: impl Into<String>) -> Result<&mut Self> {
        self.mounts.push(VolumeMount::new(host, container)?);
        Ok(self)
    }

    /// Set an environment variable, replacing an earlier value for the key.
    pub fn add_env(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let key = key.into();
        let value = value.into();
        match self.env.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.env.push((key, value)),
        }
        self
    }

    pub fn add_all_env<K, V>(&mut self, vars: impl IntoIterator<Item = (K, V)>) -> &mut Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in vars {
            self.add_env(k, v);
        }
        self
    }

    pub fn with_cmd<S: Into<String>>(&mut self, cmd: impl IntoIterator<Item = S>) -> &mut Self {
        self.cmd = cmd.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_tty(&mut self, tty: bool) -> &mut Self {
        self.tty = tty;
        self
    }

    /// Run the container as the invoking user, so bind-mounted output is
    /// theirs. No-op where that has no meaning.
    pub fn as_invoking_user(&mut self) -> &mut Self {
        self.user = crate::runtime::invoking_user();
        self
    }

    pub fn with_pull(&mut self, pull: bool) -> &mut Self {
        self.pull_first = pull;
        self
    }

    pub fn with_max_start_time(&mut self, timeout: Duration) -> &mut Self {
        self.max_start_time = timeout;
        self
    }

    /// How long cleanup waits for the container to exit after stopping it.
    pub fn with_stop_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn with_poll_interval(&mut self, interval: Duration) -> &mut Self {
        self.poller = Poller::new(interval);
        self
    }

    /// Replace the readiness strategy (default: [`IsRunning`]).
    pub fn with_readiness(&mut self, check: impl ReadinessCheck + 'static) -> &mut Self {
        self.readiness = Arc::new(check);
        self
    }

    pub fn set_stop_after_test(&mut self, stop: bool) -> &mut Self {
        self.stop_after_test = stop;
        self
    }

    pub fn set_remove_after_test(&mut self, remove: bool) -> &mut Self {
        self.remove_after_test = remove;
        self
    }

    pub fn props_mut(&mut self) -> &mut PropertyMap {
        &mut self.props
    }

    // ── accessors ────────────────────────────────────────────────────

    /// Display name: explicit, or `<prefix>-<random>` generated on first use.
    pub fn name(&self) -> &str {
        self.name.get_or_init(|| {
            let prefix = if self.name_prefix.is_empty() {
                "cntest"
            } else {
                &self.name_prefix
            };
            format!("{}-{}", sanitize_prefix(prefix), random::name())
        })
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn props(&self) -> &PropertyMap {
        &self.props
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn app_port(&self) -> Option<&ContainerPort> {
        self.app_port.as_ref()
    }

    pub fn host_port(&self, port: &ContainerPort) -> Option<u16> {
        self.port_bindings.get(port).map(|b| b.host_port)
    }

    /// Host port the main port is published on.
    pub fn app_host_port(&self) -> Option<u16> {
        self.app_port.as_ref().and_then(|p| self.host_port(p))
    }

    pub fn max_start_time(&self) -> Duration {
        self.max_start_time
    }

    pub fn stop_timeout(&self) -> Duration {
        self.stop_timeout
    }

    pub fn stop_after_test(&self) -> bool {
        self.stop_after_test
    }

    pub fn remove_after_test(&self) -> bool {
        self.remove_after_test
    }

    pub fn state(&self) -> LifecycleState {
        self.lock().state
    }

    /// `KEY=value` entries passed to the runtime.
    pub fn env_list(&self) -> Vec<String> {
        self.env.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }

    pub fn create_options(&self) -> CreateOptions {
        CreateOptions {
            name: self.name().to_string(),
            image: self.image.clone(),
            env: self.env_list(),
            cmd: self.cmd.clone(),
            exposed_ports: self.exposed_ports.iter().cloned().collect(),
            port_bindings: self.port_bindings.values().cloned().collect(),
            mounts: self.mounts.clone(),
            tty: self.tty,
            user: self.user.clone(),
        }
    }

    /// Runtime identifier, available once the container has been created.
    pub fn id(&self) -> Result<String> {
        self.lock()
            .id
            .clone()
            .ok_or_else(|| Error::NotStarted(self.name().to_string()))
    }

    /// Identifier of a container that has not been removed.
    fn live_id(&self) -> Result<String> {
        let inst = self.lock();
        if inst.state == LifecycleState::Removed {
            return Err(Error::Removed(self.name().to_string()));
        }
        inst.id
            .clone()
            .ok_or_else(|| Error::NotStarted(self.name().to_string()))
    }

    fn mark(&self, state: LifecycleState) {
        let mut inst = self.lock();
        if inst.state != LifecycleState::Removed && inst.state != state {
            debug!(container = %self.name(), from = inst.state.as_str(), to = state.as_str(), "state change");
            inst.state = state;
        }
    }

    // ── lifecycle ────────────────────────────────────────────────────

    /// Create and start the container, caching its address.
    pub fn start(&self) -> Result<String> {
        let name = self.name().to_string();
        if self.image.is_empty() {
            return Err(Error::config(format!("container {name} has no image")));
        }
        {
            let mut inst = self.lock();
            if inst.abandoned {
                return Err(Error::Removed(name));
            }
            match inst.state {
                LifecycleState::Unstarted => inst.state = LifecycleState::Starting,
                LifecycleState::Removed => return Err(Error::Removed(name)),
                _ => return Err(Error::AlreadyStarted(name)),
            }
        }

        if self.pull_first {
            self.runtime.pull(&self.image)?;
        }
        if self.is_abandoned() {
            self.lock().state = LifecycleState::Removed;
            return Err(Error::Removed(name));
        }
        let created = self.runtime.create(&self.create_options())?;
        for warning in &created.warnings {
            warn!(container = %name, "{warning}");
        }
        // Recorded before starting so a failed start can still be removed.
        let abandoned = {
            let mut inst = self.lock();
            inst.id = Some(created.id.clone());
            inst.abandoned
        };
        if abandoned {
            info!(container = %name, id = %created.id, "cleaned up while creating, discarding");
            self.remove()?;
            return Err(Error::Removed(name));
        }

        self.runtime.start(&created.id)?;
        let inspected = self.runtime.inspect(&created.id)?;
        {
            let mut inst = self.lock();
            inst.ip_address = Some(inspected.ip_address);
            inst.state = if inspected.status.is_exited() {
                LifecycleState::Exited
            } else {
                LifecycleState::Running
            };
        }

        info!(container = %name, id = %created.id, "container is starting");
        Ok(created.id)
    }

    pub fn ip_address(&self) -> Result<String> {
        {
            let inst = self.lock();
            if inst.state < LifecycleState::Running {
                return Err(Error::NotStarted(self.name().to_string()));
            }
            if let Some(ip) = &inst.ip_address {
                return Ok(ip.clone());
            }
        }
        let ip = self.runtime.inspect(&self.live_id()?)?.ip_address;
        self.lock().ip_address = Some(ip.clone());
        Ok(ip)
    }

    /// True while the process runs. An exited process is reported as
    /// [`Error::AlreadyExited`] since it will never become ready.
    pub fn is_running(&self) -> Result<bool> {
        let info = self.runtime.inspect(&self.live_id()?)?;
        match info.status {
            ContainerStatus::Running => Ok(true),
            status if status.is_exited() => {
                self.mark(LifecycleState::Exited);
                Err(Error::AlreadyExited(self.name().to_string()))
            }
            status => {
                debug!(container = %self.name(), ?status, "not running yet");
                Ok(false)
            }
        }
    }

    pub fn is_exited(&self) -> Result<bool> {
        let info = self.runtime.inspect(&self.live_id()?)?;
        let exited = info.status.is_exited();
        if exited {
            self.mark(LifecycleState::Exited);
        }
        Ok(exited)
    }

    /// Poll the readiness strategy for up to the configured start time.
    pub fn await_is_ready(&self) -> Result<bool> {
        let ready = self
            .poller
            .poll(self.max_start_time, || self.readiness.is_ready(self))?;
        if ready {
            let mut inst = self.lock();
            if inst.state == LifecycleState::Running {
                inst.state = LifecycleState::Ready;
            }
        }
        Ok(ready)
    }

    pub fn await_exit(&self, timeout: Duration) -> Result<bool> {
        self.poller.poll(timeout, || self.is_exited())
    }

    /// Ask the container to stop; with a non-zero timeout also wait for it
    /// to exit. A container the runtime no longer knows counts as stopped.
    pub fn stop(&self, timeout: Duration) -> Result<bool> {
        let id = self.live_id()?;
        match self.runtime.stop(&id) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(container = %self.name(), "already gone, nothing to stop");
                self.mark(LifecycleState::Exited);
                return Ok(true);
            }
            Err(e) => return Err(e),
        }
        let exited = if timeout.is_zero() {
            true
        } else {
            self.await_exit(timeout)?
        };
        self.mark(LifecycleState::Exited);
        Ok(exited)
    }

    /// Mark the container as given up on. A [`Container::start`] that is
    /// still creating removes the new container instead of starting it, and
    /// later starts fail with [`Error::Removed`].
    pub fn abandon(&self) {
        self.lock().abandoned = true;
    }

    pub fn is_abandoned(&self) -> bool {
        self.lock().abandoned
    }

    /// Force-remove the container. Removing twice, or removing something the
    /// runtime already forgot, is fine.
    pub fn remove(&self) -> Result<()> {
        let id = {
            let inst = self.lock();
            if inst.state == LifecycleState::Removed {
                return Ok(());
            }
            inst.id.clone()
        };
        if let Some(id) = id {
            match self.runtime.remove(&id) {
                Ok(()) => info!(container = %self.name(), id = %id, "container removed"),
                Err(e) if e.is_not_found() => {
                    debug!(container = %self.name(), "already gone, nothing to remove");
                }
                Err(e) => return Err(e),
            }
        }
        self.lock().state = LifecycleState::Removed;
        Ok(())
    }

    /// Everything the container has logged so far.
    pub fn logs(&self) -> Result<String> {
        let mut reader = self.runtime.logs(&self.id()?)?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Run `argv` inside the container.
    pub fn run_cmd<S: AsRef<str>>(&self, argv: &[S]) -> Result<ExecOutput> {
        let argv: Vec<String> = argv.iter().map(|s| s.as_ref().to_string()).collect();
        self.runtime.exec(&self.live_id()?, &argv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{EventKind, ImageBehavior, MemoryRuntime};

    fn runtime() -> Arc<MemoryRuntime> {
        Arc::new(
            MemoryRuntime::new()
                .with_image("nginx", ImageBehavior::logging("start worker processes\n"))
                .with_image(
                    "hello-world",
                    ImageBehavior {
                        exits_on_start: true,
                        ..ImageBehavior::logging("Hello from Docker!\n")
                    },
                ),
        )
    }

    fn nginx(rt: &Arc<MemoryRuntime>) -> Container {
        let mut c = Container::new(rt.clone());
        c.with_image("nginx").with_poll_interval(Duration::from_millis(5));
        c
    }

    #[test]
    fn generated_name_is_stable() {
        let rt = runtime();
        let c = nginx(&rt);
        let first = c.name().to_string();
        assert!(first.starts_with("nginx-"));
        assert_eq!(c.name(), first);
    }

    #[test]
    fn explicit_name_wins() {
        let rt = runtime();
        let mut c = nginx(&rt);
        c.set_name("web");
        assert_eq!(c.name(), "web");
    }

    #[test]
    fn identity_only_after_start() {
        let rt = runtime();
        let c = nginx(&rt);
        assert!(matches!(c.id(), Err(Error::NotStarted(_))));
        assert!(matches!(c.ip_address(), Err(Error::NotStarted(_))));

        let id = c.start().unwrap();
        assert_eq!(c.id().unwrap(), id);
        assert!(c.ip_address().unwrap().starts_with("172.17.0."));
        assert_eq!(c.state(), LifecycleState::Running);
    }

    #[test]
    fn start_twice_is_rejected() {
        let rt = runtime();
        let c = nginx(&rt);
        c.start().unwrap();
        assert!(matches!(c.start(), Err(Error::AlreadyStarted(_))));
    }

    #[test]
    fn missing_image_is_a_config_error() {
        let c = Container::new(runtime());
        assert!(matches!(c.start(), Err(Error::Config(_))));
    }

    #[test]
    fn default_readiness_is_running() {
        let rt = runtime();
        let c = nginx(&rt);
        c.start().unwrap();
        assert!(c.await_is_ready().unwrap());
        assert_eq!(c.state(), LifecycleState::Ready);
    }

    #[test]
    fn exited_container_fails_readiness_immediately() {
        let rt = runtime();
        let mut c = Container::new(rt.clone());
        c.with_image("hello-world")
            .with_poll_interval(Duration::from_millis(5))
            .with_max_start_time(Duration::from_secs(5));
        c.start().unwrap();
        assert!(matches!(c.await_is_ready(), Err(Error::AlreadyExited(_))));
        assert!(c.await_exit(Duration::from_secs(1)).unwrap());
        assert_eq!(c.logs().unwrap(), "Hello from Docker!\n");
    }

    #[test]
    fn stop_and_remove_are_idempotent() {
        let rt = runtime();
        let c = nginx(&rt);
        let id = c.start().unwrap();
        assert!(c.stop(Duration::from_secs(1)).unwrap());
        assert!(c.stop(Duration::ZERO).unwrap());
        c.remove().unwrap();
        c.remove().unwrap();
        assert_eq!(c.state(), LifecycleState::Removed);
        assert!(matches!(rt.inspect(&id), Err(Error::NotFound(_))));
        assert!(matches!(c.start(), Err(Error::Removed(_))));
        assert!(matches!(c.is_running(), Err(Error::Removed(_))));
    }

    #[test]
    fn stop_tolerates_vanished_container() {
        let rt = runtime();
        let c = nginx(&rt);
        let id = c.start().unwrap();
        rt.remove(&id).unwrap();
        assert!(c.stop(Duration::from_secs(1)).unwrap());
        c.remove().unwrap();
    }

    #[test]
    fn abandoned_while_creating_is_removed_not_started() {
        let rt = Arc::new(MemoryRuntime::new().with_image(
            "slow",
            ImageBehavior {
                create_delay: Duration::from_millis(100),
                ..ImageBehavior::default()
            },
        ));
        let mut c = Container::new(rt.clone());
        c.with_image("slow").set_name("slow");
        let c = Arc::new(c);

        let starter = {
            let c = Arc::clone(&c);
            std::thread::spawn(move || c.start())
        };
        std::thread::sleep(Duration::from_millis(20));
        c.abandon();

        assert!(matches!(starter.join().unwrap(), Err(Error::Removed(_))));
        assert_eq!(c.state(), LifecycleState::Removed);
        assert_eq!(rt.live_count(), 0);
        assert!(rt.first(EventKind::Start, "slow").is_none());
        assert!(matches!(c.start(), Err(Error::Removed(_))));
    }

    #[test]
    fn settings_carry_timing_and_policy() {
        let settings = Settings {
            max_start_time_secs: 7,
            stop_timeout_secs: 3,
            remove_after_test: false,
            ..Settings::default()
        };
        let c = Container::from_settings(runtime(), &settings);
        assert_eq!(c.max_start_time(), Duration::from_secs(7));
        assert_eq!(c.stop_timeout(), Duration::from_secs(3));
        assert!(!c.remove_after_test());
        assert_eq!(Container::new(runtime()).stop_timeout(), DEFAULT_STOP_TIMEOUT);
    }

    #[test]
    fn env_entries_replace_by_key() {
        let rt = runtime();
        let mut c = nginx(&rt);
        c.add_env("A", "1").add_env("B", "2").add_env("A", "3");
        assert_eq!(c.env_list(), vec!["A=3", "B=2"]);
    }

    #[test]
    fn app_port_is_exposed_and_published() {
        let rt = runtime();
        let mut c = nginx(&rt);
        c.set_app_port(80).unwrap();
        let opts = c.create_options();
        assert_eq!(opts.exposed_ports, vec![ContainerPort::tcp(80)]);
        assert_eq!(opts.port_bindings.len(), 1);
        assert_eq!(Some(opts.port_bindings[0].host_port), c.app_host_port());
    }

    #[test]
    fn run_cmd_goes_through_the_runtime() {
        let rt = runtime();
        let c = nginx(&rt);
        assert!(matches!(c.run_cmd(&["ls"]), Err(Error::NotStarted(_))));
        c.start().unwrap();
        let out = c.run_cmd(&["nginx", "-t"]).unwrap();
        assert!(out.success());
        assert_eq!(out.output, "nginx -t");
    }
}
