use std::io::Cursor;
use std::process::{Command, Output, Stdio};

use serde::Deserialize;
use tracing::{debug, warn};

use super::{ContainerInfo, ContainerRuntime, ContainerStatus, CreateOptions, Created, ExecOutput};
use crate::error::{Error, Result};

/// Verify that the Docker daemon behind `binary` is reachable.
pub fn ensure_available(binary: &str) -> Result<()> {
    let status = Command::new(binary)
        .args(["version", "--format", "{{.Server.Version}}"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|e| {
            Error::runtime(
                "docker version",
                format!("failed to invoke `{binary}` ({e}); is it installed and on PATH?"),
            )
        })?;

    if !status.success() {
        return Err(Error::runtime(
            "docker version",
            format!("docker daemon is not running ({status})"),
        ));
    }
    Ok(())
}

/// `uid:gid` of the invoking user on Unix, so bind-mounted files stay
/// owned by them. `None` elsewhere.
pub fn invoking_user() -> Option<String> {
    #[cfg(unix)]
    {
        // SAFETY: geteuid() and getegid() are simple POSIX getters that always succeed and have no side effects.
        let uid = unsafe { libc::geteuid() };
        let gid = unsafe { libc::getegid() };
        Some(format!("{uid}:{gid}"))
    }

    #[cfg(not(unix))]
    {
        None
    }
}

/// Talks to the engine by shelling out to the `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }
}

impl DockerCli {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    fn output(&self, op: &'static str, args: &[String]) -> Result<Output> {
        debug!(binary = %self.binary, ?args, "invoking docker");
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| Error::runtime(op, format!("failed to spawn {}: {e}", self.binary)))
    }

    /// Run a docker subcommand, returning stdout on success.
    fn run(&self, op: &'static str, target: &str, args: &[String]) -> Result<String> {
        let out = self.output(op, args)?;
        if out.status.success() {
            return Ok(String::from_utf8_lossy(&out.stdout).into_owned());
        }
        Err(classify(op, target, &String::from_utf8_lossy(&out.stderr)))
    }
}

/// Map docker's stderr onto the error taxonomy.
fn classify(op: &'static str, target: &str, stderr: &str) -> Error {
    let stderr = stderr.trim();
    if stderr.contains("No such container") || stderr.contains("No such object") {
        Error::NotFound(target.to_string())
    } else if stderr.contains("is not running") {
        Error::AlreadyExited(target.to_string())
    } else {
        Error::runtime(op, stderr)
    }
}

fn create_args(options: &CreateOptions) -> Vec<String> {
    let mut args = vec!["create".to_string(), "--name".to_string(), options.name.clone()];
    if options.tty {
        args.push("--tty".into());
    }
    if let Some(user) = &options.user {
        args.extend(["--user".into(), user.clone()]);
    }
    for entry in &options.env {
        args.extend(["--env".into(), entry.clone()]);
    }
    for port in &options.exposed_ports {
        args.extend(["--expose".into(), port.to_string()]);
    }
    for binding in &options.port_bindings {
        args.extend(["--publish".into(), binding.to_publish_arg()]);
    }
    for mount in &options.mounts {
        args.extend(["--mount".into(), mount.to_mount_arg()]);
    }
    args.push(options.image.clone());
    args.extend(options.cmd.iter().cloned());
    args
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectRecord {
    id: String,
    name: String,
    state: InspectState,
    #[serde(default)]
    network_settings: Option<InspectNetwork>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    status: String,
    #[serde(default)]
    exit_code: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectNetwork {
    #[serde(default, rename = "IPAddress")]
    ip_address: String,
}

fn parse_inspect(target: &str, json: &str) -> Result<ContainerInfo> {
    let records: Vec<InspectRecord> = serde_json::from_str(json)?;
    let record = records
        .into_iter()
        .next()
        .ok_or_else(|| Error::NotFound(target.to_string()))?;
    Ok(ContainerInfo {
        id: record.id,
        name: record.name.trim_start_matches('/').to_string(),
        status: ContainerStatus::parse(&record.state.status),
        ip_address: record
            .network_settings
            .map(|n| n.ip_address)
            .unwrap_or_default(),
        exit_code: record.state.exit_code,
    })
}

impl ContainerRuntime for DockerCli {
    fn pull(&self, reference: &str) -> Result<()> {
        let out = self.run("docker pull", reference, &["pull".into(), reference.into()])?;
        for line in out.lines() {
            debug!(image = reference, "{line}");
        }
        Ok(())
    }

    fn create(&self, options: &CreateOptions) -> Result<Created> {
        let out = self.output("docker create", &create_args(options))?;
        let stderr = String::from_utf8_lossy(&out.stderr);
        if !out.status.success() {
            return Err(classify("docker create", &options.name, &stderr));
        }
        let id = String::from_utf8_lossy(&out.stdout).trim().to_string();
        let warnings = stderr
            .lines()
            .filter(|l| l.starts_with("WARNING"))
            .map(str::to_string)
            .collect();
        Ok(Created { id, warnings })
    }

    fn start(&self, id: &str) -> Result<()> {
        self.run("docker start", id, &["start".into(), id.into()])
            .map(|_| ())
    }

    fn stop(&self, id: &str) -> Result<()> {
        self.run("docker stop", id, &["stop".into(), id.into()])
            .map(|_| ())
    }

    fn remove(&self, id: &str) -> Result<()> {
        self.run("docker rm", id, &["rm".into(), "--force".into(), id.into()])
            .map(|_| ())
    }

    fn inspect(&self, id: &str) -> Result<ContainerInfo> {
        let json = self.run(
            "docker inspect",
            id,
            &["inspect".into(), "--type".into(), "container".into(), id.into()],
        )?;
        parse_inspect(id, &json)
    }

    fn logs(&self, id: &str) -> Result<Box<dyn std::io::Read + Send>> {
        let out = self.output("docker logs", &["logs".into(), id.into()])?;
        if !out.status.success() {
            return Err(classify("docker logs", id, &String::from_utf8_lossy(&out.stderr)));
        }
        // The CLI splits the container's stdout and stderr; readiness checks
        // want both, so stitch them back together.
        let mut buf = out.stdout;
        buf.extend_from_slice(&out.stderr);
        Ok(Box::new(Cursor::new(buf)))
    }

    fn exec(&self, id: &str, argv: &[String]) -> Result<ExecOutput> {
        let mut args = vec!["exec".to_string(), id.to_string()];
        args.extend(argv.iter().cloned());
        let out = self.output("docker exec", &args)?;
        let stderr = String::from_utf8_lossy(&out.stderr);
        if !out.status.success() && stderr.contains("Error response from daemon") {
            return Err(classify("docker exec", id, &stderr));
        }
        if !out.status.success() {
            warn!(container = id, ?argv, code = ?out.status.code(), "exec exited unsuccessfully");
        }
        let mut output = String::from_utf8_lossy(&out.stdout).into_owned();
        output.push_str(&stderr);
        Ok(ExecOutput {
            exit_code: out.status.code(),
            output,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{ContainerPort, PortBinding, VolumeMount};

    #[test]
    fn ensure_available_does_not_panic() {
        // CI may or may not have Docker.
        let _ = ensure_available("docker");
    }

    #[test]
    fn missing_binary_is_a_runtime_error() {
        let err = ensure_available("definitely-not-a-docker-binary").unwrap_err();
        assert!(matches!(err, Error::Runtime { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn invoking_user_is_uid_gid() {
        let user = invoking_user().unwrap();
        assert!(user.contains(':'));
    }

    #[test]
    fn create_args_carry_the_whole_configuration() {
        let options = CreateOptions {
            name: "postgres-quietmoon1a2b".into(),
            image: "postgres:13".into(),
            env: vec!["POSTGRES_DB=orders".into()],
            cmd: vec!["postgres".into(), "-c".into(), "fsync=off".into()],
            exposed_ports: vec![ContainerPort::tcp(5432)],
            port_bindings: vec![PortBinding {
                container: ContainerPort::tcp(5432),
                host_ip: "0.0.0.0".into(),
                host_port: 49153,
            }],
            mounts: vec![VolumeMount {
                host: "/tmp/schema".into(),
                container: "/docker-entrypoint-initdb.d".into(),
            }],
            tty: true,
            user: None,
        };
        let args = create_args(&options);
        let joined = args.join(" ");
        assert!(joined.starts_with("create --name postgres-quietmoon1a2b --tty"));
        assert!(joined.contains("--env POSTGRES_DB=orders"));
        assert!(joined.contains("--expose 5432/tcp"));
        assert!(joined.contains("--publish 0.0.0.0:49153:5432/tcp"));
        assert!(joined.contains(
            "--mount type=bind,source=/tmp/schema,target=/docker-entrypoint-initdb.d"
        ));
        assert!(joined.ends_with("postgres:13 postgres -c fsync=off"));
    }

    #[test]
    fn stderr_classification() {
        assert!(matches!(
            classify("docker stop", "abc", "Error response from daemon: No such container: abc"),
            Error::NotFound(_)
        ));
        assert!(matches!(
            classify("docker exec", "abc", "Error response from daemon: Container abc is not running"),
            Error::AlreadyExited(_)
        ));
        assert!(matches!(
            classify("docker start", "abc", "port is already allocated"),
            Error::Runtime { .. }
        ));
    }

    #[test]
    fn inspect_json_is_parsed() {
        let json = r#"[{
            "Id": "4f1c",
            "Name": "/postgres-quietmoon",
            "State": {"Status": "running", "ExitCode": 0},
            "NetworkSettings": {"IPAddress": "172.17.0.3"}
        }]"#;
        let info = parse_inspect("4f1c", json).unwrap();
        assert_eq!(info.name, "postgres-quietmoon");
        assert_eq!(info.status, ContainerStatus::Running);
        assert_eq!(info.ip_address, "172.17.0.3");

        assert!(matches!(parse_inspect("x", "[]"), Err(Error::NotFound(_))));
    }
}
