//! Readiness strategies.
//!
//! A [`ReadinessCheck`] answers "is this container usable yet?" once per poll
//! tick. `Ok(false)` means "not yet, ask again"; an error stops the poll, so
//! checks must translate expected transient failures into `Ok(false)`.

use std::io::{BufRead, BufReader, ErrorKind};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use regex::bytes::Regex;
use tracing::debug;

use crate::container::{Container, ContainerPort};
use crate::error::{Error, Result};

pub trait ReadinessCheck: Send + Sync {
    fn is_ready(&self, container: &Container) -> Result<bool>;
}

impl<F> ReadinessCheck for F
where
    F: Fn(&Container) -> Result<bool> + Send + Sync,
{
    fn is_ready(&self, container: &Container) -> Result<bool> {
        self(container)
    }
}

/// Ready as soon as the process runs. Exited processes are a hard failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct IsRunning;

impl ReadinessCheck for IsRunning {
    fn is_ready(&self, container: &Container) -> Result<bool> {
        container.is_running()
    }
}

/// Ready once a TCP connection to the container port succeeds.
///
/// Connects through the published host port when there is one, otherwise
/// straight to the container address.
#[derive(Debug, Clone)]
pub struct TcpConnect {
    port: Option<ContainerPort>,
    connect_timeout: Duration,
}

impl Default for TcpConnect {
    fn default() -> Self {
        Self {
            port: None,
            connect_timeout: Duration::from_secs(1),
        }
    }
}

impl TcpConnect {
    /// Check the container's main port.
    pub fn app_port() -> Self {
        Self::default()
    }

    pub fn port(port: impl Into<ContainerPort>) -> Self {
        Self {
            port: Some(port.into()),
            ..Self::default()
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn address(&self, container: &Container) -> Result<SocketAddr> {
        let port = self
            .port
            .as_ref()
            .or(container.app_port())
            .ok_or_else(|| {
                Error::config(format!("container {} has no port to connect to", container.name()))
            })?;
        let target = match container.host_port(port) {
            Some(host_port) => format!("127.0.0.1:{host_port}"),
            None => format!("{}:{}", container.ip_address()?, port.number()),
        };
        target
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::config(format!("cannot resolve {target}")))
    }
}

/// Connection failures that mean "not listening yet".
pub fn is_transient(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::TimedOut
            | ErrorKind::WouldBlock
            | ErrorKind::UnexpectedEof
            | ErrorKind::AddrNotAvailable
            | ErrorKind::HostUnreachable
            | ErrorKind::NetworkUnreachable
    )
}

impl ReadinessCheck for TcpConnect {
    fn is_ready(&self, container: &Container) -> Result<bool> {
        let addr = self.address(container)?;
        match TcpStream::connect_timeout(&addr, self.connect_timeout) {
            Ok(_) => Ok(true),
            Err(e) if is_transient(e.kind()) => {
                debug!(container = %container.name(), %addr, error = %e, "not accepting connections yet");
                Ok(false)
            }
            Err(e) => Err(Error::Probe(format!("connect to {addr}: {e}"))),
        }
    }
}

/// Ready once the container's log output matches a pattern.
///
/// Logs are fetched from the beginning on every attempt. A stream that ends
/// without enough matches is "not yet".
#[derive(Debug, Clone)]
pub struct LogMatch {
    pattern: Regex,
    times: usize,
}

impl LogMatch {
    pub fn new(pattern: &str) -> Result<Self> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            times: 1,
        })
    }

    /// Require the pattern on at least `times` separate lines.
    pub fn times(mut self, times: usize) -> Self {
        self.times = times.max(1);
        self
    }

    /// Scan a log stream line by line. Lines are raw bytes, so output that
    /// is not valid UTF-8 is still searched.
    pub fn matches_in<R: BufRead>(&self, reader: R) -> bool {
        let mut seen = 0;
        for line in reader.split(b'\n') {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    debug!(error = %e, "log stream broke off");
                    return false;
                }
            };
            if self.pattern.is_match(&line) {
                seen += 1;
                if seen >= self.times {
                    return true;
                }
            }
        }
        false
    }
}

impl ReadinessCheck for LogMatch {
    fn is_ready(&self, container: &Container) -> Result<bool> {
        let logs = container.runtime().logs(&container.id()?)?;
        let matched = self.matches_in(BufReader::new(logs));
        if !matched {
            debug!(container = %container.name(), pattern = %self.pattern, "log pattern not seen yet");
        }
        Ok(matched)
    }
}

/// Ready once a command run inside the container exits 0.
#[derive(Debug, Clone)]
pub struct ExecSucceeds {
    argv: Vec<String>,
}

impl ExecSucceeds {
    pub fn new<S: Into<String>>(argv: impl IntoIterator<Item = S>) -> Self {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
        }
    }

    /// Split a shell-style command line, e.g. `pg_isready -U "my user"`.
    pub fn parse(command: &str) -> Result<Self> {
        let argv = shell_words::split(command)
            .map_err(|e| Error::config(format!("invalid command {command:?}: {e}")))?;
        if argv.is_empty() {
            return Err(Error::config("empty readiness command"));
        }
        Ok(Self { argv })
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }
}

impl ReadinessCheck for ExecSucceeds {
    fn is_ready(&self, container: &Container) -> Result<bool> {
        let out = container.run_cmd(self.argv.as_slice())?;
        if !out.success() {
            debug!(container = %container.name(), argv = ?self.argv, code = ?out.exit_code, "readiness command failed");
        }
        Ok(out.success())
    }
}

/// Ready when every check is, evaluated in order and stopping at the first
/// one that is not.
#[derive(Clone, Default)]
pub struct AllOf {
    checks: Vec<Arc<dyn ReadinessCheck>>,
}

impl AllOf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn and(mut self, check: impl ReadinessCheck + 'static) -> Self {
        self.checks.push(Arc::new(check));
        self
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }
}

impl ReadinessCheck for AllOf {
    fn is_ready(&self, container: &Container) -> Result<bool> {
        for check in &self.checks {
            if !check.is_ready(container)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn log_match_finds_line() {
        let probe = LogMatch::new("ready to accept connections").unwrap();
        let logs = "initdb: done\nLOG:  database system is ready to accept connections\n";
        assert!(probe.matches_in(Cursor::new(logs)));
    }

    #[test]
    fn log_match_without_line_is_not_ready() {
        let probe = LogMatch::new("ready to accept connections").unwrap();
        assert!(!probe.matches_in(Cursor::new("initdb: starting\n")));
        assert!(!probe.matches_in(Cursor::new("")));
    }

    #[test]
    fn log_match_counts_lines() {
        let probe = LogMatch::new("ready for connections").unwrap().times(2);
        let once = "mysqld: ready for connections\n";
        let twice = "mysqld: ready for connections\nshutdown\nmysqld: ready for connections\n";
        assert!(!probe.matches_in(Cursor::new(once)));
        assert!(probe.matches_in(Cursor::new(twice)));
    }

    #[test]
    fn log_match_reads_past_invalid_utf8() {
        let check = LogMatch::new("ready to accept connections").unwrap();
        let logs: &[u8] = b"locale: caf\xe9\nLOG: database system is ready to accept connections\n";
        assert!(check.matches_in(Cursor::new(logs)));
    }

    #[test]
    fn bad_pattern_is_rejected() {
        assert!(matches!(LogMatch::new("(unclosed"), Err(Error::Regex(_))));
    }

    #[test]
    fn exec_command_is_shell_split() {
        let probe = ExecSucceeds::parse(r#"pg_isready -U "app user" -h 127.0.0.1"#).unwrap();
        assert_eq!(probe.argv(), ["pg_isready", "-U", "app user", "-h", "127.0.0.1"]);
        assert!(ExecSucceeds::parse("").is_err());
        assert!(ExecSucceeds::parse("echo 'unterminated").is_err());
    }

    #[test]
    fn transient_kinds() {
        assert!(is_transient(ErrorKind::ConnectionRefused));
        assert!(is_transient(ErrorKind::UnexpectedEof));
        assert!(!is_transient(ErrorKind::PermissionDenied));
    }
}
