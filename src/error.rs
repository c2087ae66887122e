use std::time::Duration;

use thiserror::Error;

/// Errors raised while provisioning, probing or tearing down containers.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration, detected before any container is created.
    #[error("configuration error: {0}")]
    Config(String),

    /// The container runtime rejected an operation.
    #[error("{op} failed: {message}")]
    Runtime { op: &'static str, message: String },

    /// The runtime no longer knows about the container.
    #[error("no such container: {0}")]
    NotFound(String),

    /// The container process exited and will never become ready.
    #[error("container {0} already exited")]
    AlreadyExited(String),

    /// A poll ran out of time without success or a hard failure.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("container {0} has not been started")]
    NotStarted(String),

    #[error("container {0} was already started")]
    AlreadyStarted(String),

    #[error("container {0} was removed and cannot be reused")]
    Removed(String),

    #[error("completion signal for {0} was already raised")]
    SignalAlreadyRaised(String),

    #[error("cyclic dependency between: {}", .0.join(" -> "))]
    CyclicDependency(Vec<String>),

    #[error("a container named {0} is already in the group")]
    DuplicateName(String),

    #[error("group was already started")]
    GroupAlreadyStarted,

    /// A readiness probe reported a condition that should stop retrying.
    #[error("probe failed: {0}")]
    Probe(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid JSON from runtime: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid log pattern: {0}")]
    Regex(#[from] regex::Error),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn runtime(op: &'static str, message: impl Into<String>) -> Self {
        Self::Runtime {
            op,
            message: message.into(),
        }
    }

    /// True when the error only says the container is already gone.
    ///
    /// Cleanup paths swallow these.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Runtime { message, .. } => message.contains("No such container"),
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_is_recognised_from_runtime_message() {
        let err = Error::runtime("stop", "Error response from daemon: No such container: abc");
        assert!(err.is_not_found());
        assert!(Error::NotFound("abc".into()).is_not_found());
        assert!(!Error::runtime("stop", "permission denied").is_not_found());
    }

    #[test]
    fn cycle_message_lists_the_path() {
        let err = Error::CyclicDependency(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(err.to_string(), "cyclic dependency between: a -> b -> a");
    }
}
