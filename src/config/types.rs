use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Defaults applied to every container the tooling creates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub docker_binary: String,
    pub max_start_time_secs: u64,
    pub poll_interval_ms: u64,
    pub stop_timeout_secs: u64,
    pub stop_after_test: bool,
    pub remove_after_test: bool,
    /// Pull images before creating containers.
    pub pull: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            docker_binary: "docker".to_string(),
            max_start_time_secs: 30,
            poll_interval_ms: 500,
            stop_timeout_secs: 10,
            stop_after_test: true,
            remove_after_test: true,
            pull: false,
        }
    }
}

impl Settings {
    pub fn max_start_time(&self) -> Duration {
        Duration::from_secs(self.max_start_time_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}
