use std::path::Path;

use tracing::debug;

use super::types::Settings;
use crate::error::{Error, Result};

pub const SETTINGS_FILE: &str = ".cntest.yaml";
pub const ENV_DOCKER: &str = "CNTEST_DOCKER";
pub const ENV_MAX_START_SECS: &str = "CNTEST_MAX_START_SECS";

impl Settings {
    /// Load settings from a `.cntest.yaml` file in the given directory.
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(SETTINGS_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path)?;
        let settings: Settings = serde_yaml::from_str(&contents)
            .map_err(|e| Error::config(format!("{}: {e}", path.display())))?;
        debug!(path = %path.display(), "loaded settings");
        Ok(Some(settings))
    }

    /// File settings (or defaults), then environment overrides.
    pub fn resolve(dir: &Path) -> Result<Self> {
        let mut settings = Self::load(dir)?.unwrap_or_default();
        settings.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    /// Apply `CNTEST_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(binary) = lookup(ENV_DOCKER).filter(|b| !b.is_empty()) {
            self.docker_binary = binary;
        }
        if let Some(raw) = lookup(ENV_MAX_START_SECS) {
            self.max_start_time_secs = raw.trim().parse().map_err(|_| {
                Error::config(format!("{ENV_MAX_START_SECS} must be a number of seconds, got {raw:?}"))
            })?;
        }
        Ok(())
    }
}
