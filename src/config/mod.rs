// Settings and group-file configuration.

pub mod group_file;
mod loader;
mod types;

pub use group_file::{ContainerSpec, DEFAULT_GROUP_FILE, GroupFile, Preset, WaitFor};
pub use loader::{ENV_DOCKER, ENV_MAX_START_SECS, SETTINGS_FILE};
pub use types::Settings;
