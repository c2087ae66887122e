// Container handles: configuration, lifecycle and readiness of one container.

mod handle;
mod types;

pub use handle::{Container, DEFAULT_STOP_TIMEOUT};
pub use types::{
    ContainerPort, HostPort, LifecycleState, PortBinding, PropertyMap, Proto, VolumeMount,
};
