// Container runtime access: client trait, docker CLI client, lifecycle policy, host ports
pub mod cli;
pub mod manager;
pub mod ports;
pub mod runtime;

pub use cli::DockerCli;
pub use manager::{LifecycleManager, DEFAULT_NETWORK_NAME};
pub use ports::FreeHostPortTracker;
pub use runtime::{ContainerRuntime, ContainerSpec};
