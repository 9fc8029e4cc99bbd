// Container runtime abstraction - the only way the orchestrator touches the outside world
use crate::errors::Result;
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Everything needed to create one container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: String,
    /// Container name; the runtime picks one when `None`
    pub name: Option<String>,
    /// Container ports to expose (TCP)
    pub exposed_ports: BTreeSet<u16>,
    /// Container port -> host port
    pub port_bindings: BTreeMap<u16, u16>,
    /// Start command; `None` runs the image's default CMD
    pub command: Option<Vec<String>>,
    pub env: BTreeMap<String, String>,
    /// Host path -> container path
    pub bind_mounts: BTreeMap<PathBuf, String>,
    /// Volume name -> container path
    pub volume_mounts: BTreeMap<String, String>,
}

impl ContainerSpec {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }
}

/// Trait that all container runtime clients must implement
///
/// Calls block the calling thread. Implementations must be safe to share
/// between worker threads. Failures are returned as-is; callers add context.
pub trait ContainerRuntime: Send + Sync {
    /// ID of the network with exactly this name, if it exists
    fn find_network(&self, name: &str) -> Result<Option<String>>;

    /// Create a bridge network with a single IPAM pool
    fn create_network(&self, name: &str, subnet: &str, gateway: IpAddr) -> Result<String>;

    fn remove_network(&self, name: &str) -> Result<()>;

    /// Create a named volume and return its mountpoint on the host
    fn create_volume(&self, name: &str) -> Result<PathBuf>;

    fn remove_volume(&self, name: &str) -> Result<()>;

    fn image_exists(&self, image: &str) -> Result<bool>;

    fn pull_image(&self, image: &str) -> Result<()>;

    /// Create (but do not start) a container, returning its ID
    fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    /// Attach a container to a network with a static address
    fn connect_network(&self, network: &str, container_id: &str, ip: IpAddr) -> Result<()>;

    fn start_container(&self, container_id: &str) -> Result<()>;

    /// Stop gracefully, killing after `timeout`
    fn stop_container(&self, container_id: &str, timeout: Duration) -> Result<()>;

    /// Block until the container is no longer running and return its exit code
    fn wait_container(&self, container_id: &str) -> Result<i64>;

    /// Force-remove a container
    fn remove_container(&self, container_id: &str) -> Result<()>;

    /// Combined stdout/stderr of a container
    fn container_logs(&self, container_id: &str) -> Result<Vec<u8>>;
}
