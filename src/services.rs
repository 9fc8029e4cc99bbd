//! Capabilities supplied per service kind.
//!
//! The orchestration core never knows what a service is; it only talks to the
//! three traits below. A service kind (for example a blockchain node image)
//! provides an initializer that produces the container start command and a
//! handle type, plus an optional availability checker.

use crate::errors::Result;
use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

/// Live handle to a started service, handed to dependents and checkers.
pub trait Service: Any + Send + Sync {
    /// Static address the service's container was given on the test network.
    fn ip_addr(&self) -> IpAddr;

    /// Access the concrete handle type, e.g. to call service-specific endpoints.
    fn as_any(&self) -> &dyn Any;
}

/// Shared service handle.
pub type ServiceHandle = Arc<dyn Service>;

/// Produces everything needed to launch one container of a service kind.
pub trait ServiceInitializer: Send + Sync {
    /// Container ports the service listens on; they are exposed on the container.
    fn used_ports(&self) -> BTreeSet<u16>;

    /// Start command for a container with the given address, fed with the
    /// handles of its already-running dependencies (in ascending ID order).
    fn start_command(&self, ip_addr: IpAddr, dependencies: &[ServiceHandle])
        -> Result<Vec<String>>;

    /// Wrap a started container's address into a service handle.
    fn service_from_ip(&self, ip_addr: IpAddr) -> ServiceHandle;

    /// Container paths of files the orchestrator should create on the host and
    /// bind-mount into the container.
    fn files_to_mount(&self) -> BTreeSet<String> {
        BTreeSet::new()
    }

    /// Called once the files from `files_to_mount` exist, keyed by container path,
    /// before the container is started.
    fn initialize_mounted_files(
        &self,
        _mounted_files: &mut HashMap<String, File>,
        _dependencies: &[ServiceHandle],
    ) -> Result<()> {
        Ok(())
    }
}

/// Decides when a freshly started service is ready for dependents.
pub trait AvailabilityChecker: Send + Sync {
    fn is_service_up(&self, to_check: &dyn Service, dependencies: &[ServiceHandle]) -> bool;

    /// Maximum time to keep polling before giving up.
    fn timeout(&self) -> Duration;
}
