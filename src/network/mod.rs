// Service networks: declaration, address allocation, and running state
pub mod builder;
pub mod declared;
pub mod ip;
pub mod running;

pub use builder::{
    ConfigurationId, ServiceConfiguration, ServiceId, ServiceInstance, ServiceNetworkConfig,
    ServiceNetworkConfigBuilder,
};
pub use declared::DeclaredNetwork;
pub use ip::{split_subnets, FreeIpAddrTracker};
pub use running::{RunningNetwork, RunningService};

use crate::docker::ports::FreeHostPortTracker;
use crate::errors::Result;
use std::collections::BTreeMap;
use std::net::IpAddr;

/// Address and port allocators owned by a single test run
#[derive(Debug)]
pub struct NetworkAllocators {
    pub ips: FreeIpAddrTracker,
    /// Present when service ports should be published on the host
    pub host_ports: Option<FreeHostPortTracker>,
}

impl NetworkAllocators {
    pub fn new(ips: FreeIpAddrTracker) -> Self {
        Self {
            ips,
            host_ports: None,
        }
    }

    pub fn with_host_ports(mut self, host_ports: FreeHostPortTracker) -> Self {
        self.host_ports = Some(host_ports);
        self
    }

    /// Give back an address and any host ports bound for it
    pub(crate) fn release(&mut self, ip: IpAddr, port_bindings: &BTreeMap<u16, u16>) {
        self.ips.release_addr(ip);
        if let Some(tracker) = self.host_ports.as_mut() {
            for host_port in port_bindings.values() {
                if let Err(e) = tracker.release_port(*host_port) {
                    tracing::warn!(error = %e, "host port was already free");
                }
            }
        }
    }
}

/// Declares the service network a test needs.
///
/// `test_image` is the image of the system under test; loaders use it for
/// the configurations that should run the tested build.
pub trait NetworkLoader: Send + Sync {
    fn configure_network(
        &self,
        builder: &mut ServiceNetworkConfigBuilder,
        test_image: &str,
    ) -> Result<()>;
}
