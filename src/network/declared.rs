// Service networks declared in the suite config file
use crate::config::ServiceDefinition;
use crate::errors::{NetError, Result};
use crate::network::{NetworkLoader, ServiceNetworkConfigBuilder};
use crate::services::{AvailabilityChecker, Service, ServiceHandle, ServiceInitializer};
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

/// How long a single readiness probe may take
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Loads a network from `ServiceDefinition`s
#[derive(Debug, Clone)]
pub struct DeclaredNetwork {
    services: Vec<ServiceDefinition>,
}

impl DeclaredNetwork {
    pub fn new(services: Vec<ServiceDefinition>) -> Self {
        Self { services }
    }
}

impl NetworkLoader for DeclaredNetwork {
    fn configure_network(
        &self,
        builder: &mut ServiceNetworkConfigBuilder,
        test_image: &str,
    ) -> Result<()> {
        for definition in &self.services {
            let image = definition
                .image
                .clone()
                .unwrap_or_else(|| test_image.to_string());
            let initializer = Arc::new(CommandInitializer {
                ports: definition.ports.iter().copied().collect(),
                command: definition.command.clone(),
                dependencies: definition.depends_on.clone(),
            });
            let checker = definition.ready_timeout.map(|timeout| {
                Arc::new(TcpPortChecker {
                    port: definition.ports.first().copied(),
                    timeout,
                }) as Arc<dyn AvailabilityChecker>
            });

            let config_id = builder.add_configuration(image, initializer, checker);
            let dependencies: HashSet<u32> = definition.depends_on.iter().copied().collect();
            builder.add_service(config_id, definition.id, &dependencies)?;
        }
        Ok(())
    }
}

/// Handle for a service that only has an address
#[derive(Debug)]
pub struct DeclaredService {
    ip: IpAddr,
}

impl Service for DeclaredService {
    fn ip_addr(&self) -> IpAddr {
        self.ip
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Start command taken from the config, with address placeholders filled in
struct CommandInitializer {
    ports: BTreeSet<u16>,
    command: Vec<String>,
    /// As declared, to map `{dep:N}` onto the sorted handle list
    dependencies: Vec<u32>,
}

impl ServiceInitializer for CommandInitializer {
    fn used_ports(&self) -> BTreeSet<u16> {
        self.ports.clone()
    }

    fn start_command(
        &self,
        ip_addr: IpAddr,
        dependencies: &[ServiceHandle],
    ) -> Result<Vec<String>> {
        // Handles arrive in ascending dependency ID order
        let sorted: BTreeSet<u32> = self.dependencies.iter().copied().collect();
        let by_id: BTreeMap<u32, IpAddr> = sorted
            .into_iter()
            .zip(dependencies.iter().map(|handle| handle.ip_addr()))
            .collect();

        self.command
            .iter()
            .map(|arg| expand_placeholders(arg, ip_addr, &by_id))
            .collect()
    }

    fn service_from_ip(&self, ip_addr: IpAddr) -> ServiceHandle {
        Arc::new(DeclaredService { ip: ip_addr })
    }
}

fn expand_placeholders(
    arg: &str,
    own_ip: IpAddr,
    dependencies: &BTreeMap<u32, IpAddr>,
) -> Result<String> {
    let mut expanded = arg.replace("{ip}", &own_ip.to_string());

    while let Some(start) = expanded.find("{dep:") {
        let Some(len) = expanded[start..].find('}') else {
            break;
        };
        let end = start + len;
        let id_str = &expanded[start + "{dep:".len()..end];
        let id: u32 = id_str.parse().map_err(|_| {
            NetError::ConfigError(format!("Invalid dependency placeholder in '{}'", arg))
        })?;
        let ip = dependencies.get(&id).ok_or_else(|| {
            NetError::ConfigError(format!(
                "'{}' refers to service {}, which is not a declared dependency",
                arg, id
            ))
        })?;
        expanded.replace_range(start..=end, &ip.to_string());
    }

    Ok(expanded)
}

/// Ready once a TCP connection to the service's first port succeeds
struct TcpPortChecker {
    port: Option<u16>,
    timeout: Duration,
}

impl AvailabilityChecker for TcpPortChecker {
    fn is_service_up(&self, to_check: &dyn Service, _dependencies: &[ServiceHandle]) -> bool {
        let Some(port) = self.port else {
            // Nothing to probe
            return true;
        };
        let address = SocketAddr::new(to_check.ip_addr(), port);
        TcpStream::connect_timeout(&address, PROBE_TIMEOUT).is_ok()
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}
