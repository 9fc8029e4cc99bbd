//! Declarative service network configuration.
//!
//! A network is declared as a list of service instances, each bound to a
//! registered [`ServiceConfiguration`] and to the instances it depends on.
//! Dependencies must be declared before their dependents, which rules out
//! cycles and makes declaration order a valid start order.

use crate::clock::Clock;
use crate::docker::cli::sanitize_name;
use crate::docker::manager::LifecycleManager;
use crate::docker::ports::FreeHostPortTracker;
use crate::docker::runtime::ContainerSpec;
use crate::errors::{NetError, Result};
use crate::network::running::{RunningNetwork, RunningService};
use crate::network::NetworkAllocators;
use crate::services::{AvailabilityChecker, ServiceHandle, ServiceInitializer};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::fs::File;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

pub type ConfigurationId = u32;
pub type ServiceId = u32;

/// Default interval between availability checks
pub const DEFAULT_AVAILABILITY_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Default grace period when stopping service containers
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Template for one kind of container workload
pub struct ServiceConfiguration {
    image: String,
    initializer: Arc<dyn ServiceInitializer>,
    availability_checker: Option<Arc<dyn AvailabilityChecker>>,
}

impl ServiceConfiguration {
    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn initializer(&self) -> &Arc<dyn ServiceInitializer> {
        &self.initializer
    }

    pub fn availability_checker(&self) -> Option<&Arc<dyn AvailabilityChecker>> {
        self.availability_checker.as_ref()
    }
}

impl fmt::Debug for ServiceConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceConfiguration")
            .field("image", &self.image)
            .field("availability_checker", &self.availability_checker.is_some())
            .finish()
    }
}

/// A declared use of a configuration within one network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInstance {
    pub id: ServiceId,
    pub configuration: ConfigurationId,
    pub dependencies: BTreeSet<ServiceId>,
}

/// Accumulates configurations and service declarations
pub struct ServiceNetworkConfigBuilder {
    next_configuration_id: ConfigurationId,
    configurations: BTreeMap<ConfigurationId, Arc<ServiceConfiguration>>,
    services: BTreeMap<ServiceId, ServiceInstance>,
    start_order: Vec<ServiceId>,
    /// Services nothing else depends on (yet)
    sink_services: BTreeSet<ServiceId>,
    poll_interval: Duration,
    stop_timeout: Duration,
}

impl Default for ServiceNetworkConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceNetworkConfigBuilder {
    pub fn new() -> Self {
        Self {
            next_configuration_id: 0,
            configurations: BTreeMap::new(),
            services: BTreeMap::new(),
            start_order: Vec::new(),
            sink_services: BTreeSet::new(),
            poll_interval: DEFAULT_AVAILABILITY_POLL_INTERVAL,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    /// Interval between availability checks while a service starts
    pub fn availability_poll_interval(&mut self, interval: Duration) -> &mut Self {
        self.poll_interval = interval;
        self
    }

    /// Grace period given to service containers at teardown
    pub fn stop_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.stop_timeout = timeout;
        self
    }

    /// Register a service kind. IDs are handed out in increasing order.
    pub fn add_configuration(
        &mut self,
        image: impl Into<String>,
        initializer: Arc<dyn ServiceInitializer>,
        availability_checker: Option<Arc<dyn AvailabilityChecker>>,
    ) -> ConfigurationId {
        let id = self.next_configuration_id;
        self.next_configuration_id += 1;
        self.configurations.insert(
            id,
            Arc::new(ServiceConfiguration {
                image: image.into(),
                initializer,
                availability_checker,
            }),
        );
        id
    }

    /// Declare a service instance. Every dependency must already be declared.
    ///
    /// Either the whole declaration is recorded or, on error, nothing changes.
    pub fn add_service(
        &mut self,
        configuration: ConfigurationId,
        service_id: ServiceId,
        dependencies: &HashSet<ServiceId>,
    ) -> Result<ServiceId> {
        if !self.configurations.contains_key(&configuration) {
            return Err(NetError::UnknownConfiguration(configuration));
        }
        if self.services.contains_key(&service_id) {
            return Err(NetError::DuplicateService(service_id));
        }
        let mut sorted_dependencies = BTreeSet::new();
        for dependency in dependencies {
            if !self.services.contains_key(dependency) {
                return Err(NetError::UnknownDependency {
                    service: service_id,
                    dependency: *dependency,
                });
            }
            sorted_dependencies.insert(*dependency);
        }

        for dependency in &sorted_dependencies {
            self.sink_services.remove(dependency);
        }
        self.sink_services.insert(service_id);
        self.start_order.push(service_id);
        self.services.insert(
            service_id,
            ServiceInstance {
                id: service_id,
                configuration,
                dependencies: sorted_dependencies,
            },
        );
        Ok(service_id)
    }

    pub fn start_order(&self) -> &[ServiceId] {
        &self.start_order
    }

    pub fn sink_services(&self) -> &BTreeSet<ServiceId> {
        &self.sink_services
    }

    pub fn service(&self, service_id: ServiceId) -> Option<&ServiceInstance> {
        self.services.get(&service_id)
    }

    pub fn configuration_count(&self) -> usize {
        self.configurations.len()
    }

    /// Snapshot the current declarations. Later builder changes do not affect it.
    pub fn build(&self) -> ServiceNetworkConfig {
        ServiceNetworkConfig {
            configurations: self.configurations.clone(),
            services: self.services.clone(),
            start_order: self.start_order.clone(),
            sink_services: self.sink_services.clone(),
            poll_interval: self.poll_interval,
            stop_timeout: self.stop_timeout,
        }
    }
}

/// Immutable network description produced by [`ServiceNetworkConfigBuilder::build`]
#[derive(Debug, Clone)]
pub struct ServiceNetworkConfig {
    configurations: BTreeMap<ConfigurationId, Arc<ServiceConfiguration>>,
    services: BTreeMap<ServiceId, ServiceInstance>,
    start_order: Vec<ServiceId>,
    sink_services: BTreeSet<ServiceId>,
    poll_interval: Duration,
    stop_timeout: Duration,
}

/// A container ready to be created, with everything allocated for it
struct PreparedService {
    spec: ContainerSpec,
    mounted_files: Vec<NamedTempFile>,
}

impl ServiceNetworkConfig {
    pub fn start_order(&self) -> &[ServiceId] {
        &self.start_order
    }

    pub fn sink_services(&self) -> &BTreeSet<ServiceId> {
        &self.sink_services
    }

    pub fn services(&self) -> &BTreeMap<ServiceId, ServiceInstance> {
        &self.services
    }

    pub fn configurations(&self) -> &BTreeMap<ConfigurationId, Arc<ServiceConfiguration>> {
        &self.configurations
    }

    pub fn stop_timeout(&self) -> Duration {
        self.stop_timeout
    }

    /// Start every service in dependency order on the manager's network.
    ///
    /// The first failure stops the remaining services from starting, tears
    /// down the ones already running, and is returned tagged with the ID of
    /// the service that failed.
    pub fn create_and_run(
        &self,
        network_name: &str,
        manager: &LifecycleManager,
        allocators: &mut NetworkAllocators,
    ) -> Result<RunningNetwork> {
        let mut running = RunningNetwork::new(network_name);
        tracing::info!(
            network = %network_name,
            services = self.start_order.len(),
            "starting service network"
        );

        for &service_id in &self.start_order {
            if let Err(e) = self.start_service(service_id, manager, allocators, &mut running) {
                tracing::error!(service = service_id, error = %e, "service failed to start");
                if let Err(teardown_err) = running.teardown(manager, allocators, self.stop_timeout)
                {
                    tracing::error!(
                        error = %teardown_err,
                        "failed to tear down partially started network"
                    );
                }
                return Err(NetError::ServiceStartFailed {
                    service: service_id,
                    source: Box::new(e),
                });
            }
        }

        Ok(running)
    }

    fn start_service(
        &self,
        service_id: ServiceId,
        manager: &LifecycleManager,
        allocators: &mut NetworkAllocators,
        running: &mut RunningNetwork,
    ) -> Result<()> {
        let instance = self
            .services
            .get(&service_id)
            .ok_or_else(|| {
                NetError::ConfigError(format!(
                    "service {} is in the start order but was never declared",
                    service_id
                ))
            })?;
        let configuration = self
            .configurations
            .get(&instance.configuration)
            .ok_or(NetError::UnknownConfiguration(instance.configuration))?;

        let dependencies = instance
            .dependencies
            .iter()
            .map(|dependency| {
                running
                    .service(*dependency)
                    .map(|started| Arc::clone(&started.service))
                    .ok_or(NetError::UnknownDependency {
                        service: service_id,
                        dependency: *dependency,
                    })
            })
            .collect::<Result<Vec<ServiceHandle>>>()?;

        let ip = allocators.ips.get_free_addr()?;
        let mut port_bindings = BTreeMap::new();
        let prepared = self.prepare_service(
            service_id,
            running.name(),
            configuration,
            ip,
            &dependencies,
            allocators.host_ports.as_mut(),
            &mut port_bindings,
        );
        let prepared = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                allocators.release(ip, &port_bindings);
                return Err(e);
            }
        };

        let container_id = match manager.create_and_start_container(&prepared.spec, ip) {
            Ok((_, container_id)) => container_id,
            Err(e) => {
                allocators.release(ip, &port_bindings);
                return Err(e);
            }
        };

        let service = configuration.initializer().service_from_ip(ip);
        running.insert(
            service_id,
            RunningService {
                container_id,
                ip,
                service: Arc::clone(&service),
                host_ports: port_bindings,
            },
            prepared.mounted_files,
        );

        if let Some(checker) = configuration.availability_checker() {
            self.wait_for_availability(
                service_id,
                checker.as_ref(),
                &service,
                &dependencies,
                manager.clock().as_ref(),
            )?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn prepare_service(
        &self,
        service_id: ServiceId,
        network_name: &str,
        configuration: &ServiceConfiguration,
        ip: IpAddr,
        dependencies: &[ServiceHandle],
        host_ports: Option<&mut FreeHostPortTracker>,
        port_bindings: &mut BTreeMap<u16, u16>,
    ) -> Result<PreparedService> {
        let initializer = configuration.initializer();
        let command = initializer.start_command(ip, dependencies)?;
        let used_ports = initializer.used_ports();

        let mut mounted_files = Vec::new();
        let mut open_files: HashMap<String, File> = HashMap::new();
        let mut bind_mounts = BTreeMap::new();
        for container_path in initializer.files_to_mount() {
            let host_file = NamedTempFile::new()?;
            open_files.insert(container_path.clone(), host_file.reopen()?);
            bind_mounts.insert(host_file.path().to_path_buf(), container_path);
            mounted_files.push(host_file);
        }
        if !open_files.is_empty() {
            initializer.initialize_mounted_files(&mut open_files, dependencies)?;
        }
        // Flush and close before the container sees the files
        drop(open_files);

        if let Some(tracker) = host_ports {
            for port in &used_ports {
                let host_port = tracker.get_free_port()?;
                port_bindings.insert(*port, host_port);
            }
        }

        let spec = ContainerSpec {
            image: configuration.image().to_string(),
            name: Some(format!("{}-{}", sanitize_name(network_name), service_id)),
            exposed_ports: used_ports,
            port_bindings: port_bindings.clone(),
            command: Some(command),
            env: BTreeMap::new(),
            bind_mounts,
            volume_mounts: BTreeMap::new(),
        };
        Ok(PreparedService {
            spec,
            mounted_files,
        })
    }

    fn wait_for_availability(
        &self,
        service_id: ServiceId,
        checker: &dyn AvailabilityChecker,
        service: &ServiceHandle,
        dependencies: &[ServiceHandle],
        clock: &dyn Clock,
    ) -> Result<()> {
        let timeout = checker.timeout();
        let start = clock.now();

        loop {
            if checker.is_service_up(service.as_ref(), dependencies) {
                tracing::debug!(service = service_id, "service is available");
                return Ok(());
            }
            let elapsed = clock.elapsed_since(start);
            if elapsed >= timeout {
                return Err(NetError::ReadinessTimeout {
                    service: service_id,
                    timeout,
                });
            }
            clock.sleep(self.poll_interval.min(timeout - elapsed));
        }
    }
}
