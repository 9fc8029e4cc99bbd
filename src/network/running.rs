// Runtime state of a started service network
use crate::docker::manager::LifecycleManager;
use crate::errors::Result;
use crate::network::builder::ServiceId;
use crate::network::NetworkAllocators;
use crate::services::ServiceHandle;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;
use tempfile::NamedTempFile;

/// One started service container
#[derive(Clone)]
pub struct RunningService {
    pub container_id: String,
    pub ip: IpAddr,
    pub service: ServiceHandle,
    /// Container port -> host port
    pub host_ports: BTreeMap<u16, u16>,
}

/// Services started by `ServiceNetworkConfig::create_and_run`, owned by the run that started them
pub struct RunningNetwork {
    name: String,
    services: BTreeMap<ServiceId, RunningService>,
    start_order: Vec<ServiceId>,
    /// Host side of bind-mounted files; deleted when the network is dropped
    mounted_files: Vec<NamedTempFile>,
}

impl RunningNetwork {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            services: BTreeMap::new(),
            start_order: Vec::new(),
            mounted_files: Vec::new(),
        }
    }

    pub(crate) fn insert(
        &mut self,
        service_id: ServiceId,
        service: RunningService,
        mounted_files: Vec<NamedTempFile>,
    ) {
        self.services.insert(service_id, service);
        self.start_order.push(service_id);
        self.mounted_files.extend(mounted_files);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn service(&self, service_id: ServiceId) -> Option<&RunningService> {
        self.services.get(&service_id)
    }

    pub fn services(&self) -> &BTreeMap<ServiceId, RunningService> {
        &self.services
    }

    /// IDs of started services, in the order they were started
    pub fn start_order(&self) -> &[ServiceId] {
        &self.start_order
    }

    pub fn container_ids(&self) -> Vec<String> {
        self.start_order
            .iter()
            .filter_map(|id| self.services.get(id))
            .map(|s| s.container_id.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Append every service container's output to the current log
    pub fn dump_logs(&self, manager: &LifecycleManager) {
        for service_id in &self.start_order {
            let Some(service) = self.services.get(service_id) else {
                continue;
            };
            match manager.container_logs(&service.container_id) {
                Ok(bytes) => {
                    let output = String::from_utf8_lossy(&bytes);
                    for line in output.lines() {
                        tracing::info!(target: "service", service = service_id, "{}", line);
                    }
                }
                Err(e) => {
                    tracing::warn!(service = service_id, error = %e, "could not read service logs")
                }
            }
        }
    }

    /// Stop and remove every container in reverse start order, returning
    /// addresses and host ports to the allocators.
    ///
    /// Keeps going after failures and returns the first one.
    pub fn teardown(
        &mut self,
        manager: &LifecycleManager,
        allocators: &mut NetworkAllocators,
        stop_timeout: Duration,
    ) -> Result<()> {
        let mut first_error = None;

        while let Some(service_id) = self.start_order.pop() {
            let Some(service) = self.services.remove(&service_id) else {
                continue;
            };

            if let Err(e) = manager.stop_container(&service.container_id, stop_timeout) {
                tracing::warn!(service = service_id, error = %e, "failed to stop service container");
            }
            match manager.remove_container(&service.container_id) {
                Ok(()) => tracing::debug!(
                    service = service_id,
                    container_id = %service.container_id,
                    "removed service container"
                ),
                Err(e) => {
                    tracing::error!(
                        service = service_id,
                        error = %e,
                        "failed to remove service container"
                    );
                    first_error.get_or_insert(e);
                }
            }

            allocators.release(service.ip, &service.host_ports);
        }

        self.mounted_files.clear();
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
