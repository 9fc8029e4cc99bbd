// One test run: network, optional service network, controller, teardown
//
// Everything here logs through whatever dispatcher is current on the calling
// thread. The worker installs the test's own file dispatcher around `run_test`.

use crate::docker::cli::sanitize_name;
use crate::docker::manager::LifecycleManager;
use crate::docker::ports::FreeHostPortTracker;
use crate::docker::runtime::{ContainerRuntime, ContainerSpec};
use crate::errors::{NetError, Result};
use crate::executor::controller::{
    controller_env, ControllerContext, CONTROLLER_LOG_MOUNT_FILEPATH, TEST_VOLUME_MOUNTPOINT,
};
use crate::executor::{ExecutionSettings, ParallelTestParams, StateListener, TestState};
use crate::network::{
    FreeIpAddrTracker, NetworkAllocators, RunningNetwork, ServiceNetworkConfigBuilder,
};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const LOG_SEPARATOR: &str = "- - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - -";

/// Name of the network and volume a test runs on
pub(crate) fn test_network_name(execution_id: Uuid, test_name: &str) -> String {
    sanitize_name(&format!("{}-{}", execution_id, test_name))
}

pub(crate) struct LoggedTestExecutor<'a> {
    execution_id: Uuid,
    runtime: Arc<dyn ContainerRuntime>,
    settings: &'a ExecutionSettings,
    listener: Option<&'a dyn StateListener>,
}

impl<'a> LoggedTestExecutor<'a> {
    pub(crate) fn new(
        execution_id: Uuid,
        runtime: Arc<dyn ContainerRuntime>,
        settings: &'a ExecutionSettings,
        listener: Option<&'a dyn StateListener>,
    ) -> Self {
        Self {
            execution_id,
            runtime,
            settings,
            listener,
        }
    }

    /// Run one test and return the controller's exit code.
    ///
    /// An `Err` means setting up or running the test broke, independent of
    /// whether the test itself would have passed.
    pub(crate) fn run_test(&self, params: &ParallelTestParams) -> Result<i64> {
        let test_name = params.test_name.as_str();
        let network_name = test_network_name(self.execution_id, test_name);
        let manager = LifecycleManager::new(Arc::clone(&self.runtime), network_name.clone());
        self.notify(test_name, TestState::NetworkCreating);

        tracing::info!(subnet = %params.subnet, "creating docker network for test");
        let mut ips = FreeIpAddrTracker::new(&params.subnet, &[])
            .map_err(|e| e.context("creating the free IP address tracker"))?;
        let gateway_ip = ips
            .get_free_addr()
            .map_err(|e| e.context("allocating the gateway IP"))?;
        let controller_ip = ips
            .get_free_addr()
            .map_err(|e| e.context("allocating an IP for the test controller"))?;
        let subnet = ips.subnet().to_string();

        let mut allocators = NetworkAllocators::new(ips);
        if let Some((start, end)) = params.host_port_range {
            allocators = allocators.with_host_ports(FreeHostPortTracker::new(start, end)?);
        }

        manager
            .create_network(&subnet, gateway_ip)
            .map_err(|e| e.context("creating docker network for the test"))?;
        tracing::info!(network = %network_name, "docker network created");

        // Dropped on every exit path below, including unwinding
        let mut guard = TeardownGuard {
            manager: &manager,
            allocators,
            stop_timeout: self.settings.stop_timeout,
            services: None,
            controller_id: None,
            volume_name: None,
        };

        if let Some(loader) = &params.network {
            let mut builder = ServiceNetworkConfigBuilder::new();
            builder.stop_timeout(self.settings.stop_timeout);
            loader
                .configure_network(&mut builder, &self.settings.service_image)
                .map_err(|e| e.context("declaring the test's service network"))?;
            let running = builder.build().create_and_run(
                &network_name,
                &manager,
                &mut guard.allocators,
            )?;
            tracing::info!(services = running.services().len(), "service network running");
            guard.services = Some(running);
        }

        let volume_name = network_name.clone();
        let mountpoint = manager.create_volume(&volume_name)?;
        guard.volume_name = Some(volume_name.clone());
        tracing::debug!(volume = %volume_name, mountpoint = %mountpoint.display(), "created test volume");

        let log_file = tempfile::Builder::new()
            .prefix(&format!("{}-controller-logs-", network_name))
            .tempfile()
            .map_err(|e| NetError::from(e).context("creating the controller log file"))?;
        tracing::debug!(path = %log_file.path().display(), "controller log file");

        let env = controller_env(&ControllerContext {
            test_name,
            subnet: &subnet,
            network_name: &network_name,
            gateway_ip,
            controller_ip,
            log_level: &self.settings.controller_log_level,
            service_image: &self.settings.service_image,
            volume_name: &volume_name,
        });
        tracing::debug!(?env, "environment passed to the controller");

        let mut spec = ContainerSpec::new(self.settings.controller_image.clone());
        spec.name = Some(format!("{}-controller", network_name));
        spec.env = env;
        // The controller launches containers of its own, so it gets the host's runtime socket
        spec.bind_mounts.insert(
            self.settings.docker_socket.clone(),
            self.settings.docker_socket.to_string_lossy().into_owned(),
        );
        spec.bind_mounts.insert(
            log_file.path().to_path_buf(),
            CONTROLLER_LOG_MOUNT_FILEPATH.to_string(),
        );
        spec.volume_mounts
            .insert(volume_name.clone(), TEST_VOLUME_MOUNTPOINT.to_string());

        let (_, controller_id) = manager
            .create_and_start_container(&spec, controller_ip)
            .map_err(|e| e.context("running the test controller container"))?;
        guard.controller_id = Some(controller_id.clone());
        tracing::info!(container_id = %controller_id, "controller container started");
        self.notify(test_name, TestState::ControllerRunning);

        tracing::info!("waiting for controller container to exit");
        let exit_code = match self.settings.test_timeout {
            Some(timeout) => manager.wait_for_exit_timeout(
                &controller_id,
                timeout,
                self.settings.stop_timeout,
                test_name,
            )?,
            None => manager.wait_for_exit(&controller_id)?,
        };
        tracing::info!(exit_code, "controller container exited");

        match fs::read_to_string(log_file.path()) {
            Ok(output) => {
                tracing::info!("- - - - - - - - - - - Controller Logs - - - - - - - - - - - - - -");
                for line in output.lines() {
                    tracing::info!(target: "controller", "{}", line);
                }
                tracing::info!("{}", LOG_SEPARATOR);
            }
            Err(e) => tracing::error!(error = %e, "failed to read controller log file"),
        }

        Ok(exit_code)
    }

    fn notify(&self, test_name: &str, state: TestState) {
        if let Some(listener) = self.listener {
            listener.on_state_change(test_name, state);
        }
    }
}

/// Best-effort cleanup of everything a test run created
struct TeardownGuard<'m> {
    manager: &'m LifecycleManager,
    allocators: NetworkAllocators,
    stop_timeout: Duration,
    services: Option<RunningNetwork>,
    controller_id: Option<String>,
    volume_name: Option<String>,
}

impl Drop for TeardownGuard<'_> {
    fn drop(&mut self) {
        if let Some(controller_id) = self.controller_id.take() {
            if let Err(e) = self.manager.remove_container(&controller_id) {
                tracing::error!(error = %e, "failed to remove controller container");
            }
        }

        if let Some(mut services) = self.services.take() {
            services.dump_logs(self.manager);
            if let Err(e) = services.teardown(self.manager, &mut self.allocators, self.stop_timeout)
            {
                tracing::error!(error = %e, "failed to tear down service network");
            }
        }

        if let Some(volume_name) = self.volume_name.take() {
            if let Err(e) = self.manager.remove_volume(&volume_name) {
                tracing::error!(error = %e, "failed to remove test volume");
            }
        }

        let network_name = self.manager.network_name();
        tracing::info!(network = %network_name, "attempting to remove docker network");
        match self.manager.remove_network() {
            Ok(()) => tracing::info!(network = %network_name, "docker network removed"),
            Err(e) => tracing::error!(network = %network_name, error = %e, "failed to remove docker network"),
        }
    }
}
