// Container, network and volume lifecycle for one test network
// Policy layer over a ContainerRuntime: pull-if-missing, network-first, two-step static IP attach

use crate::clock::{Clock, SystemClock};
use crate::docker::runtime::{ContainerRuntime, ContainerSpec};
use crate::errors::{NetError, Result};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Network name used when a caller does not ask for a per-run network
pub const DEFAULT_NETWORK_NAME: &str = "netorch-bridge";

/// Extra time granted to the runtime to report the exit after a timed-out stop
const POST_STOP_GRACE: Duration = Duration::from_secs(30);

/// Manages containers attached to a single bridge network
pub struct LifecycleManager {
    runtime: Arc<dyn ContainerRuntime>,
    network_name: String,
    clock: Arc<dyn Clock>,
}

impl LifecycleManager {
    /// Create a manager for the network called `network_name`.
    ///
    /// The network itself is not created until `create_network` is called.
    pub fn new(runtime: Arc<dyn ContainerRuntime>, network_name: impl Into<String>) -> Self {
        Self::with_clock(runtime, network_name, Arc::new(SystemClock))
    }

    /// Manager for the well-known network shared by runs that do not isolate
    pub fn shared(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self::new(runtime, DEFAULT_NETWORK_NAME)
    }

    pub fn with_clock(
        runtime: Arc<dyn ContainerRuntime>,
        network_name: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            runtime,
            network_name: network_name.into(),
            clock,
        }
    }

    pub fn network_name(&self) -> &str {
        &self.network_name
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Create the bridge network, or return the ID of the existing one with the same name
    pub fn create_network(&self, subnet: &str, gateway: IpAddr) -> Result<String> {
        let existing = self
            .runtime
            .find_network(&self.network_name)
            .map_err(|e| e.context(format!("checking for network '{}'", self.network_name)))?;

        if let Some(network_id) = existing {
            tracing::debug!(network = %self.network_name, %network_id, "network already exists");
            return Ok(network_id);
        }

        let network_id = self
            .runtime
            .create_network(&self.network_name, subnet, gateway)
            .map_err(|e| {
                e.context(format!(
                    "creating network '{}' with subnet {}",
                    self.network_name, subnet
                ))
            })?;
        tracing::info!(network = %self.network_name, %subnet, %gateway, "created network");
        Ok(network_id)
    }

    pub fn remove_network(&self) -> Result<()> {
        self.runtime
            .remove_network(&self.network_name)
            .map_err(|e| e.context(format!("removing network '{}'", self.network_name)))
    }

    /// Create a named volume, returning its mountpoint on the host
    pub fn create_volume(&self, name: &str) -> Result<PathBuf> {
        self.runtime
            .create_volume(name)
            .map_err(|e| e.context(format!("creating volume '{}'", name)))
    }

    pub fn remove_volume(&self, name: &str) -> Result<()> {
        self.runtime
            .remove_volume(name)
            .map_err(|e| e.context(format!("removing volume '{}'", name)))
    }

    /// Create a container, attach it to the network at `static_ip`, and start it.
    ///
    /// Returns the assigned address and the container ID.
    pub fn create_and_start_container(
        &self,
        spec: &ContainerSpec,
        static_ip: IpAddr,
    ) -> Result<(IpAddr, String)> {
        self.ensure_image(&spec.image)?;

        let network_exists = self
            .runtime
            .find_network(&self.network_name)
            .map_err(|e| e.context(format!("checking for network '{}'", self.network_name)))?
            .is_some();
        if !network_exists {
            return Err(NetError::NetworkNotReady(self.network_name.clone()));
        }

        let container_id = self
            .runtime
            .create_container(spec)
            .map_err(|e| e.context(format!("creating container from image '{}'", spec.image)))?;

        // The runtime cannot create-with-static-IP on a user bridge in one call
        if let Err(e) = self
            .runtime
            .connect_network(&self.network_name, &container_id, static_ip)
        {
            self.discard(&container_id);
            return Err(e.context(format!(
                "connecting container {} to network '{}' at {}",
                container_id, self.network_name, static_ip
            )));
        }

        if let Err(e) = self.runtime.start_container(&container_id) {
            self.discard(&container_id);
            return Err(e.context(format!(
                "starting container {} from image '{}'",
                container_id, spec.image
            )));
        }

        tracing::info!(
            image = %spec.image,
            container_id = %container_id,
            ip = %static_ip,
            "started container"
        );
        Ok((static_ip, container_id))
    }

    /// Stop gracefully, force-killing after `timeout`
    pub fn stop_container(&self, container_id: &str, timeout: Duration) -> Result<()> {
        self.runtime
            .stop_container(container_id, timeout)
            .map_err(|e| e.context(format!("stopping container {}", container_id)))
    }

    pub fn remove_container(&self, container_id: &str) -> Result<()> {
        self.runtime
            .remove_container(container_id)
            .map_err(|e| e.context(format!("removing container {}", container_id)))
    }

    pub fn container_logs(&self, container_id: &str) -> Result<Vec<u8>> {
        self.runtime
            .container_logs(container_id)
            .map_err(|e| e.context(format!("reading logs of container {}", container_id)))
    }

    /// Block until the container stops running and return its exit code.
    ///
    /// A failed wait is reported as `WaitFailed`, whose `exit_code()` is the
    /// non-zero sentinel.
    pub fn wait_for_exit(&self, container_id: &str) -> Result<i64> {
        self.runtime
            .wait_container(container_id)
            .map_err(|e| NetError::WaitFailed {
                container_id: container_id.to_string(),
                message: e.to_string(),
            })
    }

    /// Like `wait_for_exit`, but stops the container once `timeout` elapses and
    /// reports `TestTimeout` for `test_name`.
    pub fn wait_for_exit_timeout(
        &self,
        container_id: &str,
        timeout: Duration,
        stop_timeout: Duration,
        test_name: &str,
    ) -> Result<i64> {
        let (sender, receiver) = mpsc::channel();
        let runtime = Arc::clone(&self.runtime);
        let waited_id = container_id.to_string();
        thread::spawn(move || {
            let result = runtime.wait_container(&waited_id);
            // The receiver is gone if the caller already gave up
            let _ = sender.send(result);
        });

        match receiver.recv_timeout(timeout) {
            Ok(result) => result.map_err(|e| NetError::WaitFailed {
                container_id: container_id.to_string(),
                message: e.to_string(),
            }),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(NetError::WaitFailed {
                container_id: container_id.to_string(),
                message: "wait thread exited without a result".to_string(),
            }),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    container_id = %container_id,
                    ?timeout,
                    "container exceeded its time budget, stopping it"
                );
                if let Err(e) = self.stop_container(container_id, stop_timeout) {
                    tracing::error!(error = %e, "failed to stop timed-out container");
                }
                // Let the wait thread observe the stop so it does not outlive the run
                let _ = receiver.recv_timeout(stop_timeout + POST_STOP_GRACE);
                Err(NetError::TestTimeout {
                    test: test_name.to_string(),
                    timeout,
                })
            }
        }
    }

    fn ensure_image(&self, image: &str) -> Result<()> {
        let present = self
            .runtime
            .image_exists(image)
            .map_err(|e| e.context(format!("checking for image '{}'", image)))?;

        if !present {
            tracing::info!(%image, "pulling image");
            self.runtime
                .pull_image(image)
                .map_err(|e| e.context(format!("pulling image '{}'", image)))?;
        }
        Ok(())
    }

    /// Best-effort removal of a container that failed half-way through startup
    fn discard(&self, container_id: &str) {
        if let Err(e) = self.runtime.remove_container(container_id) {
            tracing::warn!(container_id = %container_id, error = %e, "failed to remove container");
        }
    }
}
