/// Common test utilities for netorch integration tests
use netorch::docker::runtime::{ContainerRuntime, ContainerSpec};
use netorch::errors::{NetError, Result};
use netorch::executor::controller::TEST_NAME_ENV;
use netorch::services::{AvailabilityChecker, Service, ServiceHandle, ServiceInitializer};
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::File;
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// One call made against the fake runtime
#[derive(Debug, Clone, PartialEq)]
#[allow(dead_code)]
pub enum Call {
    FindNetwork(String),
    CreateNetwork {
        name: String,
        subnet: String,
        gateway: IpAddr,
    },
    RemoveNetwork(String),
    CreateVolume(String),
    RemoveVolume(String),
    PullImage(String),
    CreateContainer(ContainerSpec),
    ConnectNetwork {
        network: String,
        container_id: String,
        ip: IpAddr,
    },
    StartContainer(String),
    StopContainer(String),
    WaitContainer(String),
    RemoveContainer(String),
}

/// How a controller container (matched by its TEST_NAME env) exits
#[derive(Debug, Clone, Copy)]
#[allow(dead_code)]
pub enum Exit {
    Code(i64),
    /// Never exits on its own; only a stop ends the wait
    Hang,
    /// The wait itself fails
    WaitError,
}

#[derive(Debug)]
struct FakeContainer {
    spec: ContainerSpec,
    stopped: bool,
}

#[derive(Default)]
struct FakeState {
    calls: Vec<Call>,
    networks: BTreeMap<String, String>,
    images: BTreeSet<String>,
    volumes: BTreeSet<String>,
    containers: BTreeMap<String, FakeContainer>,
    next_id: u32,
    /// Operation name -> substrings of the identifying argument that make it fail
    failures: Vec<(&'static str, String)>,
    exits: HashMap<String, Exit>,
    logs: HashMap<String, Vec<u8>>,
}

/// In-memory container runtime that records every call
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
    stopped: Condvar,
    wait_delay: Duration,
    waiting_now: AtomicUsize,
    max_waiting: AtomicUsize,
}

#[allow(dead_code)]
impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every wait takes at least this long
    pub fn with_wait_delay(mut self, delay: Duration) -> Self {
        self.wait_delay = delay;
        self
    }

    /// Make `operation` fail whenever its identifying argument contains `needle`.
    ///
    /// Operations: "network create", "network rm", "volume create", "create",
    /// "network connect", "start", "stop", "rm", "pull".
    pub fn fail_on(self, operation: &'static str, needle: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .failures
            .push((operation, needle.to_string()));
        self
    }

    pub fn with_image(self, image: &str) -> Self {
        self.state.lock().unwrap().images.insert(image.to_string());
        self
    }

    /// Pre-create a network with this name
    pub fn with_network(self, name: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .networks
            .insert(name.to_string(), format!("net-{}", name));
        self
    }

    /// How the controller of `test_name` exits (default: code 0)
    pub fn exit_for(self, test_name: &str, exit: Exit) -> Self {
        self.state
            .lock()
            .unwrap()
            .exits
            .insert(test_name.to_string(), exit);
        self
    }

    /// Output returned for containers created from `image`
    pub fn logs_for_image(self, image: &str, output: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .logs
            .insert(image.to_string(), output.as_bytes().to_vec());
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn created_specs(&self) -> Vec<ContainerSpec> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::CreateContainer(spec) => Some(spec),
                _ => None,
            })
            .collect()
    }

    pub fn count_calls(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|call| predicate(call)).count()
    }

    /// Containers created and not yet removed
    pub fn live_containers(&self) -> Vec<String> {
        self.state.lock().unwrap().containers.keys().cloned().collect()
    }

    pub fn networks(&self) -> Vec<String> {
        self.state.lock().unwrap().networks.keys().cloned().collect()
    }

    pub fn volumes(&self) -> Vec<String> {
        self.state.lock().unwrap().volumes.iter().cloned().collect()
    }

    /// Most container waits that were ever in progress at the same time
    pub fn max_concurrent_waits(&self) -> usize {
        self.max_waiting.load(Ordering::SeqCst)
    }

    fn record(&self, state: &mut FakeState, call: Call) {
        state.calls.push(call);
    }

    fn check_failure(state: &FakeState, operation: &str, argument: &str) -> Result<()> {
        let injected = state
            .failures
            .iter()
            .any(|(op, needle)| *op == operation && argument.contains(needle.as_str()));
        if injected {
            return Err(NetError::Runtime {
                operation: operation.to_string(),
                message: format!("injected failure for {}", argument),
            });
        }
        Ok(())
    }
}

impl ContainerRuntime for FakeRuntime {
    fn find_network(&self, name: &str) -> Result<Option<String>> {
        let mut state = self.state.lock().unwrap();
        self.record(&mut state, Call::FindNetwork(name.to_string()));
        Ok(state.networks.get(name).cloned())
    }

    fn create_network(&self, name: &str, subnet: &str, gateway: IpAddr) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        self.record(
            &mut state,
            Call::CreateNetwork {
                name: name.to_string(),
                subnet: subnet.to_string(),
                gateway,
            },
        );
        Self::check_failure(&state, "network create", name)?;
        if state.networks.contains_key(name) {
            return Err(NetError::Runtime {
                operation: "network create".to_string(),
                message: format!("network with name {} already exists", name),
            });
        }
        let id = format!("net-{}", name);
        state.networks.insert(name.to_string(), id.clone());
        Ok(id)
    }

    fn remove_network(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        self.record(&mut state, Call::RemoveNetwork(name.to_string()));
        Self::check_failure(&state, "network rm", name)?;
        state
            .networks
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| NetError::Runtime {
                operation: "network rm".to_string(),
                message: format!("network {} not found", name),
            })
    }

    fn create_volume(&self, name: &str) -> Result<PathBuf> {
        let mut state = self.state.lock().unwrap();
        self.record(&mut state, Call::CreateVolume(name.to_string()));
        Self::check_failure(&state, "volume create", name)?;
        state.volumes.insert(name.to_string());
        Ok(PathBuf::from(format!("/var/lib/docker/volumes/{}/_data", name)))
    }

    fn remove_volume(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        self.record(&mut state, Call::RemoveVolume(name.to_string()));
        state.volumes.remove(name);
        Ok(())
    }

    fn image_exists(&self, image: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().images.contains(image))
    }

    fn pull_image(&self, image: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        self.record(&mut state, Call::PullImage(image.to_string()));
        Self::check_failure(&state, "pull", image)?;
        state.images.insert(image.to_string());
        Ok(())
    }

    fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        self.record(&mut state, Call::CreateContainer(spec.clone()));
        Self::check_failure(&state, "create", &spec.image)?;
        state.next_id += 1;
        let id = format!("container-{}", state.next_id);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                spec: spec.clone(),
                stopped: false,
            },
        );
        Ok(id)
    }

    fn connect_network(&self, network: &str, container_id: &str, ip: IpAddr) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        self.record(
            &mut state,
            Call::ConnectNetwork {
                network: network.to_string(),
                container_id: container_id.to_string(),
                ip,
            },
        );
        Self::check_failure(&state, "network connect", &ip.to_string())?;
        if !state.networks.contains_key(network) {
            return Err(NetError::Runtime {
                operation: "network connect".to_string(),
                message: format!("network {} not found", network),
            });
        }
        if !state.containers.contains_key(container_id) {
            return Err(NetError::Runtime {
                operation: "network connect".to_string(),
                message: format!("no such container {}", container_id),
            });
        }
        Ok(())
    }

    fn start_container(&self, container_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        self.record(&mut state, Call::StartContainer(container_id.to_string()));
        let image = state
            .containers
            .get(container_id)
            .map(|c| c.spec.image.clone())
            .unwrap_or_default();
        Self::check_failure(&state, "start", &image)?;
        Ok(())
    }

    fn stop_container(&self, container_id: &str, _timeout: Duration) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        self.record(&mut state, Call::StopContainer(container_id.to_string()));
        Self::check_failure(&state, "stop", container_id)?;
        if let Some(container) = state.containers.get_mut(container_id) {
            container.stopped = true;
        }
        self.stopped.notify_all();
        Ok(())
    }

    fn wait_container(&self, container_id: &str) -> Result<i64> {
        let exit = {
            let mut state = self.state.lock().unwrap();
            self.record(&mut state, Call::WaitContainer(container_id.to_string()));
            let test_name = state
                .containers
                .get(container_id)
                .and_then(|c| c.spec.env.get(TEST_NAME_ENV).cloned())
                .unwrap_or_default();
            state.exits.get(&test_name).copied().unwrap_or(Exit::Code(0))
        };

        let now = self.waiting_now.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_waiting.fetch_max(now, Ordering::SeqCst);

        let result = {
            let state = self.state.lock().unwrap();
            let (state, _) = self
                .stopped
                .wait_timeout_while(state, self.wait_delay, |s| {
                    !s.containers.get(container_id).map_or(true, |c| c.stopped)
                })
                .unwrap();
            match exit {
                Exit::Code(code) => Ok(code),
                Exit::WaitError => Err(NetError::Runtime {
                    operation: "wait".to_string(),
                    message: "daemon connection reset".to_string(),
                }),
                Exit::Hang => {
                    let mut state = state;
                    while state.containers.get(container_id).map_or(false, |c| !c.stopped) {
                        state = self.stopped.wait(state).unwrap();
                    }
                    // Killed by the stop
                    Ok(137)
                }
            }
        };

        self.waiting_now.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn remove_container(&self, container_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        self.record(&mut state, Call::RemoveContainer(container_id.to_string()));
        Self::check_failure(&state, "rm", container_id)?;
        if let Some(container) = state.containers.get_mut(container_id) {
            container.stopped = true;
        }
        state.containers.remove(container_id);
        self.stopped.notify_all();
        Ok(())
    }

    fn container_logs(&self, container_id: &str) -> Result<Vec<u8>> {
        let state = self.state.lock().unwrap();
        let image = state
            .containers
            .get(container_id)
            .map(|c| c.spec.image.clone())
            .unwrap_or_default();
        Ok(state.logs.get(&image).cloned().unwrap_or_default())
    }
}

/// Service handle that only knows its address
#[derive(Debug)]
pub struct TestService {
    pub ip: IpAddr,
}

impl Service for TestService {
    fn ip_addr(&self) -> IpAddr {
        self.ip
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Initializer that records what it was fed
#[derive(Default)]
pub struct TestInitializer {
    pub ports: BTreeSet<u16>,
    pub files: BTreeSet<String>,
    /// (own address, dependency addresses) per start_command call
    pub starts: Mutex<Vec<(IpAddr, Vec<IpAddr>)>>,
    /// Container paths handed to initialize_mounted_files
    pub initialized: Mutex<Vec<String>>,
}

#[allow(dead_code)]
impl TestInitializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ports(mut self, ports: &[u16]) -> Self {
        self.ports = ports.iter().copied().collect();
        self
    }

    pub fn with_files(mut self, files: &[&str]) -> Self {
        self.files = files.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn starts(&self) -> Vec<(IpAddr, Vec<IpAddr>)> {
        self.starts.lock().unwrap().clone()
    }
}

impl ServiceInitializer for TestInitializer {
    fn used_ports(&self) -> BTreeSet<u16> {
        self.ports.clone()
    }

    fn start_command(
        &self,
        ip_addr: IpAddr,
        dependencies: &[ServiceHandle],
    ) -> Result<Vec<String>> {
        let dependency_ips: Vec<IpAddr> = dependencies.iter().map(|d| d.ip_addr()).collect();
        let mut command = vec!["serve".to_string(), format!("--ip={}", ip_addr)];
        command.extend(dependency_ips.iter().map(|ip| format!("--peer={}", ip)));
        self.starts.lock().unwrap().push((ip_addr, dependency_ips));
        Ok(command)
    }

    fn service_from_ip(&self, ip_addr: IpAddr) -> ServiceHandle {
        Arc::new(TestService { ip: ip_addr })
    }

    fn files_to_mount(&self) -> BTreeSet<String> {
        self.files.clone()
    }

    fn initialize_mounted_files(
        &self,
        mounted_files: &mut HashMap<String, File>,
        _dependencies: &[ServiceHandle],
    ) -> Result<()> {
        for (path, file) in mounted_files.iter_mut() {
            writeln!(file, "config for {}", path)?;
            self.initialized.lock().unwrap().push(path.clone());
        }
        Ok(())
    }
}

/// Reports ready after a fixed number of polls (never, when `None`)
pub struct CountingChecker {
    pub ready_after: Option<u32>,
    pub timeout: Duration,
    pub polls: AtomicU32,
}

#[allow(dead_code)]
impl CountingChecker {
    pub fn ready_after(polls: u32) -> Self {
        Self {
            ready_after: Some(polls),
            timeout: Duration::from_secs(5),
            polls: AtomicU32::new(0),
        }
    }

    pub fn never_ready(timeout: Duration) -> Self {
        Self {
            ready_after: None,
            timeout,
            polls: AtomicU32::new(0),
        }
    }
}

impl AvailabilityChecker for CountingChecker {
    fn is_service_up(&self, _to_check: &dyn Service, _dependencies: &[ServiceHandle]) -> bool {
        let polls = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
        self.ready_after.map_or(false, |needed| polls >= needed)
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Result of running the netorch binary
#[allow(dead_code)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    pub exit_code: Option<i32>,
}

#[allow(dead_code)]
impl CommandResult {
    /// Assert the command succeeded
    pub fn assert_success(&self) {
        if !self.success {
            panic!(
                "Command failed:\nstdout: {}\nstderr: {}\nexit code: {:?}",
                self.stdout, self.stderr, self.exit_code
            );
        }
    }

    /// Assert the command failed
    pub fn assert_failure(&self) {
        if self.success {
            panic!(
                "Command succeeded when it should have failed:\nstdout: {}\nstderr: {}",
                self.stdout, self.stderr
            );
        }
    }

    /// Assert stdout contains text
    pub fn assert_stdout_contains(&self, text: &str) {
        assert!(
            self.stdout.contains(text),
            "stdout does not contain '{}'\nstdout: {}",
            text,
            self.stdout
        );
    }
}

/// Run the netorch binary in `dir`
#[allow(dead_code)]
pub fn netorch(dir: &Path, args: &[&str]) -> CommandResult {
    let output = Command::new(env!("CARGO_BIN_EXE_netorch"))
        .args(args)
        .current_dir(dir)
        .env("NO_COLOR", "1")
        .output()
        .expect("Failed to execute netorch command");

    CommandResult {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        success: output.status.success(),
        exit_code: output.status.code(),
    }
}
