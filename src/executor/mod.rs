//! Runs many independent test networks concurrently.
//!
//! A fixed number of worker threads pull tests from a closed, pre-loaded
//! queue. Every test gets its own log file, network, allocators and teardown,
//! and its failure is recorded in its own result without touching siblings.

pub mod capture;
pub mod controller;
mod logged;

pub use capture::{CapturedLogRecord, CapturingWriter};
pub use controller::SUCCESS_EXIT_CODE;

use crate::docker::ports;
use crate::docker::runtime::ContainerRuntime;
use crate::errors::{NetError, Result};
use crate::network::builder::DEFAULT_STOP_TIMEOUT;
use crate::network::NetworkLoader;
use logged::LoggedTestExecutor;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{Dispatch, Level};
use uuid::Uuid;

/// Where a test is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TestState {
    Queued,
    NetworkCreating,
    ControllerRunning,
    Finished,
}

/// Observes state transitions of every test in a run.
///
/// Called from worker threads.
pub trait StateListener: Send + Sync {
    fn on_state_change(&self, test_name: &str, state: TestState);
}

/// How a test ended
#[derive(Debug)]
pub enum TestOutcome {
    /// The controller exited with `SUCCESS_EXIT_CODE`
    Passed,
    /// The controller ran to completion and reported failure
    Failed { exit_code: i64 },
    /// Setting up or running the test broke; pass/fail is undefined
    ExecutionError(NetError),
}

#[derive(Debug)]
pub struct TestResult {
    pub test_name: String,
    pub outcome: TestOutcome,
    /// Where this test's isolated log output was written
    pub log_path: PathBuf,
}

impl TestResult {
    pub fn passed(&self) -> bool {
        matches!(self.outcome, TestOutcome::Passed)
    }

    pub fn execution_error(&self) -> Option<&NetError> {
        match &self.outcome {
            TestOutcome::ExecutionError(e) => Some(e),
            _ => None,
        }
    }
}

/// One test to run
#[derive(Clone)]
pub struct ParallelTestParams {
    pub test_name: String,
    /// File the test's log is written to; created (or truncated) by the worker
    pub log_path: PathBuf,
    /// Dedicated CIDR block for this test's network
    pub subnet: String,
    /// Service network to start before the controller, if any
    pub network: Option<Arc<dyn NetworkLoader>>,
    /// Host ports `[start, end)` this test may publish service ports on.
    /// Must not overlap the range of any other test in the same run.
    pub host_port_range: Option<(u16, u16)>,
}

impl std::fmt::Debug for ParallelTestParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelTestParams")
            .field("test_name", &self.test_name)
            .field("log_path", &self.log_path)
            .field("subnet", &self.subnet)
            .field("network", &self.network.is_some())
            .field("host_port_range", &self.host_port_range)
            .finish()
    }
}

/// Settings shared by every test of one execution
#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    pub controller_image: String,
    /// Passed verbatim to the controller
    pub controller_log_level: String,
    /// Image of the service under test
    pub service_image: String,
    /// Level of the orchestrator's own per-test log
    pub log_level: Level,
    /// Total time budget for one controller; `None` waits forever
    pub test_timeout: Option<Duration>,
    pub stop_timeout: Duration,
    pub docker_socket: PathBuf,
}

impl ExecutionSettings {
    pub fn new(controller_image: impl Into<String>, service_image: impl Into<String>) -> Self {
        Self {
            controller_image: controller_image.into(),
            controller_log_level: "info".to_string(),
            service_image: service_image.into(),
            log_level: Level::INFO,
            test_timeout: None,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            docker_socket: PathBuf::from(controller::DOCKER_SOCKET_PATH),
        }
    }
}

pub struct ParallelTestExecutor {
    execution_id: Uuid,
    runtime: Arc<dyn ContainerRuntime>,
    settings: ExecutionSettings,
    parallelism: usize,
    listener: Option<Arc<dyn StateListener>>,
    stray_logs: CapturingWriter,
}

impl ParallelTestExecutor {
    pub fn new(
        execution_id: Uuid,
        runtime: Arc<dyn ContainerRuntime>,
        settings: ExecutionSettings,
        parallelism: usize,
    ) -> Self {
        Self {
            execution_id,
            runtime,
            settings,
            parallelism,
            listener: None,
            stray_logs: CapturingWriter::new(),
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn StateListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    /// Run every test and return one result per distinct test name.
    ///
    /// Never fails as a whole: anything that goes wrong is attached to the
    /// result of the test it happened in. A name that appears more than once
    /// is only run the first time.
    pub fn run_tests_in_parallel(
        &self,
        tests: Vec<ParallelTestParams>,
    ) -> BTreeMap<String, TestResult> {
        let (work_sender, work_receiver) = mpsc::channel();
        let mut seen = BTreeSet::new();
        let mut network_names: BTreeMap<String, String> = BTreeMap::new();
        let mut port_ranges: Vec<(String, (u16, u16))> = Vec::new();
        let mut rejected = Vec::new();
        let mut test_count = 0;
        for params in tests {
            if !seen.insert(params.test_name.clone()) {
                tracing::warn!(test = %params.test_name, "duplicate test name, skipping");
                continue;
            }
            if let Err(e) = self.claim_resources(&params, &mut network_names, &mut port_ranges) {
                tracing::error!(
                    test = %params.test_name,
                    error = %e,
                    "test cannot run alongside the others"
                );
                self.notify(&params.test_name, TestState::Finished);
                rejected.push(TestResult {
                    test_name: params.test_name.clone(),
                    outcome: TestOutcome::ExecutionError(e),
                    log_path: params.log_path,
                });
                continue;
            }
            self.notify(&params.test_name, TestState::Queued);
            // The receiver is alive until this function returns
            let _ = work_sender.send(params);
            test_count += 1;
        }
        drop(work_sender);

        let workers = self.parallelism.clamp(1, test_count.max(1));
        tracing::info!(
            tests = test_count,
            parallelism = workers,
            execution_id = %self.execution_id,
            "launching tests"
        );

        let work_queue = Mutex::new(work_receiver);
        let (result_sender, result_receiver) = mpsc::channel();
        thread::scope(|scope| {
            for worker_index in 0..workers {
                let queue = &work_queue;
                let results = result_sender.clone();
                let spawned = thread::Builder::new()
                    .name(format!("test-worker-{}", worker_index))
                    .spawn_scoped(scope, move || self.run_worker(queue, results));
                if let Err(e) = spawned {
                    tracing::error!(worker = worker_index, error = %e, "failed to spawn test worker");
                }
            }
        });
        drop(result_sender);
        tracing::info!("all test workers exited");

        let mut results: BTreeMap<String, TestResult> = result_receiver
            .into_iter()
            .map(|result: TestResult| (result.test_name.clone(), result))
            .collect();

        for result in rejected {
            results.insert(result.test_name.clone(), result);
        }

        // Only reachable if no worker could be spawned at all
        let leftover = work_queue
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for params in leftover.try_iter() {
            results.insert(
                params.test_name.clone(),
                TestResult {
                    outcome: TestOutcome::ExecutionError(NetError::ConfigError(
                        "no test worker was available to run this test".to_string(),
                    )),
                    test_name: params.test_name,
                    log_path: params.log_path,
                },
            );
        }

        if !self.stray_logs.is_empty() {
            tracing::warn!(
                records = self.stray_logs.records().len(),
                "log records were emitted outside any test's logger"
            );
        }
        results
    }

    /// Log records that reached a worker outside a test's own dispatcher
    pub fn stray_log_records(&self) -> Vec<CapturedLogRecord> {
        self.stray_logs.records()
    }

    /// Reserve the test's network name and host ports for this run.
    ///
    /// Tests share the host, so two tests whose names sanitize to the same
    /// network, or whose host port ranges overlap, would tear into each other.
    fn claim_resources(
        &self,
        params: &ParallelTestParams,
        network_names: &mut BTreeMap<String, String>,
        port_ranges: &mut Vec<(String, (u16, u16))>,
    ) -> Result<()> {
        let network_name = logged::test_network_name(self.execution_id, &params.test_name);
        if let Some(owner) = network_names.get(&network_name) {
            return Err(NetError::ConfigError(format!(
                "Test '{}' would share network '{}' with test '{}'",
                params.test_name, network_name, owner
            )));
        }

        if let Some(range) = params.host_port_range {
            let clash = port_ranges
                .iter()
                .find(|(_, other)| ports::ranges_overlap(range, *other));
            if let Some((owner, other)) = clash {
                return Err(NetError::ConfigError(format!(
                    "Test '{}' host ports {}-{} overlap ports {}-{} of test '{}'",
                    params.test_name, range.0, range.1, other.0, other.1, owner
                )));
            }
            port_ranges.push((params.test_name.clone(), range));
        }

        network_names.insert(network_name, params.test_name.clone());
        Ok(())
    }

    fn run_worker(
        &self,
        queue: &Mutex<mpsc::Receiver<ParallelTestParams>>,
        results: mpsc::Sender<TestResult>,
    ) {
        // Anything logged on this thread outside a test's dispatcher is captured, not written
        let _fallback = tracing::dispatcher::set_default(&self.stray_logs.dispatch());

        loop {
            let next = {
                let receiver = queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                receiver.recv()
            };
            let Ok(params) = next else {
                break;
            };

            let result = self.run_one(&params);
            self.notify(&params.test_name, TestState::Finished);
            if results.send(result).is_err() {
                break;
            }
        }
    }

    fn run_one(&self, params: &ParallelTestParams) -> TestResult {
        let outcome = match File::create(&params.log_path) {
            Ok(log_file) => {
                let dispatch = test_dispatch(log_file, self.settings.log_level);
                tracing::dispatcher::with_default(&dispatch, || self.run_logged(params))
            }
            Err(e) => TestOutcome::ExecutionError(NetError::from(e).context(format!(
                "creating log file {}",
                params.log_path.display()
            ))),
        };

        TestResult {
            test_name: params.test_name.clone(),
            outcome,
            log_path: params.log_path.clone(),
        }
    }

    /// Runs inside the test's own dispatcher
    fn run_logged(&self, params: &ParallelTestParams) -> TestOutcome {
        let executor = LoggedTestExecutor::new(
            self.execution_id,
            Arc::clone(&self.runtime),
            &self.settings,
            self.listener.as_deref(),
        );

        let run = panic::catch_unwind(AssertUnwindSafe(|| executor.run_test(params)));
        let outcome = match run {
            Ok(Ok(exit_code)) if exit_code == SUCCESS_EXIT_CODE => TestOutcome::Passed,
            Ok(Ok(exit_code)) => TestOutcome::Failed { exit_code },
            Ok(Err(e)) => TestOutcome::ExecutionError(e),
            Err(payload) => TestOutcome::ExecutionError(NetError::Panicked {
                test: params.test_name.clone(),
                message: panic_message(payload.as_ref()),
            }),
        };

        match &outcome {
            TestOutcome::Passed => tracing::info!("test passed"),
            TestOutcome::Failed { exit_code } => tracing::info!(exit_code, "test failed"),
            TestOutcome::ExecutionError(e) => {
                tracing::error!(error = %e, "error occurred while running the test")
            }
        }
        outcome
    }

    fn notify(&self, test_name: &str, state: TestState) {
        if let Some(listener) = &self.listener {
            listener.on_state_change(test_name, state);
        }
    }
}

/// Dispatcher that writes one test's log to its own file
fn test_dispatch(log_file: File, level: Level) -> Dispatch {
    let subscriber = tracing_subscriber::fmt()
        .with_writer(Mutex::new(log_file))
        .with_ansi(false)
        .with_max_level(level)
        .with_thread_names(true)
        .finish();
    Dispatch::new(subscriber)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
