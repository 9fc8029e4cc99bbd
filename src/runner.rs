// Plans and runs a whole test suite from a SuiteConfig
use crate::config::{SuiteConfig, TestDefinition};
use crate::docker::ports::split_port_range;
use crate::docker::runtime::ContainerRuntime;
use crate::errors::{NetError, Result};
use crate::executor::{
    ExecutionSettings, ParallelTestExecutor, ParallelTestParams, StateListener, TestOutcome,
    TestResult,
};
use crate::network::{split_subnets, DeclaredNetwork, NetworkLoader};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

pub struct TestSuiteRunner {
    runtime: Arc<dyn ContainerRuntime>,
    config: SuiteConfig,
    listener: Option<Arc<dyn StateListener>>,
    /// Loaders registered in code, keyed by test name
    loaders: HashMap<String, Arc<dyn NetworkLoader>>,
}

impl TestSuiteRunner {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: SuiteConfig) -> Self {
        Self {
            runtime,
            config,
            listener: None,
            loaders: HashMap::new(),
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn StateListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Use `loader` for the service network of `test_name` instead of the
    /// services declared in the config file.
    pub fn register_network(
        &mut self,
        test_name: impl Into<String>,
        loader: Arc<dyn NetworkLoader>,
    ) {
        self.loaders.insert(test_name.into(), loader);
    }

    pub fn config(&self) -> &SuiteConfig {
        &self.config
    }

    /// Tests selected by `filter` (all tests when empty), in config order
    pub fn select_tests(&self, filter: &[String]) -> Result<Vec<&TestDefinition>> {
        for name in filter {
            if !self.config.tests.iter().any(|t| &t.name == name) {
                return Err(NetError::ConfigError(format!("Unknown test '{}'", name)));
            }
        }
        Ok(self
            .config
            .tests
            .iter()
            .filter(|t| filter.is_empty() || filter.contains(&t.name))
            .collect())
    }

    /// Build the executor's work list: one subnet, one slice of the host
    /// port range and one log file per test
    pub fn plan(&self, execution_id: Uuid, filter: &[String]) -> Result<Vec<ParallelTestParams>> {
        let tests = self.select_tests(filter)?;
        let subnets = split_subnets(
            &self.config.subnet_pool,
            self.config.subnet_prefix_len,
            tests.len(),
        )?;
        let port_ranges: Vec<Option<(u16, u16)>> = match self.config.host_port_range {
            Some(range) => split_port_range(range.start, range.end, tests.len())?
                .into_iter()
                .map(Some)
                .collect(),
            None => vec![None; tests.len()],
        };
        let log_dir = execution_log_dir(&self.config.log_dir, execution_id);

        Ok(tests
            .into_iter()
            .zip(subnets)
            .zip(port_ranges)
            .map(|((test, subnet), host_port_range)| ParallelTestParams {
                test_name: test.name.clone(),
                log_path: log_dir.join(format!("{}.log", test.name)),
                subnet,
                network: self.loader_for(test),
                host_port_range,
            })
            .collect())
    }

    /// Run the selected tests. Only planning and setup failures are returned
    /// as errors; test failures end up in the report.
    pub fn run(&self, filter: &[String]) -> Result<SuiteReport> {
        let execution_id = Uuid::new_v4();
        let params = self.plan(execution_id, filter)?;

        let log_dir = execution_log_dir(&self.config.log_dir, execution_id);
        fs::create_dir_all(&log_dir).map_err(|e| {
            NetError::from(e).context(format!("creating log directory {}", log_dir.display()))
        })?;

        if self.config.pull_images {
            for image in [&self.config.service_image, &self.config.controller_image] {
                tracing::info!(%image, "pulling image");
                self.runtime
                    .pull_image(image)
                    .map_err(|e| e.context(format!("pulling image '{}'", image)))?;
            }
        }

        let executor = ParallelTestExecutor::new(
            execution_id,
            Arc::clone(&self.runtime),
            self.execution_settings()?,
            self.config.parallelism,
        );
        let executor = match &self.listener {
            Some(listener) => executor.with_listener(Arc::clone(listener)),
            None => executor,
        };

        let started_at = Utc::now();
        let results = executor.run_tests_in_parallel(params);
        let finished_at = Utc::now();

        for record in executor.stray_log_records() {
            tracing::debug!(message = %record.message, "log record emitted outside a test");
        }

        Ok(SuiteReport {
            execution_id,
            started_at,
            finished_at,
            log_dir,
            results,
        })
    }

    fn execution_settings(&self) -> Result<ExecutionSettings> {
        let mut settings = ExecutionSettings::new(
            self.config.controller_image.clone(),
            self.config.service_image.clone(),
        );
        settings.controller_log_level = self.config.controller_log_level.clone();
        settings.log_level = self.config.log_level()?;
        settings.test_timeout = self.config.test_timeout;
        settings.stop_timeout = self.config.stop_timeout;
        Ok(settings)
    }

    fn loader_for(&self, test: &TestDefinition) -> Option<Arc<dyn NetworkLoader>> {
        if let Some(loader) = self.loaders.get(&test.name) {
            return Some(Arc::clone(loader));
        }
        if test.services.is_empty() {
            None
        } else {
            Some(Arc::new(DeclaredNetwork::new(test.services.clone())))
        }
    }
}

fn execution_log_dir(log_dir: &Path, execution_id: Uuid) -> PathBuf {
    log_dir.join(execution_id.to_string())
}

/// Outcome of one suite execution
#[derive(Debug)]
pub struct SuiteReport {
    pub execution_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub log_dir: PathBuf,
    pub results: BTreeMap<String, TestResult>,
}

impl SuiteReport {
    pub fn passed_count(&self) -> usize {
        self.results.values().filter(|r| r.passed()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.results
            .values()
            .filter(|r| matches!(r.outcome, TestOutcome::Failed { .. }))
            .count()
    }

    pub fn error_count(&self) -> usize {
        self.results
            .values()
            .filter(|r| r.execution_error().is_some())
            .count()
    }

    pub fn all_passed(&self) -> bool {
        self.passed_count() == self.results.len()
    }

    /// Serializable view of the report
    pub fn to_json_report(&self) -> JsonReport {
        JsonReport {
            execution_id: self.execution_id.to_string(),
            started_at: self.started_at,
            finished_at: self.finished_at,
            passed: self.passed_count(),
            failed: self.failed_count(),
            errors: self.error_count(),
            tests: self
                .results
                .values()
                .map(|result| JsonTestResult {
                    name: result.test_name.clone(),
                    passed: result.passed(),
                    exit_code: match &result.outcome {
                        TestOutcome::Passed => Some(crate::executor::SUCCESS_EXIT_CODE),
                        TestOutcome::Failed { exit_code } => Some(*exit_code),
                        TestOutcome::ExecutionError(e) => e.exit_code(),
                    },
                    execution_error: result.execution_error().map(|e| e.to_string()),
                    log_path: result.log_path.clone(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JsonReport {
    pub execution_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub passed: usize,
    pub failed: usize,
    pub errors: usize,
    pub tests: Vec<JsonTestResult>,
}

#[derive(Debug, Serialize)]
pub struct JsonTestResult {
    pub name: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_error: Option<String>,
    pub log_path: PathBuf,
}
