use crate::docker::cli::sanitize_name;
use crate::errors::{NetError, Result};
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File looked up in the working directory when no `--config` is given
pub const DEFAULT_CONFIG_FILE: &str = "netorch.yml";

/// Test suite configuration, read from YAML
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SuiteConfig {
    #[serde(default = "default_controller_image")]
    pub controller_image: String,
    /// Image of the service under test
    #[serde(default = "default_service_image")]
    pub service_image: String,
    /// Handed verbatim to controllers
    #[serde(default = "default_controller_log_level")]
    pub controller_log_level: String,
    /// Level of the orchestrator's own per-test logs
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// Pool every test's dedicated subnet is carved from
    #[serde(default = "default_subnet_pool")]
    pub subnet_pool: String,
    #[serde(default = "default_subnet_prefix_len")]
    pub subnet_prefix_len: u8,
    #[serde(default)]
    pub host_port_range: Option<PortRange>,
    #[serde(default, deserialize_with = "deserialize_optional_duration")]
    pub test_timeout: Option<Duration>,
    #[serde(
        default = "default_stop_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub stop_timeout: Duration,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Pull the service and controller images before running
    #[serde(default)]
    pub pull_images: bool,
    #[serde(default)]
    pub tests: Vec<TestDefinition>,
}

/// Host ports `[start, end)` used to publish service ports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestDefinition {
    pub name: String,
    /// Services the orchestrator starts before the controller
    #[serde(default)]
    pub services: Vec<ServiceDefinition>,
}

/// A service declared directly in the config file.
///
/// `command` entries may contain `{ip}` (the service's own address) and
/// `{dep:N}` (the address of dependency `N`).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceDefinition {
    pub id: u32,
    /// Defaults to the image under test
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<u32>,
    /// When set, the service counts as up once its first port accepts TCP connections
    #[serde(default, deserialize_with = "deserialize_optional_duration")]
    pub ready_timeout: Option<Duration>,
}

fn default_controller_image() -> String {
    "netorch/controller:latest".to_string()
}

fn default_service_image() -> String {
    "netorch/service:latest".to_string()
}

fn default_controller_log_level() -> String {
    "info".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_parallelism() -> usize {
    4
}

fn default_subnet_pool() -> String {
    "172.23.0.0/16".to_string()
}

fn default_subnet_prefix_len() -> u8 {
    24
}

fn default_stop_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("netorch-logs")
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self {
            controller_image: default_controller_image(),
            service_image: default_service_image(),
            controller_log_level: default_controller_log_level(),
            log_level: default_log_level(),
            parallelism: default_parallelism(),
            subnet_pool: default_subnet_pool(),
            subnet_prefix_len: default_subnet_prefix_len(),
            host_port_range: None,
            test_timeout: None,
            stop_timeout: default_stop_timeout(),
            log_dir: default_log_dir(),
            pull_images: false,
            tests: Vec::new(),
        }
    }
}

impl SuiteConfig {
    /// Load the config file at `path`
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            NetError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    /// Load `netorch.yml` from `dir`, or defaults if there is none
    pub fn load_or_default(dir: &Path) -> Result<Self> {
        let config_path = dir.join(DEFAULT_CONFIG_FILE);
        if !config_path.exists() {
            return Ok(Self::default());
        }
        Self::load(&config_path)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: SuiteConfig = serde_yml::from_str(content)
            .map_err(|e| NetError::ConfigError(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.parallelism == 0 {
            return Err(NetError::ConfigError(
                "parallelism must be at least 1".to_string(),
            ));
        }
        if let Some(range) = self.host_port_range {
            if range.start >= range.end {
                return Err(NetError::ConfigError(format!(
                    "host_port_range start {} must be below end {}",
                    range.start, range.end
                )));
            }
        }
        // Network, volume and log names are derived from the sanitized test name
        let mut names: HashMap<String, &str> = HashMap::new();
        for test in &self.tests {
            if let Some(other) = names.insert(sanitize_name(&test.name), test.name.as_str()) {
                if other == test.name {
                    return Err(NetError::ConfigError(format!(
                        "test '{}' is defined more than once",
                        test.name
                    )));
                }
                return Err(NetError::ConfigError(format!(
                    "tests '{}' and '{}' differ only in case or punctuation",
                    other, test.name
                )));
            }
        }
        parse_log_level(&self.log_level)?;
        Ok(())
    }

    /// Level of the orchestrator's per-test logs
    pub fn log_level(&self) -> Result<tracing::Level> {
        parse_log_level(&self.log_level)
    }
}

fn parse_log_level(level: &str) -> Result<tracing::Level> {
    level
        .parse::<tracing::Level>()
        .map_err(|_| NetError::ConfigError(format!("Invalid log level: {}", level)))
}

/// Parse a duration string ("30s", "5m", or bare seconds)
pub fn parse_duration(value: &str) -> Result<Duration> {
    let value = value.trim();
    let invalid = || NetError::ConfigError(format!("Invalid duration value: {}", value));

    if let Some(num_str) = value.strip_suffix('s') {
        num_str
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| invalid())
    } else if let Some(num_str) = value.strip_suffix('m') {
        let minutes = num_str.parse::<u64>().map_err(|_| invalid())?;
        Ok(Duration::from_secs(minutes * 60))
    } else {
        // Default to seconds if no unit specified
        value
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| invalid())
    }
}

/// YAML may carry a duration as a string or a bare integer
#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(u64),
    Text(String),
}

impl RawDuration {
    fn into_duration(self) -> Result<Duration> {
        match self {
            RawDuration::Seconds(secs) => Ok(Duration::from_secs(secs)),
            RawDuration::Text(text) => parse_duration(&text),
        }
    }
}

fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    RawDuration::deserialize(deserializer)?
        .into_duration()
        .map_err(D::Error::custom)
}

fn deserialize_optional_duration<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    match Option::<RawDuration>::deserialize(deserializer)? {
        Some(raw) => raw.into_duration().map(Some).map_err(D::Error::custom),
        None => Ok(None),
    }
}
