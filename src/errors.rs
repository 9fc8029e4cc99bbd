use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

use crate::network::builder::{ConfigurationId, ServiceId};

/// Exit code reported alongside a failed container wait.
pub const WAIT_FAILURE_EXIT_CODE: i64 = 1;

/// Broad classes of failure, used by callers to decide how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller bug: unknown configuration or dependency reference, bad config file.
    Configuration,
    /// A container, network or volume operation failed.
    Runtime,
    /// No free IP address or host port left.
    ResourceExhausted,
    /// An availability check never succeeded within its budget.
    ReadinessTimeout,
    /// A test exceeded its total time budget.
    Timeout,
    Io,
}

#[derive(Error, Debug)]
pub enum NetError {
    #[error("Unknown service configuration ID {0}")]
    UnknownConfiguration(ConfigurationId),

    #[error("Service {service} declares dependency on {dependency}, which has not been declared")]
    UnknownDependency {
        service: ServiceId,
        dependency: ServiceId,
    },

    #[error("Service ID {0} is already declared in this network")]
    DuplicateService(ServiceId),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Invalid subnet '{0}'")]
    InvalidSubnet(String),

    #[error("Address {addr} does not belong to the address family of subnet {subnet}")]
    UnsupportedAddressFamily { subnet: String, addr: IpAddr },

    #[error("Network '{0}' was never created; create it before launching containers")]
    NetworkNotReady(String),

    #[error("docker {operation} failed: {message}")]
    Runtime { operation: String, message: String },

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<NetError>,
    },

    #[error("Failed waiting for container {container_id} to exit: {message}")]
    WaitFailed {
        container_id: String,
        message: String,
    },

    #[error("No free IP addresses left on subnet {0}")]
    AddressSpaceExhausted(String),

    #[error("No free host ports left in range {start}-{end}")]
    PortRangeExhausted { start: u16, end: u16 },

    #[error("Port {0} is not currently allocated")]
    PortNotAllocated(u16),

    #[error("Service {service} did not become available within {timeout:?}")]
    ReadinessTimeout { service: ServiceId, timeout: Duration },

    #[error("Failed to start service {service}: {source}")]
    ServiceStartFailed {
        service: ServiceId,
        #[source]
        source: Box<NetError>,
    },

    #[error("Test '{test}' did not finish within {timeout:?}")]
    TestTimeout { test: String, timeout: Duration },

    #[error("Test '{test}' panicked: {message}")]
    Panicked { test: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl NetError {
    /// Wrap this error with a description of the operation that failed.
    pub fn context(self, context: impl Into<String>) -> Self {
        NetError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Classify the error, looking through any wrapping layers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            NetError::Context { source, .. } | NetError::ServiceStartFailed { source, .. } => {
                source.kind()
            }
            NetError::UnknownConfiguration(_)
            | NetError::UnknownDependency { .. }
            | NetError::DuplicateService(_)
            | NetError::ConfigError(_)
            | NetError::InvalidSubnet(_)
            | NetError::UnsupportedAddressFamily { .. } => ErrorKind::Configuration,
            NetError::NetworkNotReady(_)
            | NetError::Runtime { .. }
            | NetError::WaitFailed { .. }
            | NetError::Panicked { .. } => ErrorKind::Runtime,
            NetError::AddressSpaceExhausted(_)
            | NetError::PortRangeExhausted { .. }
            | NetError::PortNotAllocated(_) => ErrorKind::ResourceExhausted,
            NetError::ReadinessTimeout { .. } => ErrorKind::ReadinessTimeout,
            NetError::TestTimeout { .. } => ErrorKind::Timeout,
            NetError::Io(_) | NetError::Json(_) => ErrorKind::Io,
        }
    }

    /// Sentinel exit code for a failed container wait, if this is one.
    pub fn exit_code(&self) -> Option<i64> {
        match self {
            NetError::WaitFailed { .. } => Some(WAIT_FAILURE_EXIT_CODE),
            NetError::Context { source, .. } => source.exit_code(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, NetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_looks_through_context() {
        let err = NetError::PortRangeExhausted {
            start: 9000,
            end: 9002,
        }
        .context("allocating host port")
        .context("starting service 3");
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    }

    #[test]
    fn test_service_start_failure_keeps_cause_kind() {
        let err = NetError::ServiceStartFailed {
            service: 4,
            source: Box::new(NetError::ReadinessTimeout {
                service: 4,
                timeout: Duration::from_secs(30),
            }),
        };
        assert_eq!(err.kind(), ErrorKind::ReadinessTimeout);
        assert!(err.to_string().contains("service 4"));
    }

    #[test]
    fn test_wait_failure_carries_sentinel_exit_code() {
        let err = NetError::WaitFailed {
            container_id: "abc".to_string(),
            message: "daemon went away".to_string(),
        }
        .context("waiting for controller");
        assert_eq!(err.exit_code(), Some(WAIT_FAILURE_EXIT_CODE));
        assert_eq!(NetError::DuplicateService(1).exit_code(), None);
    }
}
