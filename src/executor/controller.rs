// Contract between the orchestrator and a test controller image
use std::collections::BTreeMap;
use std::net::IpAddr;

/// Exit code a controller uses to report that its test passed
pub const SUCCESS_EXIT_CODE: i64 = 0;

/// Where the controller's log file is mounted inside its container
pub const CONTROLLER_LOG_MOUNT_FILEPATH: &str = "/controller.log";

/// Where the per-test shared volume is mounted inside the controller
pub const TEST_VOLUME_MOUNTPOINT: &str = "/shared";

/// Host path of the container runtime socket handed to the controller
pub const DOCKER_SOCKET_PATH: &str = "/var/run/docker.sock";

pub const TEST_NAME_ENV: &str = "TEST_NAME";
pub const SUBNET_MASK_ENV: &str = "SUBNET_MASK";
pub const NETWORK_NAME_ENV: &str = "NETWORK_NAME";
pub const GATEWAY_IP_ENV: &str = "GATEWAY_IP";
pub const LOG_FILEPATH_ENV: &str = "LOG_FILEPATH";
pub const LOG_LEVEL_ENV: &str = "LOG_LEVEL";
pub const TEST_IMAGE_NAME_ENV: &str = "TEST_IMAGE_NAME";
pub const TEST_CONTROLLER_IP_ENV: &str = "TEST_CONTROLLER_IP";
pub const TEST_VOLUME_ENV: &str = "TEST_VOLUME";
pub const TEST_VOLUME_MOUNTPOINT_ENV: &str = "TEST_VOLUME_MOUNTPOINT";

/// Everything a controller is told about the environment it runs in
#[derive(Debug, Clone)]
pub struct ControllerContext<'a> {
    pub test_name: &'a str,
    /// CIDR of the test network
    pub subnet: &'a str,
    pub network_name: &'a str,
    pub gateway_ip: IpAddr,
    pub controller_ip: IpAddr,
    /// Passed through verbatim; only the controller image interprets it
    pub log_level: &'a str,
    /// Image of the service under test, for the nodes the controller starts
    pub service_image: &'a str,
    pub volume_name: &'a str,
}

/// Environment variables handed to every controller container.
///
/// This is the complete list; controller images rely on these names.
pub fn controller_env(ctx: &ControllerContext<'_>) -> BTreeMap<String, String> {
    [
        (TEST_NAME_ENV, ctx.test_name.to_string()),
        (SUBNET_MASK_ENV, ctx.subnet.to_string()),
        (NETWORK_NAME_ENV, ctx.network_name.to_string()),
        (GATEWAY_IP_ENV, ctx.gateway_ip.to_string()),
        (LOG_FILEPATH_ENV, CONTROLLER_LOG_MOUNT_FILEPATH.to_string()),
        (LOG_LEVEL_ENV, ctx.log_level.to_string()),
        (TEST_IMAGE_NAME_ENV, ctx.service_image.to_string()),
        (TEST_CONTROLLER_IP_ENV, ctx.controller_ip.to_string()),
        (TEST_VOLUME_ENV, ctx.volume_name.to_string()),
        (
            TEST_VOLUME_MOUNTPOINT_ENV,
            TEST_VOLUME_MOUNTPOINT.to_string(),
        ),
    ]
    .into_iter()
    .map(|(key, value)| (key.to_string(), value))
    .collect()
}
