// Docker runtime client backed by the docker CLI
// Every call is an argument vector, never a shell string

use crate::docker::runtime::{ContainerRuntime, ContainerSpec};
use crate::errors::{NetError, Result};
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

/// Talks to the Docker daemon through the `docker` binary
#[derive(Debug, Clone)]
pub struct DockerCli {
    program: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerCli {
    pub fn new() -> Self {
        Self::with_program("docker")
    }

    /// Use a different docker-compatible binary (e.g. `podman`)
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Check if the docker binary is installed and answers
    pub fn is_available(&self) -> bool {
        Command::new(&self.program)
            .arg("--version")
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    /// Run the binary and return trimmed stdout, or a runtime error carrying stderr
    fn run(&self, operation: &str, args: &[String]) -> Result<String> {
        tracing::trace!(program = %self.program, ?args, "invoking container runtime");
        let output = Command::new(&self.program).args(args).output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(NetError::Runtime {
                operation: operation.to_string(),
                message: stderr.trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// `docker network ls` filtered to an exact name
fn build_find_network_args(name: &str) -> Vec<String> {
    vec![
        "network".to_string(),
        "ls".to_string(),
        "--filter".to_string(),
        format!("name=^{}$", name),
        "--format".to_string(),
        "{{.ID}}".to_string(),
    ]
}

fn build_create_network_args(name: &str, subnet: &str, gateway: IpAddr) -> Vec<String> {
    let mut args = vec![
        "network".to_string(),
        "create".to_string(),
        "--driver".to_string(),
        "bridge".to_string(),
    ];
    if gateway.is_ipv6() {
        args.push("--ipv6".to_string());
    }
    args.extend([
        "--subnet".to_string(),
        subnet.to_string(),
        "--gateway".to_string(),
        gateway.to_string(),
        name.to_string(),
    ]);
    args
}

/// `docker create` for a container spec; the network is attached separately
fn build_create_container_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec!["create".to_string()];

    if let Some(name) = &spec.name {
        args.push("--name".to_string());
        args.push(name.clone());
    }

    for port in &spec.exposed_ports {
        args.push("--expose".to_string());
        args.push(format!("{}/tcp", port));
    }

    for (container_port, host_port) in &spec.port_bindings {
        args.push("--publish".to_string());
        args.push(format!("{}:{}/tcp", host_port, container_port));
    }

    for (key, value) in &spec.env {
        args.push("--env".to_string());
        args.push(format!("{}={}", key, value));
    }

    for (host_path, container_path) in &spec.bind_mounts {
        args.push("--volume".to_string());
        args.push(format!("{}:{}", host_path.display(), container_path));
    }

    for (volume, container_path) in &spec.volume_mounts {
        args.push("--mount".to_string());
        args.push(format!("type=volume,source={},target={}", volume, container_path));
    }

    args.push(spec.image.clone());

    if let Some(command) = &spec.command {
        args.extend(command.iter().cloned());
    }

    args
}

fn build_connect_args(network: &str, container_id: &str, ip: IpAddr) -> Vec<String> {
    let flag = match ip {
        IpAddr::V4(_) => "--ip",
        IpAddr::V6(_) => "--ip6",
    };
    vec![
        "network".to_string(),
        "connect".to_string(),
        flag.to_string(),
        ip.to_string(),
        network.to_string(),
        container_id.to_string(),
    ]
}

fn build_stop_args(container_id: &str, timeout: Duration) -> Vec<String> {
    // Whole seconds only; round up so a short grace period is not a kill
    let seconds = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
    vec![
        "stop".to_string(),
        "--time".to_string(),
        seconds.to_string(),
        container_id.to_string(),
    ]
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

impl ContainerRuntime for DockerCli {
    fn find_network(&self, name: &str) -> Result<Option<String>> {
        let stdout = self.run("network ls", &build_find_network_args(name))?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string))
    }

    fn create_network(&self, name: &str, subnet: &str, gateway: IpAddr) -> Result<String> {
        self.run(
            "network create",
            &build_create_network_args(name, subnet, gateway),
        )
    }

    fn remove_network(&self, name: &str) -> Result<()> {
        self.run("network rm", &args(&["network", "rm", name]))?;
        Ok(())
    }

    fn create_volume(&self, name: &str) -> Result<PathBuf> {
        self.run("volume create", &args(&["volume", "create", name]))?;
        let mountpoint = self.run(
            "volume inspect",
            &args(&["volume", "inspect", "--format", "{{.Mountpoint}}", name]),
        )?;
        Ok(PathBuf::from(mountpoint))
    }

    fn remove_volume(&self, name: &str) -> Result<()> {
        self.run("volume rm", &args(&["volume", "rm", "--force", name]))?;
        Ok(())
    }

    fn image_exists(&self, image: &str) -> Result<bool> {
        let stdout = self.run(
            "image ls",
            &args(&["image", "ls", "--quiet", "--filter", &format!("reference={}", image)]),
        )?;
        Ok(!stdout.is_empty())
    }

    fn pull_image(&self, image: &str) -> Result<()> {
        self.run("pull", &args(&["pull", "--quiet", image]))?;
        Ok(())
    }

    fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        self.run("create", &build_create_container_args(spec))
    }

    fn connect_network(&self, network: &str, container_id: &str, ip: IpAddr) -> Result<()> {
        self.run(
            "network connect",
            &build_connect_args(network, container_id, ip),
        )?;
        Ok(())
    }

    fn start_container(&self, container_id: &str) -> Result<()> {
        self.run("start", &args(&["start", container_id]))?;
        Ok(())
    }

    fn stop_container(&self, container_id: &str, timeout: Duration) -> Result<()> {
        self.run("stop", &build_stop_args(container_id, timeout))?;
        Ok(())
    }

    fn wait_container(&self, container_id: &str) -> Result<i64> {
        let stdout = self.run("wait", &args(&["wait", container_id]))?;
        stdout
            .lines()
            .next()
            .and_then(|line| line.trim().parse::<i64>().ok())
            .ok_or_else(|| NetError::Runtime {
                operation: "wait".to_string(),
                message: format!("unexpected exit status output '{}'", stdout),
            })
    }

    fn remove_container(&self, container_id: &str) -> Result<()> {
        self.run("rm", &args(&["rm", "--force", container_id]))?;
        Ok(())
    }

    fn container_logs(&self, container_id: &str) -> Result<Vec<u8>> {
        // stdout and stderr are both wanted, so this cannot go through `run`
        let output = Command::new(&self.program)
            .args(["logs", container_id])
            .output()?;

        if !output.status.success() {
            return Err(NetError::Runtime {
                operation: "logs".to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);
        Ok(combined)
    }
}

/// Docker object names must be lowercase alphanumeric with single hyphens
pub fn sanitize_name(name: &str) -> String {
    let sanitized = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>();

    sanitized
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("tenNodeNetwork"), "tennodenetwork");
        assert_eq!(sanitize_name("feature/test"), "feature-test");
        assert_eq!(sanitize_name("__my__test__"), "my-test");
    }

    #[test]
    fn test_create_container_args() {
        let mut spec = ContainerSpec::new("gecko:latest");
        spec.name = Some("net-1".to_string());
        spec.exposed_ports.insert(9650);
        spec.port_bindings.insert(9650, 9700);
        spec.env.insert("LOG_LEVEL".to_string(), "debug".to_string());
        spec.bind_mounts
            .insert(PathBuf::from("/var/run/docker.sock"), "/var/run/docker.sock".to_string());
        spec.volume_mounts
            .insert("shared".to_string(), "/shared".to_string());
        spec.command = Some(vec!["/gecko/build/ava".to_string(), "--http-port=9650".to_string()]);

        let args = build_create_container_args(&spec);
        let joined = args.join(" ");

        assert_eq!(args[0], "create");
        assert!(joined.contains("--name net-1"));
        assert!(joined.contains("--expose 9650/tcp"));
        assert!(joined.contains("--publish 9700:9650/tcp"));
        assert!(joined.contains("--env LOG_LEVEL=debug"));
        assert!(joined.contains("--volume /var/run/docker.sock:/var/run/docker.sock"));
        assert!(joined.contains("--mount type=volume,source=shared,target=/shared"));
        assert!(joined.ends_with("gecko:latest /gecko/build/ava --http-port=9650"));
    }

    #[test]
    fn test_default_command_is_omitted() {
        let spec = ContainerSpec::new("controller:1");
        let args = build_create_container_args(&spec);
        assert_eq!(args, vec!["create".to_string(), "controller:1".to_string()]);
    }

    #[test]
    fn test_network_args() {
        let gateway = IpAddr::V4(Ipv4Addr::new(172, 23, 0, 1));
        let args = build_create_network_args("exec-test", "172.23.0.0/24", gateway);
        assert_eq!(
            args.join(" "),
            "network create --driver bridge --subnet 172.23.0.0/24 --gateway 172.23.0.1 exec-test"
        );

        let v6 = build_create_network_args("exec-test", "fd00::/120", "fd00::1".parse().unwrap());
        assert!(v6.contains(&"--ipv6".to_string()));

        let find = build_find_network_args("exec-test");
        assert!(find.contains(&"name=^exec-test$".to_string()));

        let connect = build_connect_args("exec-test", "abc123", "172.23.0.5".parse().unwrap());
        assert_eq!(
            connect.join(" "),
            "network connect --ip 172.23.0.5 exec-test abc123"
        );
        let connect6 = build_connect_args("exec-test", "abc123", "fd00::5".parse().unwrap());
        assert_eq!(connect6[2], "--ip6");
    }

    #[test]
    fn test_stop_args() {
        let args = build_stop_args("abc123", Duration::from_secs(10));
        assert_eq!(args.join(" "), "stop --time 10 abc123");

        let args = build_stop_args("abc123", Duration::from_millis(200));
        assert_eq!(args[2], "1");
        let args = build_stop_args("abc123", Duration::from_millis(1500));
        assert_eq!(args[2], "2");
        let args = build_stop_args("abc123", Duration::ZERO);
        assert_eq!(args[2], "0");
    }
}
