// Docker Service Backend
// Starts and removes service containers through the docker CLI

use crate::error::EngineResult;
use crate::services::{BoundPort, ServiceBackend, ServiceHandle, ServiceLaunch};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Errors that can occur with container execution
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("Container runtime is not available: {0}")]
    RuntimeNotAvailable(String),

    #[error("Failed to start container: {0}")]
    StartFailed(String),

    #[error("Failed to resolve published port {port} of {container}: {reason}")]
    PortLookupFailed {
        container: String,
        port: u16,
        reason: String,
    },

    #[error("Failed to remove container: {0}")]
    RemoveFailed(String),
}

/// Service backend driving the docker (or compatible) CLI
#[derive(Debug, Clone)]
pub struct DockerBackend {
    binary: String,
}

impl DockerBackend {
    pub fn new() -> Self {
        Self::with_binary("docker")
    }

    /// Use another docker-compatible CLI (e.g. podman)
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Check if the runtime binary exists and its daemon answers
    pub async fn is_available(&self) -> bool {
        if which::which(&self.binary).is_err() {
            return false;
        }

        let output = Command::new(&self.binary)
            .arg("version")
            .arg("--format")
            .arg("{{.Server.Version}}")
            .output()
            .await;

        output.map(|o| o.status.success()).unwrap_or(false)
    }

    fn run_args(launch: &ServiceLaunch) -> Vec<String> {
        let spec = &launch.spec;
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            launch.container_name.clone(),
        ];

        for (key, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        // Loopback only, host port chosen by the daemon
        for port in &launch.container_ports {
            args.push("-p".to_string());
            args.push(format!("127.0.0.1::{}", port));
        }

        if let Some(options) = &spec.options {
            args.extend(options.split_whitespace().map(String::from));
        }

        args.push(spec.image.clone());
        args
    }

    async fn lookup_host_port(
        &self,
        container_name: &str,
        container_port: u16,
    ) -> Result<u16, ContainerError> {
        let output = Command::new(&self.binary)
            .args(["port", container_name, &format!("{}/tcp", container_port)])
            .output()
            .await
            .map_err(|e| ContainerError::RuntimeNotAvailable(e.to_string()))?;

        let lookup_failed = |reason: String| ContainerError::PortLookupFailed {
            container: container_name.to_string(),
            port: container_port,
            reason,
        };

        if !output.status.success() {
            return Err(lookup_failed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_port_output(&stdout).ok_or_else(|| lookup_failed(stdout.trim().to_string()))
    }
}

impl Default for DockerBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServiceBackend for DockerBackend {
    async fn start(&self, launch: &ServiceLaunch) -> EngineResult<ServiceHandle> {
        debug!(service = %launch.spec.name, container = %launch.container_name, "starting service container");

        // An abandoned start (deadline passed) kills the client mid-pull
        let output = Command::new(&self.binary)
            .args(Self::run_args(launch))
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ContainerError::RuntimeNotAvailable(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ContainerError::StartFailed(stderr.trim().to_string()).into());
        }

        let mut handle = ServiceHandle {
            name: launch.spec.name.clone(),
            container_id: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            container_name: launch.container_name.clone(),
            image: launch.spec.image.clone(),
            ports: Vec::new(),
        };

        for &container in &launch.container_ports {
            match self.lookup_host_port(&handle.container_name, container).await {
                Ok(host) => handle.ports.push(BoundPort { container, host }),
                Err(e) => {
                    // The container is already running; remove it before failing.
                    let _ = self.stop(&handle).await;
                    return Err(e.into());
                }
            }
        }

        Ok(handle)
    }

    async fn stop(&self, handle: &ServiceHandle) -> EngineResult<()> {
        debug!(service = %handle.name, container = %handle.container_name, "removing service container");

        let output = Command::new(&self.binary)
            .args(["rm", "-f", "-v", &handle.container_name])
            .output()
            .await
            .map_err(|e| ContainerError::RuntimeNotAvailable(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // Already gone counts as removed.
            if !stderr.contains("No such container") {
                return Err(ContainerError::RemoveFailed(stderr.trim().to_string()).into());
            }
        }

        Ok(())
    }
}

/// Parse `docker port` output ("0.0.0.0:49153" or "[::]:49153" lines)
fn parse_port_output(output: &str) -> Option<u16> {
    output
        .lines()
        .filter_map(|line| line.trim().rsplit_once(':'))
        .find_map(|(_, port)| port.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::execution::cell::CellId;
    use crate::workflow::models::ServiceSpec;

    use std::collections::BTreeMap;

    fn redis() -> ServiceLaunch {
        let mut env = BTreeMap::new();
        env.insert("REDIS_ARGS".to_string(), "--save ''".to_string());
        let spec = ServiceSpec {
            name: "redis".to_string(),
            image: "redis:7".to_string(),
            ports: vec!["6379:6379".to_string(), "8001".to_string()],
            env,
            readiness_port: None,
            options: Some("--health-cmd redis-cli".to_string()),
        };
        ServiceLaunch::new(&spec, &CellId::matrix("test", "3.9")).unwrap()
    }

    #[test]
    fn test_run_args() {
        let launch = redis();
        let args = DockerBackend::run_args(&launch);

        assert_eq!(&args[..3], &["run", "-d", "--name"]);
        assert_eq!(args[3], launch.container_name);
        assert!(args.contains(&"REDIS_ARGS=--save ''".to_string()));
        assert!(args.contains(&"127.0.0.1::6379".to_string()));
        assert!(args.contains(&"127.0.0.1::8001".to_string()));
        assert!(!args.contains(&"6379:6379".to_string()));
        assert!(args.contains(&"--health-cmd".to_string()));
        assert_eq!(args.last().unwrap(), "redis:7");
    }

    #[test]
    fn test_parse_port_output() {
        assert_eq!(parse_port_output("0.0.0.0:49153\n[::]:49153\n"), Some(49153));
        assert_eq!(parse_port_output("127.0.0.1:32768"), Some(32768));
        assert_eq!(parse_port_output(""), None);
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let backend = DockerBackend::with_binary("gantry-no-such-runtime");
        assert!(!backend.is_available().await);
    }
}
