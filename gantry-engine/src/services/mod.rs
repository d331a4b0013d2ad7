// Services Module
// Ephemeral per-cell services: start, readiness gating and guaranteed teardown

pub mod docker;
pub mod readiness;

pub use docker::{ContainerError, DockerBackend};

use crate::error::{EngineError, EngineResult};
use crate::execution::cell::CellId;
use crate::workflow::models::ServiceSpec;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A published port of a running service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundPort {
    pub container: u16,
    pub host: u16,
}

/// One running ephemeral service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceHandle {
    pub name: String,
    pub container_id: String,
    pub container_name: String,
    pub image: String,
    pub ports: Vec<BoundPort>,
}

impl ServiceHandle {
    /// Host port bound to `container_port`
    pub fn host_port(&self, container_port: u16) -> Option<u16> {
        self.ports
            .iter()
            .find(|p| p.container == container_port)
            .map(|p| p.host)
    }
}

/// One service to start for one cell.
///
/// Every container port is published on a loopback port the runtime picks,
/// so sibling cells never contend for (or reach) each other's services.
#[derive(Debug, Clone)]
pub struct ServiceLaunch {
    pub spec: ServiceSpec,
    /// Unique per launch, so a start that never returned can still be removed
    pub container_name: String,
    pub container_ports: Vec<u16>,
}

impl ServiceLaunch {
    pub fn new(spec: &ServiceSpec, cell: &CellId) -> EngineResult<Self> {
        Ok(Self {
            spec: spec.clone(),
            container_name: format!(
                "gantry-svc-{}-{}-{}",
                sanitize(&cell.to_string()),
                sanitize(&spec.name),
                unique_suffix()
            ),
            container_ports: spec.container_ports()?,
        })
    }

    /// Handle for a start that did not finish; enough for `stop`
    fn unfinished(&self) -> ServiceHandle {
        ServiceHandle {
            name: self.spec.name.clone(),
            container_id: String::new(),
            container_name: self.container_name.clone(),
            image: self.spec.image.clone(),
            ports: Vec::new(),
        }
    }
}

/// Something that can run service containers
#[async_trait]
pub trait ServiceBackend: Send + Sync {
    /// Start the container named `launch.container_name`. Dropping the
    /// returned future must not leave a container behind that `stop` on
    /// that name cannot remove.
    async fn start(&self, launch: &ServiceLaunch) -> EngineResult<ServiceHandle>;

    async fn stop(&self, handle: &ServiceHandle) -> EngineResult<()>;

    /// One readiness attempt against a host port
    async fn probe(&self, _handle: &ServiceHandle, host_port: u16, attempt: Duration) -> bool {
        readiness::probe_tcp(host_port, attempt).await
    }
}

/// Starts a cell's services and gates on their readiness
#[derive(Clone)]
pub struct ServiceProvisioner {
    backend: Arc<dyn ServiceBackend>,
    readiness_timeout: Duration,
    readiness_interval: Duration,
}

impl ServiceProvisioner {
    pub fn new(
        backend: Arc<dyn ServiceBackend>,
        readiness_timeout: Duration,
        readiness_interval: Duration,
    ) -> Self {
        Self {
            backend,
            readiness_timeout,
            readiness_interval,
        }
    }

    /// Start every service and wait until all accept connections.
    ///
    /// One deadline of `readiness_timeout` covers both the starts and the
    /// readiness probes of all services of the cell. On any failure the
    /// services started so far are stopped before returning.
    pub async fn start_all(&self, specs: &[ServiceSpec], cell: &CellId) -> EngineResult<ServiceGuard> {
        let mut guard = ServiceGuard::new(self.backend.clone(), cell.clone());
        if specs.is_empty() {
            return Ok(guard);
        }

        let launches = specs
            .iter()
            .map(|spec| ServiceLaunch::new(spec, cell))
            .collect::<EngineResult<Vec<_>>>()?;
        let deadline = Instant::now() + self.readiness_timeout;

        for launch in &launches {
            let service = launch.spec.name.clone();
            match tokio::time::timeout_at(deadline, self.backend.start(launch)).await {
                Ok(Ok(handle)) => {
                    debug!(cell = %cell, service = %service, container = %handle.container_name, "service started");
                    guard.handles.push(handle);
                }
                Ok(Err(e)) => {
                    guard.release().await;
                    return Err(EngineError::ServiceUnavailable {
                        service,
                        reason: e.to_string(),
                    });
                }
                Err(_) => {
                    warn!(cell = %cell, service = %service, container = %launch.container_name, "service start timed out");
                    guard.handles.push(launch.unfinished());
                    guard.release().await;
                    return Err(EngineError::ServiceUnavailable {
                        service,
                        reason: format!("not started within {:?}", self.readiness_timeout),
                    });
                }
            }
        }

        for (spec, handle) in specs.iter().zip(guard.handles.clone()) {
            for port in readiness_ports(spec, &handle) {
                let remaining = deadline.saturating_duration_since(Instant::now());
                let backend = self.backend.clone();
                let waited = readiness::wait_until(remaining, self.readiness_interval, |attempt| {
                    let backend = backend.clone();
                    let handle = handle.clone();
                    async move { backend.probe(&handle, port, attempt).await }
                })
                .await;

                match waited {
                    Some(elapsed) => {
                        info!(cell = %cell, service = %spec.name, port, ?elapsed, "service ready");
                    }
                    None => {
                        guard.release().await;
                        return Err(EngineError::ServiceUnavailable {
                            service: spec.name.clone(),
                            reason: format!(
                                "port {} not accepting connections after {:?}",
                                port, self.readiness_timeout
                            ),
                        });
                    }
                }
            }
        }

        Ok(guard)
    }
}

/// Host ports probed for a service: the one published for
/// `readiness_port`, or all of them
fn readiness_ports(spec: &ServiceSpec, handle: &ServiceHandle) -> Vec<u16> {
    match spec.readiness_port {
        Some(port) => handle.host_port(port).into_iter().collect(),
        None => handle.ports.iter().map(|p| p.host).collect(),
    }
}

/// Owns a cell's running services until they are released.
///
/// `release` is idempotent. Dropping an unreleased guard schedules the
/// teardown on the current tokio runtime.
pub struct ServiceGuard {
    backend: Arc<dyn ServiceBackend>,
    cell: CellId,
    handles: Vec<ServiceHandle>,
}

impl ServiceGuard {
    fn new(backend: Arc<dyn ServiceBackend>, cell: CellId) -> Self {
        Self {
            backend,
            cell,
            handles: Vec::new(),
        }
    }

    pub fn handles(&self) -> &[ServiceHandle] {
        &self.handles
    }

    /// Connection variables for steps: `GANTRY_SERVICE_<NAME>_HOST`,
    /// `GANTRY_SERVICE_<NAME>_PORT` (first port) and
    /// `GANTRY_SERVICE_<NAME>_PORT_<CONTAINER_PORT>`
    pub fn env_vars(&self) -> HashMap<String, String> {
        let mut vars = HashMap::new();
        for handle in &self.handles {
            let prefix = format!("GANTRY_SERVICE_{}", env_name(&handle.name));
            vars.insert(format!("{}_HOST", prefix), "127.0.0.1".to_string());
            if let Some(first) = handle.ports.first() {
                vars.insert(format!("{}_PORT", prefix), first.host.to_string());
            }
            for port in &handle.ports {
                vars.insert(
                    format!("{}_PORT_{}", prefix, port.container),
                    port.host.to_string(),
                );
            }
        }
        vars
    }

    /// Stop every service, newest first. Returns how many were stopped.
    pub async fn release(&mut self) -> usize {
        let handles = std::mem::take(&mut self.handles);
        teardown(self.backend.as_ref(), &self.cell, handles).await
    }
}

impl Drop for ServiceGuard {
    fn drop(&mut self) {
        if self.handles.is_empty() {
            return;
        }

        let handles = std::mem::take(&mut self.handles);
        let backend = self.backend.clone();
        let cell = self.cell.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!(cell = %cell, count = handles.len(), "services dropped without release, scheduling teardown");
                runtime.spawn(async move {
                    teardown(backend.as_ref(), &cell, handles).await;
                });
            }
            Err(_) => {
                let names: Vec<_> = handles.iter().map(|h| h.container_name.as_str()).collect();
                warn!(cell = %cell, containers = ?names, "no runtime to tear down services");
            }
        }
    }
}

async fn teardown(backend: &dyn ServiceBackend, cell: &CellId, handles: Vec<ServiceHandle>) -> usize {
    let mut stopped = 0;
    for handle in handles.iter().rev() {
        match backend.stop(handle).await {
            Ok(()) => stopped += 1,
            Err(e) => {
                warn!(cell = %cell, service = %handle.name, error = %e, "failed to stop service");
            }
        }
    }
    stopped
}

/// Container names accept [a-zA-Z0-9_.-]
fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

fn unique_suffix() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!(
        "{:08x}",
        (nanos ^ (std::process::id() as u64) ^ seq.rotate_left(32)) as u32
    )
}

fn env_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}


#[cfg(test)]
mod tests {
    use super::testing::{service, FakeBackend};
    use super::*;

    fn provisioner(backend: Arc<FakeBackend>) -> ServiceProvisioner {
        ServiceProvisioner::new(backend, Duration::from_millis(150), Duration::from_millis(10))
    }

    fn cell() -> CellId {
        CellId::matrix("test", "3.10")
    }

    #[tokio::test]
    async fn test_start_all_and_release_once() {
        let backend = Arc::new(FakeBackend::default());
        let specs = vec![service("redis", "6379:6379"), service("mongo", "27017")];

        let mut guard = provisioner(backend.clone())
            .start_all(&specs, &cell())
            .await
            .unwrap();
        assert_eq!(guard.handles().len(), 2);

        // The fixed host port in "6379:6379" is not used
        let vars = guard.env_vars();
        assert_eq!(vars["GANTRY_SERVICE_REDIS_PORT"], "40379");
        assert_eq!(vars["GANTRY_SERVICE_MONGO_PORT_27017"], "40017");
        assert_eq!(vars["GANTRY_SERVICE_MONGO_HOST"], "127.0.0.1");

        assert_eq!(guard.release().await, 2);
        assert_eq!(guard.release().await, 0);
        assert_eq!(backend.stop_count(), 2);
        assert_eq!(*backend.stopped.lock().unwrap(), vec!["mongo", "redis"]);
    }

    #[tokio::test]
    async fn test_unready_service_tears_down_partial_start() {
        let backend = Arc::new(FakeBackend {
            never_ready: ["dynamodb".to_string()].into_iter().collect(),
            ..Default::default()
        });
        let specs = vec![
            service("redis", "6379:6379"),
            service("dynamodb", "8000:8000"),
        ];

        let result = provisioner(backend.clone()).start_all(&specs, &cell()).await;

        match result {
            Err(EngineError::ServiceUnavailable { service, reason }) => {
                assert_eq!(service, "dynamodb");
                assert!(reason.contains("40000"));
            }
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("expected ServiceUnavailable"),
        }
        assert_eq!(backend.start_count(), 2);
        assert_eq!(backend.stop_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_start_stops_earlier_services() {
        let backend = Arc::new(FakeBackend {
            fail_start: ["mongo".to_string()].into_iter().collect(),
            ..Default::default()
        });
        let specs = vec![
            service("redis", "6379:6379"),
            service("mongo", "27017:27017"),
            service("dynamodb", "8000:8000"),
        ];

        let err = provisioner(backend.clone())
            .start_all(&specs, &cell())
            .await
            .err()
            .unwrap();

        assert!(matches!(err, EngineError::ServiceUnavailable { ref service, .. } if service == "mongo"));
        assert_eq!(backend.start_count(), 1);
        assert_eq!(*backend.stopped.lock().unwrap(), vec!["redis"]);
    }

    #[tokio::test]
    async fn test_dropped_guard_schedules_teardown() {
        let backend = Arc::new(FakeBackend::default());
        let specs = vec![service("redis", "6379:6379")];

        let guard = provisioner(backend.clone())
            .start_all(&specs, &cell())
            .await
            .unwrap();
        drop(guard);

        for _ in 0..50 {
            if backend.stop_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(backend.stop_count(), 1);
    }

    #[tokio::test]
    async fn test_no_services() {
        let backend = Arc::new(FakeBackend::default());
        let mut guard = provisioner(backend.clone())
            .start_all(&[], &cell())
            .await
            .unwrap();

        assert!(guard.env_vars().is_empty());
        assert_eq!(guard.release().await, 0);
    }

    #[test]
    fn test_readiness_port_resolution() {
        let mut spec = service("mongo", "27017");
        let handle = ServiceHandle {
            name: "mongo".to_string(),
            container_id: "id".to_string(),
            container_name: "c".to_string(),
            image: "mongo".to_string(),
            ports: vec![BoundPort {
                container: 27017,
                host: 49200,
            }],
        };

        assert_eq!(readiness_ports(&spec, &handle), vec![49200]);
        spec.readiness_port = Some(27017);
        assert_eq!(readiness_ports(&spec, &handle), vec![49200]);
        spec.readiness_port = Some(5000);
        assert!(readiness_ports(&spec, &handle).is_empty());
    }

    #[tokio::test]
    async fn test_hung_start_is_unavailable_and_removed() {
        let backend = Arc::new(FakeBackend {
            hang_start: ["mongo".to_string()].into_iter().collect(),
            ..Default::default()
        });
        let specs = vec![service("redis", "6379"), service("mongo", "27017")];

        let started = Instant::now();
        let err = provisioner(backend.clone())
            .start_all(&specs, &cell())
            .await
            .err()
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        match err {
            EngineError::ServiceUnavailable { service, reason } => {
                assert_eq!(service, "mongo");
                assert!(reason.contains("not started"));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(*backend.stopped.lock().unwrap(), vec!["mongo", "redis"]);
        assert!(backend.removed.lock().unwrap()[0].starts_with("gantry-svc-test--3.10--mongo-"));
    }

    #[test]
    fn test_launch_publishes_container_ports_only() {
        let a = ServiceLaunch::new(&service("redis", "6379:6379"), &cell()).unwrap();
        let b = ServiceLaunch::new(&service("redis", "6379:6379"), &cell()).unwrap();

        assert_eq!(a.container_ports, vec![6379]);
        assert!(a.container_name.starts_with("gantry-svc-test--3.10--redis-"));
        assert_ne!(a.container_name, b.container_name);
    }

    #[test]
    fn test_sanitize_and_suffix() {
        assert_eq!(sanitize("test (3.10)"), "test--3.10-");
        let a = unique_suffix();
        assert_eq!(a.len(), 8);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, unique_suffix());
    }
}
