//! Thin adapter translating container lifecycle verbs into Docker/Swarm
//! remote API calls. Every verb opens a fresh client bound to the endpoint
//! it is given; swarm managers speak the same API as single hosts.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use bollard::Docker;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use stevedore_core::{ProvisionError, ProvisionResult};
use tracing::{debug, info};

/// Fixed CFS scheduling period. The quota below is computed against this
/// period, so one "cpu unit" buys half a core.
pub const CPU_PERIOD: i64 = 50_000;
/// Quota granted per abstract cpu unit. `cpu_units * 25_000` against a
/// 50_000 period is a business rule, not a runtime default.
pub const CPU_QUOTA_PER_UNIT: i64 = 25_000;
/// Grace period handed to stop/restart before the daemon kills the process.
pub const STOP_GRACE_SECS: i32 = 10;

pub fn cpu_quota(cpu_units: u32) -> i64 {
    i64::from(cpu_units) * CPU_QUOTA_PER_UNIT
}

pub fn memory_bytes(memory_mb: u64) -> i64 {
    (memory_mb * 1024 * 1024) as i64
}

/// Snapshot of the runtime's reported lifecycle state. Stale the moment it
/// is read; callers poll rather than trust it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerState {
    Created,
    Running,
    Stopped,
    Unknown,
}

impl ContainerState {
    pub fn is_running(&self) -> bool {
        matches!(self, ContainerState::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedContainer {
    pub id: String,
    pub name: String,
}

/// One method per lifecycle verb. The trait is the seam tests mock; the
/// orchestrator never sees bollard types.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Pull the image, then create a container with networking disabled.
    /// The address is attached out-of-band after allocation.
    async fn pull_and_create(
        &self,
        endpoint: &str,
        image: &str,
        name: &str,
    ) -> ProvisionResult<CreatedContainer>;

    /// Apply resource quotas and start the container.
    async fn start(
        &self,
        endpoint: &str,
        id: &str,
        cpu_units: u32,
        memory_mb: u64,
    ) -> ProvisionResult<()>;

    async fn stop(&self, endpoint: &str, id: &str) -> ProvisionResult<()>;
    async fn restart(&self, endpoint: &str, id: &str) -> ProvisionResult<()>;
    async fn kill(&self, endpoint: &str, id: &str) -> ProvisionResult<()>;
    async fn inspect(&self, endpoint: &str, id: &str) -> ProvisionResult<ContainerState>;
}

/// Docker/Swarm implementation.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    timeout_secs: u64,
}

impl Default for DockerRuntime {
    fn default() -> Self {
        Self { timeout_secs: 120 }
    }
}

impl DockerRuntime {
    pub fn new(timeout_secs: u64) -> Self {
        Self { timeout_secs }
    }

    fn client(&self, endpoint: &str) -> ProvisionResult<Docker> {
        let addr = normalize_endpoint(endpoint);
        Docker::connect_with_http(&addr, self.timeout_secs, bollard::API_DEFAULT_VERSION)
            .map_err(|e| ProvisionError::RuntimeUnavailable(format!("connecting {addr}: {e}")))
    }
}

/// Endpoints arrive as bare `host:port` strings; the client wants a scheme.
pub fn normalize_endpoint(endpoint: &str) -> String {
    if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("tcp://{endpoint}")
    }
}

fn runtime_err(e: bollard::errors::Error) -> ProvisionError {
    match e {
        bollard::errors::Error::DockerResponseServerError { status_code, message } => {
            ProvisionError::RuntimeOperationFailed(format!("{status_code}: {message}"))
        }
        other => ProvisionError::RuntimeUnavailable(other.to_string()),
    }
}

fn state_from(
    status: Option<bollard::models::ContainerStateStatusEnum>,
    running: Option<bool>,
) -> ContainerState {
    use bollard::models::ContainerStateStatusEnum as S;
    if running == Some(true) {
        return ContainerState::Running;
    }
    match status {
        Some(S::RUNNING) => ContainerState::Running,
        Some(S::CREATED) => ContainerState::Created,
        Some(S::EXITED) | Some(S::DEAD) => ContainerState::Stopped,
        _ => ContainerState::Unknown,
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn pull_and_create(
        &self,
        endpoint: &str,
        image: &str,
        name: &str,
    ) -> ProvisionResult<CreatedContainer> {
        use bollard::models::ContainerCreateBody;
        use bollard::query_parameters::{CreateContainerOptions, CreateImageOptions};

        let docker = self.client(endpoint)?;

        let pull = CreateImageOptions { from_image: Some(image.to_string()), ..Default::default() };
        let mut progress = docker.create_image(Some(pull), None, None);
        while let Some(step) = progress.next().await {
            let step = step.map_err(runtime_err)?;
            debug!(image = %image, status = ?step.status, "pull progress");
        }

        let config = ContainerCreateBody {
            image: Some(image.to_string()),
            network_disabled: Some(true),
            ..Default::default()
        };
        let opts = CreateContainerOptions { name: Some(name.to_string()), ..Default::default() };
        let created = docker.create_container(Some(opts), config).await.map_err(runtime_err)?;
        info!(id = %created.id, name = %name, endpoint = %endpoint, "container created");
        Ok(CreatedContainer { id: created.id, name: name.to_string() })
    }

    async fn start(
        &self,
        endpoint: &str,
        id: &str,
        cpu_units: u32,
        memory_mb: u64,
    ) -> ProvisionResult<()> {
        use bollard::models::ContainerUpdateBody;
        use bollard::query_parameters::StartContainerOptions;

        let docker = self.client(endpoint)?;
        let quotas = ContainerUpdateBody {
            memory: Some(memory_bytes(memory_mb)),
            cpu_period: Some(CPU_PERIOD),
            cpu_quota: Some(cpu_quota(cpu_units)),
            ..Default::default()
        };
        docker.update_container(id, quotas).await.map_err(runtime_err)?;
        docker
            .start_container(id, None::<StartContainerOptions>)
            .await
            .map_err(runtime_err)?;
        info!(id = %id, cpu_units, memory_mb, "container started");
        Ok(())
    }

    async fn stop(&self, endpoint: &str, id: &str) -> ProvisionResult<()> {
        use bollard::query_parameters::StopContainerOptions;
        let docker = self.client(endpoint)?;
        let opts = StopContainerOptions { t: Some(STOP_GRACE_SECS), ..Default::default() };
        docker.stop_container(id, Some(opts)).await.map_err(runtime_err)?;
        info!(id = %id, "container stopped");
        Ok(())
    }

    async fn restart(&self, endpoint: &str, id: &str) -> ProvisionResult<()> {
        use bollard::query_parameters::RestartContainerOptions;
        let docker = self.client(endpoint)?;
        let opts = RestartContainerOptions { t: Some(STOP_GRACE_SECS), ..Default::default() };
        docker.restart_container(id, Some(opts)).await.map_err(runtime_err)?;
        info!(id = %id, "container restarted");
        Ok(())
    }

    async fn kill(&self, endpoint: &str, id: &str) -> ProvisionResult<()> {
        use bollard::query_parameters::KillContainerOptions;
        let docker = self.client(endpoint)?;
        docker
            .kill_container(id, None::<KillContainerOptions>)
            .await
            .map_err(runtime_err)?;
        info!(id = %id, "container killed");
        Ok(())
    }

    async fn inspect(&self, endpoint: &str, id: &str) -> ProvisionResult<ContainerState> {
        use bollard::query_parameters::InspectContainerOptions;
        let docker = self.client(endpoint)?;
        let resp = docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(runtime_err)?;
        let state = resp
            .state
            .map(|s| state_from(s.status, s.running))
            .unwrap_or(ContainerState::Unknown);
        debug!(id = %id, ?state, "inspected");
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn four_units_buy_two_periods() {
        assert_eq!(cpu_quota(4), 100_000);
        assert_eq!(CPU_PERIOD, 50_000);
    }

    #[test]
    fn memory_is_mb_times_mib() {
        assert_eq!(memory_bytes(512), 512 * 1024 * 1024);
        assert_eq!(memory_bytes(0), 0);
    }

    #[test]
    fn bare_endpoints_get_a_scheme() {
        assert_eq!(normalize_endpoint("10.0.0.5:2375"), "tcp://10.0.0.5:2375");
        assert_eq!(normalize_endpoint("tcp://10.0.0.5:2375"), "tcp://10.0.0.5:2375");
        assert_eq!(normalize_endpoint("http://swarm:4243"), "http://swarm:4243");
    }

    #[test]
    fn state_mapping_prefers_the_running_flag() {
        use bollard::models::ContainerStateStatusEnum as S;
        assert_eq!(state_from(Some(S::CREATED), Some(true)), ContainerState::Running);
        assert_eq!(state_from(Some(S::RUNNING), None), ContainerState::Running);
        assert_eq!(state_from(Some(S::CREATED), Some(false)), ContainerState::Created);
        assert_eq!(state_from(Some(S::EXITED), Some(false)), ContainerState::Stopped);
        assert_eq!(state_from(None, None), ContainerState::Unknown);
    }
}
