//! Provisioning orchestrator: the public create/delete surface that
//! sequences endpoint resolution, runtime calls, quota computation, address
//! allocation, readiness handoff and record persistence.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use metrics::counter;
use stevedore_core::{
    lookup, require, Assembly, ProvisionError, ProvisionResult, Settings, BAREMETAL,
};
use stevedore_ipam::{spawn_allocator, AllocatorHandle};
use stevedore_publish::{
    register_hostname, DnsRegistrar, HttpDnsRegistrar, HttpPublisher, Publisher,
};
use stevedore_runtime::{ContainerRuntime, DockerRuntime};
use stevedore_store::Store;
use tokio::sync::OnceCell;
use tracing::{info, warn};

mod poller;

pub use poller::{PollConfig, PollOutcome, ReadinessHandle};

/// What a successful create hands back. `readiness` is only present on the
/// baremetal path; the orchestrator itself never waits on it.
#[derive(Debug)]
pub struct CreateOutcome {
    pub container_id: String,
    pub container_name: String,
    pub ip: Option<String>,
    pub endpoint: String,
    pub readiness: Option<ReadinessHandle>,
}

#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn create(
        &self,
        assembly: &Assembly,
        id: &str,
        is_instance: bool,
        account_id: &str,
    ) -> ProvisionResult<CreateOutcome>;

    async fn delete(&self, assembly: &Assembly, id: &str) -> ProvisionResult<()>;

    async fn stop(&self, assembly: &Assembly, id: &str) -> ProvisionResult<()>;
    async fn restart(&self, assembly: &Assembly, id: &str) -> ProvisionResult<()>;
}

/// Provider kinds are a closed set resolved at startup; there is no
/// string-keyed runtime registry to miss at dispatch time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Docker,
}

impl ProviderKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "docker" => Some(ProviderKind::Docker),
            _ => None,
        }
    }

    pub fn resolve(
        self,
        settings: Settings,
        store: Arc<dyn Store>,
    ) -> ProvisionResult<Arc<dyn Provisioner>> {
        match self {
            ProviderKind::Docker => {
                Ok(Arc::new(DockerProvisioner::from_settings(settings, store)))
            }
        }
    }
}

/// Resolve the execution endpoint for an assembly. The `baremetal` sentinel
/// selects the configured shared swarm host; anything else is dialed
/// literally.
pub fn resolve_endpoint(settings: &Settings, assembly: &Assembly) -> ProvisionResult<(String, bool)> {
    let value = require(&assembly.inputs, "endpoint")?;
    if value == BAREMETAL {
        Ok((settings.swarm_host()?.to_string(), true))
    } else {
        Ok((value.to_string(), false))
    }
}

/// Allocation and publication clients, needed only on the baremetal path.
struct Wiring {
    allocator: AllocatorHandle,
    publisher: Arc<dyn Publisher>,
    dns: Arc<dyn DnsRegistrar>,
}

pub struct DockerProvisioner {
    settings: Settings,
    store: Arc<dyn Store>,
    runtime: Arc<dyn ContainerRuntime>,
    wiring: OnceCell<Wiring>,
    poll: PollConfig,
}

impl DockerProvisioner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Settings,
        store: Arc<dyn Store>,
        runtime: Arc<dyn ContainerRuntime>,
        allocator: AllocatorHandle,
        publisher: Arc<dyn Publisher>,
        dns: Arc<dyn DnsRegistrar>,
        poll: PollConfig,
    ) -> Self {
        Self {
            settings,
            store,
            runtime,
            wiring: OnceCell::new_with(Some(Wiring { allocator, publisher, dns })),
            poll,
        }
    }

    /// Wire the real docker client from settings. Subnet and the
    /// registration/DNS service locations are read lazily on the first
    /// baremetal create, so literal-endpoint use needs none of them.
    pub fn from_settings(settings: Settings, store: Arc<dyn Store>) -> Self {
        Self::with_runtime(settings, store, Arc::new(DockerRuntime::default()))
    }

    pub fn with_runtime(
        settings: Settings,
        store: Arc<dyn Store>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        let poll = PollConfig::from_settings(&settings);
        Self { settings, store, runtime, wiring: OnceCell::new(), poll }
    }

    fn build_wiring(settings: &Settings, store: Arc<dyn Store>) -> ProvisionResult<Wiring> {
        let subnet: IpNetwork = settings
            .subnet()?
            .parse()
            .map_err(|e| ProvisionError::ConfigMissing(format!("subnet: {e}")))?;
        let allocator = spawn_allocator(store, subnet);
        let publisher = Arc::new(HttpPublisher::new(
            settings.registration_url()?,
            settings.bridge.clone(),
            settings.gateway.clone(),
        ));
        let dns = Arc::new(HttpDnsRegistrar::new(
            settings.dns_url()?,
            settings.dns_access_key.clone().unwrap_or_default(),
            settings.dns_secret_key.clone().unwrap_or_default(),
        ));
        Ok(Wiring { allocator, publisher, dns })
    }

    async fn wiring(&self) -> ProvisionResult<&Wiring> {
        self.wiring
            .get_or_try_init(|| async { Self::build_wiring(&self.settings, self.store.clone()) })
            .await
    }

    fn container_ref(&self, assembly: &Assembly) -> ProvisionResult<(String, String)> {
        let component = assembly.head()?;
        let (endpoint, _) = resolve_endpoint(&self.settings, assembly)?;
        let id = require(&component.outputs, "id")?.to_string();
        Ok((endpoint, id))
    }
}

#[async_trait]
impl Provisioner for DockerProvisioner {
    async fn create(
        &self,
        assembly: &Assembly,
        id: &str,
        is_instance: bool,
        account_id: &str,
    ) -> ProvisionResult<CreateOutcome> {
        let t0 = Instant::now();
        info!(assembly = %assembly.name, id = %id, is_instance, account = %account_id, "create start");

        let component = assembly.head()?;
        let (endpoint, baremetal) = resolve_endpoint(&self.settings, assembly)?;
        // a config gap must surface before the container exists
        let wiring = if baremetal { Some(self.wiring().await?) } else { None };
        let image = require(&component.inputs, "source")?;
        let domain = require(&component.inputs, "domain")?;
        let name = format!("{}.{}", component.name, domain);

        let created = self.runtime.pull_and_create(&endpoint, image, &name).await?;

        let Some(wiring) = wiring else {
            info!(id = %created.id, endpoint = %endpoint, "created on literal endpoint; no quotas or address");
            return Ok(CreateOutcome {
                container_id: created.id,
                container_name: created.name,
                ip: None,
                endpoint,
                readiness: None,
            });
        };

        let cpu_units = lookup(&component.inputs, "cpu")
            .and_then(|v| v.parse().ok())
            .unwrap_or(self.settings.default_cpu_units);
        let memory_mb = lookup(&component.outputs, "memory")
            .and_then(|v| v.parse().ok())
            .unwrap_or(self.settings.default_memory_mb);
        self.runtime.start(&endpoint, &created.id, cpu_units, memory_mb).await?;

        let lease = wiring.allocator.allocate().await?;
        wiring.allocator.commit(lease).await?;
        let ip = lease.ip.to_string();
        counter!("provision_create_total", 1u64);

        let readiness = poller::spawn_poller(
            self.runtime.clone(),
            wiring.publisher.clone(),
            self.store.clone(),
            self.poll,
            poller::PollTarget {
                endpoint: endpoint.clone(),
                container_id: created.id.clone(),
                container_name: created.name.clone(),
                ip: ip.clone(),
                component: component.clone(),
            },
        );

        // DNS points at the address before readiness is known; the record
        // may briefly name a container that is not yet serving.
        if let Err(e) = register_hostname(wiring.dns.as_ref(), &created.name, &ip).await {
            warn!(name = %created.name, error = %e, "hostname registration failed");
        }

        info!(id = %created.id, ip = %ip, took_ms = %t0.elapsed().as_millis(), "create ok");
        Ok(CreateOutcome {
            container_id: created.id,
            container_name: created.name,
            ip: Some(ip),
            endpoint,
            readiness: Some(readiness),
        })
    }

    async fn delete(&self, assembly: &Assembly, id: &str) -> ProvisionResult<()> {
        info!(assembly = %assembly.name, id = %id, "delete start");
        let (endpoint, container_id) = self.container_ref(assembly)?;
        self.runtime.kill(&endpoint, &container_id).await?;
        counter!("provision_delete_total", 1u64);
        info!(container = %container_id, "delete ok");
        Ok(())
    }

    async fn stop(&self, assembly: &Assembly, id: &str) -> ProvisionResult<()> {
        info!(assembly = %assembly.name, id = %id, "stop start");
        let (endpoint, container_id) = self.container_ref(assembly)?;
        self.runtime.stop(&endpoint, &container_id).await
    }

    async fn restart(&self, assembly: &Assembly, id: &str) -> ProvisionResult<()> {
        info!(assembly = %assembly.name, id = %id, "restart start");
        let (endpoint, container_id) = self.container_ref(assembly)?;
        self.runtime.restart(&endpoint, &container_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stevedore_core::KeyValuePair;

    fn assembly_with_endpoint(value: &str) -> Assembly {
        Assembly {
            name: "app".into(),
            inputs: [KeyValuePair::new("endpoint", value)].into_iter().collect(),
            components: vec![Default::default()],
        }
    }

    #[test]
    fn provider_names_resolve_to_the_closed_set() {
        assert_eq!(ProviderKind::from_name("docker"), Some(ProviderKind::Docker));
        assert_eq!(ProviderKind::from_name("chef"), None);
    }

    #[test]
    fn resolve_accepts_a_bare_environment() {
        // no subnet, swarm host or service urls configured; those are only
        // needed once a baremetal create runs
        let store = Arc::new(stevedore_store::MemStore::new());
        assert!(ProviderKind::Docker.resolve(Settings::default(), store).is_ok());
    }

    #[test]
    fn baremetal_resolves_the_configured_swarm_host() {
        let settings = Settings { swarm_host: Some("10.1.1.1:2375".into()), ..Default::default() };
        let (ep, baremetal) = resolve_endpoint(&settings, &assembly_with_endpoint(BAREMETAL)).unwrap();
        assert_eq!(ep, "10.1.1.1:2375");
        assert!(baremetal);
    }

    #[test]
    fn literal_endpoints_pass_through() {
        let settings = Settings::default();
        let (ep, baremetal) =
            resolve_endpoint(&settings, &assembly_with_endpoint("10.9.9.9:2375")).unwrap();
        assert_eq!(ep, "10.9.9.9:2375");
        assert!(!baremetal);
    }

    #[test]
    fn baremetal_without_swarm_host_is_config_missing() {
        let settings = Settings::default();
        assert!(matches!(
            resolve_endpoint(&settings, &assembly_with_endpoint(BAREMETAL)),
            Err(ProvisionError::ConfigMissing(_))
        ));
    }

    #[test]
    fn missing_endpoint_input_is_fatal() {
        let settings = Settings::default();
        let assembly = Assembly { name: "app".into(), ..Default::default() };
        assert!(matches!(
            resolve_endpoint(&settings, &assembly),
            Err(ProvisionError::InputMissing(k)) if k == "endpoint"
        ));
    }
}
