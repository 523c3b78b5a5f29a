//! Orchestration service shared by the HTTP handlers.
//!
//! Owns one instance of every hypervisor component, all sharing the same
//! connector, and adds the checks that belong at the request boundary.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use kvmorch_hypervisor::{
    spawn_daemon_call, CleanupOrchestrator, CommandRunner, Connector, DeleteReport, DomainDetails, DomainRegistry,
    DomainSummary, HypervisorError, IpResolver, MockConnector, MockToolRunner, NetworkManager,
    NetworkSummary, ProvisionConfig, ProvisioningPipeline, ProvisioningRequest, ResolvedIp,
    ResolverConfig,
};

use crate::config::{Config, HypervisorBackend};

/// Result of a create request.
#[derive(Debug, Clone)]
pub struct CreateOutcome {
    pub name: String,
    /// `None` when address discovery is disabled or gave up.
    pub ip: Option<ResolvedIp>,
}

/// Cheap health snapshot of the daemon connection.
#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub healthy: bool,
    pub uri: String,
    pub domains: usize,
}

pub struct OrchestratorService {
    uri: String,
    backend: &'static str,
    registry: DomainRegistry,
    pipeline: ProvisioningPipeline,
    cleanup: CleanupOrchestrator,
    resolver: IpResolver,
    networks: NetworkManager,
    wait_on_create: bool,
}

impl OrchestratorService {
    /// Assemble the components from explicit connector and tool runner.
    pub fn new(
        connector: Arc<dyn Connector>,
        runner: Arc<dyn CommandRunner>,
        backend: &'static str,
        provision: &ProvisionConfig,
        resolver: ResolverConfig,
        wait_on_create: bool,
    ) -> Self {
        let uri = connector.uri().to_string();
        Self {
            pipeline: ProvisioningPipeline::new(uri.clone(), runner, provision),
            registry: DomainRegistry::new(connector.clone()),
            cleanup: CleanupOrchestrator::new(connector.clone()),
            resolver: IpResolver::new(connector.clone(), resolver),
            networks: NetworkManager::new(connector),
            uri,
            backend,
            wait_on_create,
        }
    }

    /// Build the service for the configured backend.
    pub fn from_config(config: &Config) -> Result<Self> {
        let resolver = config.resolver.resolver_config();
        let wait = config.resolver.wait_on_create;

        match config.hypervisor.backend {
            HypervisorBackend::Mock => {
                info!("Using mock hypervisor backend");
                Self::mock(config, resolver, wait)
            }
            HypervisorBackend::Libvirt => {
                #[cfg(feature = "libvirt")]
                {
                    let uri = &config.hypervisor.libvirt_uri;
                    info!(uri = %uri, "Using libvirt hypervisor backend");
                    Ok(Self::new(
                        Arc::new(kvmorch_hypervisor::LibvirtConnector::new(uri.clone())),
                        Arc::new(kvmorch_hypervisor::SystemCommandRunner::new()),
                        "libvirt",
                        &config.provision,
                        resolver,
                        wait,
                    ))
                }
                #[cfg(not(feature = "libvirt"))]
                {
                    warn!("Libvirt backend requested but not compiled in, falling back to mock");
                    Self::mock(config, resolver, wait)
                }
            }
        }
    }

    fn mock(config: &Config, resolver: ResolverConfig, wait: bool) -> Result<Self> {
        let mut provision = config.provision.clone();

        // The host image directory rarely exists on a development machine.
        if !provision.images_dir.is_dir() {
            let scratch = std::env::temp_dir().join("kvmorch-images");
            std::fs::create_dir_all(&scratch)
                .with_context(|| format!("Failed to create {}", scratch.display()))?;
            info!(
                configured = %provision.images_dir.display(),
                using = %scratch.display(),
                "Images directory missing, using scratch directory"
            );
            provision.images_dir = scratch;
        }

        let connector = MockConnector::new();
        let runner = Arc::new(MockToolRunner::new(connector.clone()));
        Ok(Self::new(
            Arc::new(connector),
            runner,
            "mock",
            &provision,
            resolver,
            wait,
        ))
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn backend(&self) -> &'static str {
        self.backend
    }

    /// Opens a connection by listing domains.
    pub fn health(&self) -> HealthStatus {
        match self.registry.list() {
            Ok(domains) => HealthStatus {
                healthy: true,
                uri: self.uri.clone(),
                domains: domains.len(),
            },
            Err(e) => {
                warn!(uri = %self.uri, error = %e, "Health check failed");
                HealthStatus {
                    healthy: false,
                    uri: self.uri.clone(),
                    domains: 0,
                }
            }
        }
    }

    pub fn list_vms(&self) -> kvmorch_hypervisor::Result<Vec<DomainSummary>> {
        self.registry.list()
    }

    pub fn get_vm(&self, name: &str) -> kvmorch_hypervisor::Result<DomainDetails> {
        self.registry
            .get(name)?
            .ok_or_else(|| HypervisorError::VmNotFound(name.to_string()))
    }

    /// Provision a VM, refusing names that are already defined.
    ///
    /// The existence check and the definition are not atomic; two
    /// concurrent creates of one name can both pass the check, and the
    /// daemon then rejects the second definition.
    #[instrument(skip(self, request), fields(vm = %request.name))]
    pub async fn create_vm(
        &self,
        request: &ProvisioningRequest,
    ) -> kvmorch_hypervisor::Result<CreateOutcome> {
        request.validate()?;

        let registry = self.registry.clone();
        let name = request.name.clone();
        if spawn_daemon_call(move || registry.exists(&name)).await? {
            return Err(HypervisorError::Conflict(format!(
                "VM '{}' already exists",
                request.name
            )));
        }

        self.pipeline.provision(request).await?;

        let ip = if self.wait_on_create {
            match self
                .resolver
                .resolve(&request.name, Some(&request.network), None)
                .await
            {
                Ok(resolved) => Some(resolved),
                Err(HypervisorError::TimeoutNoResult(_)) => {
                    info!(vm = %request.name, "No address yet");
                    None
                }
                Err(e) => {
                    warn!(vm = %request.name, error = %e, "Address discovery failed");
                    None
                }
            }
        } else {
            None
        };

        info!(vm = %request.name, ip = ?ip.map(|r| r.ip), "VM created");
        Ok(CreateOutcome {
            name: request.name.clone(),
            ip,
        })
    }

    pub fn start_vm(&self, name: &str) -> kvmorch_hypervisor::Result<()> {
        self.registry.start(name)
    }

    pub fn shutdown_vm(&self, name: &str) -> kvmorch_hypervisor::Result<()> {
        self.registry.shutdown(name)
    }

    pub fn destroy_vm(&self, name: &str) -> kvmorch_hypervisor::Result<()> {
        self.registry.destroy(name)
    }

    pub fn delete_vm(&self, name: &str) -> kvmorch_hypervisor::Result<DeleteReport> {
        self.cleanup.delete(name)
    }

    pub async fn resolve_ip(
        &self,
        name: &str,
        network: Option<&str>,
        timeout: Option<Duration>,
    ) -> kvmorch_hypervisor::Result<ResolvedIp> {
        self.resolver.resolve(name, network, timeout).await
    }

    pub fn list_networks(&self) -> kvmorch_hypervisor::Result<Vec<NetworkSummary>> {
        self.networks.list()
    }

    pub fn ensure_network(
        &self,
        name: &str,
        bridge: &str,
    ) -> kvmorch_hypervisor::Result<NetworkSummary> {
        self.networks.ensure(name, bridge)
    }

    pub fn delete_network(&self, name: &str) -> kvmorch_hypervisor::Result<()> {
        self.networks.delete(name)
    }

    pub fn attach_interface(&self, vm: &str, network: &str) -> kvmorch_hypervisor::Result<String> {
        self.networks.attach_interface(vm, network)
    }

    pub fn detach_interface(&self, vm: &str, mac: &str) -> kvmorch_hypervisor::Result<()> {
        self.networks.detach_interface(vm, mac)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use kvmorch_hypervisor::{AddressSource, DomainState};

    pub(crate) struct Fixture {
        pub connector: MockConnector,
        pub runner: Arc<MockToolRunner>,
        pub service: Arc<OrchestratorService>,
        _images: tempfile::TempDir,
    }

    pub(crate) fn fixture(wait_on_create: bool) -> Fixture {
        let images = tempfile::tempdir().unwrap();
        let connector = MockConnector::new();
        let runner = Arc::new(MockToolRunner::new(connector.clone()));
        let provision = ProvisionConfig {
            images_dir: images.path().to_path_buf(),
            base_image: images.path().join("base.img"),
            ..Default::default()
        };
        let resolver = ResolverConfig {
            timeout: Duration::from_secs(4),
            ..Default::default()
        };
        let service = OrchestratorService::new(
            Arc::new(connector.clone()),
            runner.clone(),
            "mock",
            &provision,
            resolver,
            wait_on_create,
        );
        Fixture {
            connector,
            runner,
            service: Arc::new(service),
            _images: images,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_resolves_address() {
        let fx = fixture(true);

        let outcome = fx
            .service
            .create_vm(&ProvisioningRequest::new("web1"))
            .await
            .unwrap();

        assert_eq!(outcome.name, "web1");
        let ip = outcome.ip.unwrap();
        assert_eq!(ip.source, AddressSource::DhcpLeases);
        assert_eq!(
            fx.service.get_vm("web1").unwrap().summary.state,
            DomainState::Running
        );
    }

    #[tokio::test]
    async fn test_create_duplicate_is_conflict() {
        let fx = fixture(false);
        fx.service
            .create_vm(&ProvisioningRequest::new("web1"))
            .await
            .unwrap();
        let calls = fx.runner.invocations().len();

        let err = fx
            .service
            .create_vm(&ProvisioningRequest::new("web1"))
            .await
            .unwrap_err();

        assert!(matches!(err, HypervisorError::Conflict(_)));
        assert_eq!(fx.runner.invocations().len(), calls);
    }

    struct SlowConnector(MockConnector);

    impl Connector for SlowConnector {
        fn uri(&self) -> &str {
            self.0.uri()
        }

        fn open(&self) -> kvmorch_hypervisor::Result<Box<dyn kvmorch_hypervisor::Connection>> {
            std::thread::sleep(Duration::from_millis(300));
            self.0.open()
        }
    }

    #[tokio::test]
    async fn test_create_keeps_runtime_responsive() {
        let images = tempfile::tempdir().unwrap();
        let connector = MockConnector::new();
        let runner = Arc::new(MockToolRunner::new(connector.clone()));
        let provision = ProvisionConfig {
            images_dir: images.path().to_path_buf(),
            base_image: images.path().join("base.img"),
            ..Default::default()
        };
        let service = OrchestratorService::new(
            Arc::new(SlowConnector(connector.clone())),
            runner,
            "mock",
            &provision,
            ResolverConfig::default(),
            false,
        );

        let started = std::time::Instant::now();
        let create = tokio::spawn(async move {
            service.create_vm(&ProvisioningRequest::new("web1")).await
        });
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(started.elapsed() < Duration::from_millis(250));
        assert_eq!(create.await.unwrap().unwrap().name, "web1");
        assert!(connector.domain("web1").is_some());
    }

    #[tokio::test]
    async fn test_create_invalid_request_runs_nothing() {
        let fx = fixture(false);

        let err = fx
            .service
            .create_vm(&ProvisioningRequest::new("web1").with_vcpus(0))
            .await
            .unwrap_err();

        assert!(matches!(err, HypervisorError::InvalidRequest(_)));
        assert!(fx.runner.invocations().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_without_lease_returns_no_ip() {
        let images = tempfile::tempdir().unwrap();
        let connector = MockConnector::new();
        let runner = Arc::new(MockToolRunner::new(connector.clone()).without_leases());
        let provision = ProvisionConfig {
            images_dir: images.path().to_path_buf(),
            ..Default::default()
        };
        let service = OrchestratorService::new(
            Arc::new(connector),
            runner,
            "mock",
            &provision,
            ResolverConfig {
                timeout: Duration::from_secs(2),
                ..Default::default()
            },
            true,
        );

        let outcome = service
            .create_vm(&ProvisioningRequest::new("web1"))
            .await
            .unwrap();

        assert!(outcome.ip.is_none());
    }

    #[test]
    fn test_get_missing_vm() {
        let fx = fixture(false);

        assert!(matches!(
            fx.service.get_vm("ghost"),
            Err(HypervisorError::VmNotFound(_))
        ));
    }

    #[test]
    fn test_health_reports_connection_failure() {
        let fx = fixture(false);
        assert!(fx.service.health().healthy);

        fx.connector.set_fail_connect(true);
        let health = fx.service.health();

        assert!(!health.healthy);
        assert_eq!(health.uri, "mock:///default");
    }

    #[test]
    fn test_from_config_mock_backend() {
        let images = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.hypervisor.backend = HypervisorBackend::Mock;
        config.provision.images_dir = images.path().to_path_buf();

        let service = OrchestratorService::from_config(&config).unwrap();

        assert_eq!(service.backend(), "mock");
        assert_eq!(service.uri(), "mock:///default");
        assert_eq!(service.list_networks().unwrap().len(), 1);
    }
}
