//! End-to-end lifecycle tests.
//!
//! These drive every component against the in-memory daemon, with the
//! provisioning tools interpreted by the mock tool runner.

use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use kvmorch_hypervisor::{
    AddressSource, CleanupOrchestrator, CommandRunner, DomainRegistry, DomainState,
    HypervisorError, IpResolver, MockConnector, MockDomain, MockToolRunner, NetworkManager,
    ProvisionConfig, ProvisioningPipeline, ProvisioningRequest, ResolverConfig,
};

struct Host {
    connector: MockConnector,
    runner: Arc<MockToolRunner>,
    images: tempfile::TempDir,
}

impl Host {
    fn new() -> Self {
        let connector = MockConnector::new();
        let runner = Arc::new(MockToolRunner::new(connector.clone()));
        Self {
            connector,
            runner,
            images: tempfile::tempdir().unwrap(),
        }
    }

    fn pipeline(&self) -> ProvisioningPipeline {
        let config = ProvisionConfig {
            images_dir: self.images.path().to_path_buf(),
            base_image: self.images.path().join("base.img"),
            ..Default::default()
        };
        let runner: Arc<dyn CommandRunner> = self.runner.clone();
        ProvisioningPipeline::new("mock:///default", runner, &config)
    }

    fn registry(&self) -> DomainRegistry {
        DomainRegistry::new(Arc::new(self.connector.clone()))
    }

    fn cleanup(&self) -> CleanupOrchestrator {
        CleanupOrchestrator::new(Arc::new(self.connector.clone()))
    }

    fn networks(&self) -> NetworkManager {
        NetworkManager::new(Arc::new(self.connector.clone()))
    }

    fn resolver(&self) -> IpResolver {
        IpResolver::new(
            Arc::new(self.connector.clone()),
            ResolverConfig {
                timeout: Duration::from_secs(4),
                ..Default::default()
            },
        )
    }
}

/// Create `web1` with defaults and inspect every artifact.
#[tokio::test]
async fn test_web1_scenario() {
    let host = Host::new();

    let provisioned = host
        .pipeline()
        .provision(&ProvisioningRequest::new("web1").with_ssh_key("ssh-ed25519 AAAA test"))
        .await
        .unwrap();

    let qemu_img = &host.runner.invocations()[0];
    assert_eq!(qemu_img.args.last().map(String::as_str), Some("10G"));
    assert!(provisioned.disk_path.exists());

    let seed = std::fs::read_to_string(&provisioned.seed_path).unwrap();
    assert!(seed.contains("hostname: web1"));
    assert!(seed.contains("ssh-ed25519 AAAA test"));
    assert!(seed.contains("local-hostname: web1"));

    let details = host.registry().get("web1").unwrap().unwrap();
    assert_eq!(details.summary.state, DomainState::Running);
    assert!(details.summary.active);
    assert_eq!(details.vcpus, 2);
    assert_eq!(details.memory_kib_max, 2048 * 1024);

    assert_eq!(host.connector.open_connections(), 0);
}

/// The daemon refuses a second definition with the same name.
#[tokio::test]
async fn test_duplicate_install_is_rejected() {
    let host = Host::new();
    let pipeline = host.pipeline();

    pipeline.provision(&ProvisioningRequest::new("web1")).await.unwrap();
    let err = pipeline
        .provision(&ProvisioningRequest::new("web1"))
        .await
        .unwrap_err();

    match err {
        HypervisorError::ExternalTool { tool, message } => {
            assert_eq!(tool, "virt-install");
            assert!(message.contains("already in use"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

/// A failing step leaves the earlier artifacts in place.
#[tokio::test]
async fn test_failed_install_keeps_earlier_artifacts() {
    let host = Host::new();
    host.runner.fail_tool("virt-install");

    let result = host.pipeline().provision(&ProvisioningRequest::new("web1")).await;

    assert!(matches!(result, Err(HypervisorError::ExternalTool { .. })));
    assert!(host.images.path().join("web1.qcow2").exists());
    assert!(host.images.path().join("web1-seed.iso").exists());
    assert!(host.registry().get("web1").unwrap().is_none());
}

#[tokio::test]
async fn test_delete_removes_domain_and_artifacts() {
    let host = Host::new();
    let provisioned = host
        .pipeline()
        .provision(&ProvisioningRequest::new("web1"))
        .await
        .unwrap();

    let report = host.cleanup().delete("web1").unwrap();

    assert!(report.is_clean());
    assert!(host.registry().get("web1").unwrap().is_none());
    assert!(!provisioned.disk_path.exists());
    assert!(!provisioned.seed_path.exists());
    assert!(matches!(
        host.cleanup().delete("web1"),
        Err(HypervisorError::VmNotFound(_))
    ));
}

#[tokio::test]
async fn test_power_commands_are_idempotent() {
    let host = Host::new();
    host.pipeline()
        .provision(&ProvisioningRequest::new("web1"))
        .await
        .unwrap();
    let registry = host.registry();

    registry.start("web1").unwrap();
    registry.destroy("web1").unwrap();
    registry.destroy("web1").unwrap();
    assert_eq!(registry.state("web1").unwrap(), Some(DomainState::Shutoff));

    registry.start("web1").unwrap();
    registry.start("web1").unwrap();
    assert_eq!(registry.state("web1").unwrap(), Some(DomainState::Running));
}

#[tokio::test(start_paused = true)]
async fn test_new_vm_resolves_from_leases() {
    let host = Host::new();
    host.pipeline()
        .provision(&ProvisioningRequest::new("web1"))
        .await
        .unwrap();

    let resolved = host.resolver().resolve("web1", None, None).await.unwrap();

    assert_eq!(resolved.source, AddressSource::DhcpLeases);
    assert_eq!(resolved.ip.octets()[..3], [192, 168, 122]);
}

#[tokio::test(start_paused = true)]
async fn test_silent_agent_falls_back_to_lease() {
    let host = Host::new();
    host.connector.add_domain(
        MockDomain::new("db")
            .running()
            .with_interface("52:54:00:aa:bb:cc", "default"),
    );
    host.connector
        .add_lease("default", "52:54:00:AA:BB:CC", "10.0.0.5/24", "db");

    let resolved = host
        .resolver()
        .resolve("db", Some("default"), None)
        .await
        .unwrap();

    assert_eq!(resolved.ip, Ipv4Addr::new(10, 0, 0, 5));
    assert_eq!(resolved.source, AddressSource::DhcpLeases);
}

#[tokio::test(start_paused = true)]
async fn test_unresolvable_vm_times_out() {
    let host = Host::new();
    host.connector.add_domain(
        MockDomain::new("db")
            .running()
            .with_interface("52:54:00:aa:bb:cc", "default"),
    );

    let start = tokio::time::Instant::now();
    let result = host
        .resolver()
        .resolve("db", None, Some(Duration::from_secs(2)))
        .await;

    assert!(matches!(result, Err(HypervisorError::TimeoutNoResult(_))));
    assert!(start.elapsed() <= Duration::from_secs(4) + Duration::from_secs(2));
}

#[test]
fn test_ensure_twice_yields_one_network() {
    let host = Host::new();
    let networks = host.networks();

    networks.ensure("lan", "br0").unwrap();
    networks.ensure("lan", "br0").unwrap();

    let lan: Vec<_> = networks
        .list()
        .unwrap()
        .into_iter()
        .filter(|n| n.name == "lan")
        .collect();
    assert_eq!(lan.len(), 1);
    assert!(lan[0].active && lan[0].autostart);
}

#[tokio::test]
async fn test_attach_then_detach() {
    let host = Host::new();
    host.pipeline()
        .provision(&ProvisioningRequest::new("web1"))
        .await
        .unwrap();
    let networks = host.networks();
    networks.ensure("lan", "br0").unwrap();

    let mac = networks.attach_interface("web1", "lan").unwrap();
    let descriptor = host.registry().descriptor("web1").unwrap();
    assert_eq!(descriptor.interfaces.len(), 2);
    assert!(descriptor.networks().contains(&"lan".to_string()));

    networks
        .detach_interface("web1", &mac.to_uppercase())
        .unwrap();
    assert_eq!(host.registry().descriptor("web1").unwrap().interfaces.len(), 1);
}

#[tokio::test]
async fn test_detach_unknown_mac_changes_nothing() {
    let host = Host::new();
    host.pipeline()
        .provision(&ProvisioningRequest::new("web1"))
        .await
        .unwrap();
    let before = host.registry().descriptor("web1").unwrap();

    let err = host
        .networks()
        .detach_interface("web1", "aa:bb:cc:dd:ee:ff")
        .unwrap_err();

    assert!(matches!(err, HypervisorError::InterfaceNotFound { .. }));
    assert_eq!(host.registry().descriptor("web1").unwrap(), before);
}

#[test]
fn test_images_dir_layout() {
    let host = Host::new();
    let layout = host.pipeline().layout().clone();

    assert_eq!(
        layout.disk_path("web1"),
        host.images.path().join("web1.qcow2")
    );
    assert!(layout.seed_path("web1").starts_with(Path::new(host.images.path())));
}
