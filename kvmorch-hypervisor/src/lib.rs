//! # kvmorch Hypervisor
//!
//! VM lifecycle orchestration on a single libvirt host.
//!
//! Every component holds an [`Arc<dyn Connector>`](Connector) and opens a
//! fresh connection per operation:
//!
//! ```text
//! ┌────────────────┐ ┌──────────────────────┐ ┌────────────────────┐
//! │ DomainRegistry │ │ ProvisioningPipeline │ │ CleanupOrchestrator│
//! └───────┬────────┘ └──────────┬───────────┘ └─────────┬──────────┘
//!         │   ┌────────────┐    │ qemu-img             │
//!         │   │ IpResolver │    │ cloud-localds        │
//!         │   └─────┬──────┘    │ virt-install         │
//!         ▼         ▼           ▼                      ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │            Connector / Connection  (libvirt or mock)             │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use kvmorch_hypervisor::{MockConnector, DomainRegistry};
//!
//! let connector = Arc::new(MockConnector::new());
//! let registry = DomainRegistry::new(connector);
//! for vm in registry.list()? {
//!     println!("{} {}", vm.name, vm.state);
//! }
//! ```

pub mod capabilities;
pub mod cleanup;
pub mod cloudinit;
pub mod error;
pub mod libvirt;
pub mod mock;
pub mod network;
pub mod provision;
pub mod registry;
pub mod resolver;
pub mod storage;
pub mod tools;
pub mod traits;
pub mod types;
pub mod xml;

pub use capabilities::{DaemonCapabilities, DeviceFlags, UndefineFlags};
pub use cleanup::CleanupOrchestrator;
pub use cloudinit::{SeedConfig, SeedImageGenerator, SeedTool};
pub use error::{HypervisorError, Result};
pub use mock::{MockConnector, MockDomain, MockToolRunner};
pub use network::NetworkManager;
pub use provision::{ProvisionConfig, ProvisioningPipeline};
pub use registry::DomainRegistry;
pub use resolver::{parse_lease_table, IpResolver, LeaseRecord, ResolverConfig};
pub use storage::ImageLayout;
pub use tools::{CommandRunner, SystemCommandRunner, ToolInvocation, ToolOutput};
pub use traits::{spawn_daemon_call, Connection, Connector};
pub use types::*;
pub use xml::{DomainDescriptor, InterfaceDescriptor, NetworkDescriptor};

// Re-export libvirt backend when available
#[cfg(feature = "libvirt")]
pub use libvirt::{LibvirtConnection, LibvirtConnector};
