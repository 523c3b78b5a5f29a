//! Control-connection abstraction over the virtualization daemon.
//!
//! Components never hold a connection across operations: each call asks
//! the [`Connector`] for a fresh [`Connection`] and drops it on every exit
//! path, which closes it.

use crate::capabilities::{DaemonCapabilities, DeviceFlags, UndefineFlags};
use crate::error::{HypervisorError, Result};
use crate::types::{DomainInfo, DomainSummary, GuestInterface, NetworkState};

/// Run a synchronous daemon call on tokio's blocking pool, inside the
/// caller's tracing span.
pub async fn spawn_daemon_call<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let span = tracing::Span::current();
    tokio::task::spawn_blocking(move || span.in_scope(f))
        .await
        .map_err(|e| HypervisorError::Internal(format!("daemon call aborted: {}", e)))?
}

/// Opens scoped connections to one daemon endpoint.
pub trait Connector: Send + Sync {
    /// Connection URI, e.g. `qemu:///system`.
    fn uri(&self) -> &str;

    /// Open a connection. Fails with `ConnectionFailed`.
    fn open(&self) -> Result<Box<dyn Connection>>;
}

/// One open connection. Closing happens on drop.
///
/// Lookup-style methods return `Ok(None)` for a missing object; every
/// other per-object method reports a missing object as the matching
/// `*NotFound` error.
pub trait Connection: Send {
    /// Negotiate optional features with the daemon.
    fn capabilities(&self) -> Result<DaemonCapabilities>;

    // =========================================================================
    // Domains
    // =========================================================================

    /// Numeric handles of running domains.
    fn list_active_domain_ids(&self) -> Result<Vec<u32>>;

    /// Names of defined domains that are not running.
    fn list_defined_domain_names(&self) -> Result<Vec<String>>;

    /// Summary of a running domain by numeric handle.
    fn domain_summary_by_id(&self, id: u32) -> Result<Option<DomainSummary>>;

    /// Summary of a domain by name.
    fn domain_summary(&self, name: &str) -> Result<Option<DomainSummary>>;

    /// Resource figures of a domain.
    fn domain_info(&self, name: &str) -> Result<DomainInfo>;

    /// Domain descriptor XML.
    fn domain_xml(&self, name: &str) -> Result<String>;

    fn start_domain(&self, name: &str) -> Result<()>;

    /// Request a graceful power-off. Does not wait.
    fn shutdown_domain(&self, name: &str) -> Result<()>;

    /// Hard stop.
    fn destroy_domain(&self, name: &str) -> Result<()>;

    fn undefine_domain(&self, name: &str, flags: UndefineFlags) -> Result<()>;

    fn attach_device(&self, name: &str, device_xml: &str, flags: DeviceFlags) -> Result<()>;

    fn detach_device(&self, name: &str, device_xml: &str, flags: DeviceFlags) -> Result<()>;

    /// Interfaces as reported by the in-guest agent.
    fn guest_agent_interfaces(&self, name: &str) -> Result<Vec<GuestInterface>>;

    // =========================================================================
    // Networks
    // =========================================================================

    fn list_active_network_names(&self) -> Result<Vec<String>>;

    fn list_defined_network_names(&self) -> Result<Vec<String>>;

    fn network_state(&self, name: &str) -> Result<Option<NetworkState>>;

    fn network_xml(&self, name: &str) -> Result<String>;

    fn define_network(&self, xml: &str) -> Result<()>;

    fn start_network(&self, name: &str) -> Result<()>;

    fn stop_network(&self, name: &str) -> Result<()>;

    fn undefine_network(&self, name: &str) -> Result<()>;

    fn set_network_autostart(&self, name: &str, autostart: bool) -> Result<()>;

    /// The network's DHCP lease table as free text.
    fn network_dhcp_leases(&self, name: &str) -> Result<String>;
}
