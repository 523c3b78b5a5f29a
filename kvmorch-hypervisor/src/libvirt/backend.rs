//! Connections to a libvirt daemon through the `virt` bindings.

use tracing::{debug, info, warn};
use virt::connect::Connect;
use virt::domain::Domain;
use virt::error::ErrorNumber;
use virt::network::Network;
use virt::storage_vol::StorageVol;
use virt::sys;

use crate::capabilities::{DaemonCapabilities, DeviceFlags, UndefineFlags};
use crate::error::{HypervisorError, Result};
use crate::traits::{Connection, Connector};
use crate::types::{DomainInfo, DomainState, DomainSummary, GuestInterface, NetworkState};
use crate::xml::DomainDescriptor;

/// Opens connections to one libvirt URI.
///
/// Common URIs:
/// - `qemu:///system` - System-wide QEMU/KVM
/// - `qemu:///session` - User session QEMU
/// - `qemu+ssh://user@host/system` - Remote via SSH
#[derive(Debug, Clone)]
pub struct LibvirtConnector {
    uri: String,
}

impl LibvirtConnector {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }
}

impl Connector for LibvirtConnector {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn open(&self) -> Result<Box<dyn Connection>> {
        debug!(uri = %self.uri, "Connecting to libvirt");

        let conn = Connect::open(Some(&self.uri))
            .map_err(|e| HypervisorError::ConnectionFailed(e.to_string()))?;

        Ok(Box::new(LibvirtConnection {
            uri: self.uri.clone(),
            conn,
        }))
    }
}

/// One open libvirt connection, closed on drop.
pub struct LibvirtConnection {
    uri: String,
    conn: Connect,
}

impl Drop for LibvirtConnection {
    fn drop(&mut self) {
        if let Err(e) = self.conn.close() {
            warn!(uri = %self.uri, error = %e, "Failed to close libvirt connection");
        }
    }
}

fn failed(e: virt::error::Error) -> HypervisorError {
    HypervisorError::OperationFailed(e.to_string())
}

/// The daemon's "no such domain/network" codes.
fn is_missing(code: &ErrorNumber) -> bool {
    matches!(code, ErrorNumber::NoDomain | ErrorNumber::NoNetwork)
}

/// A lookup result where only a missing object counts as absent.
fn found<T>(lookup: std::result::Result<T, virt::error::Error>) -> Result<Option<T>> {
    match lookup {
        Ok(object) => Ok(Some(object)),
        Err(e) if is_missing(&e.code()) => Ok(None),
        Err(e) => Err(failed(e)),
    }
}

impl LibvirtConnection {
    fn domain(&self, name: &str) -> Result<Domain> {
        found(Domain::lookup_by_name(&self.conn, name))?
            .ok_or_else(|| HypervisorError::VmNotFound(name.to_string()))
    }

    fn network(&self, name: &str) -> Result<Network> {
        found(Network::lookup_by_name(&self.conn, name))?
            .ok_or_else(|| HypervisorError::NetworkNotFound(name.to_string()))
    }

    fn summarize(domain: &Domain) -> Result<DomainSummary> {
        let (state, _) = domain.get_state().map_err(failed)?;
        Ok(DomainSummary {
            name: domain.get_name().map_err(failed)?,
            uuid: domain.get_uuid_string().map_err(failed)?,
            state: DomainState::from_raw(state),
            active: domain.is_active().map_err(failed)?,
        })
    }

    /// Storage volumes are managed when at least one pool answers.
    fn storage_driver_present(&self) -> bool {
        self.conn.list_storage_pools().is_ok() || self.conn.list_defined_storage_pools().is_ok()
    }

    fn delete_volumes(&self, paths: &[String]) {
        for path in paths {
            match StorageVol::lookup_by_path(&self.conn, path) {
                Ok(vol) => match vol.delete(0) {
                    Ok(()) => debug!(path = %path, "Storage volume deleted"),
                    Err(e) => debug!(path = %path, error = %e, "Storage volume not deleted"),
                },
                Err(_) => debug!(path = %path, "Not a managed storage volume"),
            }
        }
    }
}

impl Connection for LibvirtConnection {
    fn capabilities(&self) -> Result<DaemonCapabilities> {
        let version = self
            .conn
            .get_lib_version()
            .map_err(|e| HypervisorError::Internal(e.to_string()))?;
        let caps = DaemonCapabilities::negotiate(version, self.storage_driver_present());
        debug!(version = %caps.version_string(), remove_storage = caps.remove_storage, "Negotiated capabilities");
        Ok(caps)
    }

    fn list_active_domain_ids(&self) -> Result<Vec<u32>> {
        self.conn.list_domains().map_err(failed)
    }

    fn list_defined_domain_names(&self) -> Result<Vec<String>> {
        self.conn.list_defined_domains().map_err(failed)
    }

    fn domain_summary_by_id(&self, id: u32) -> Result<Option<DomainSummary>> {
        match found(Domain::lookup_by_id(&self.conn, id))? {
            Some(domain) => Self::summarize(&domain).map(Some),
            None => Ok(None),
        }
    }

    fn domain_summary(&self, name: &str) -> Result<Option<DomainSummary>> {
        match found(Domain::lookup_by_name(&self.conn, name))? {
            Some(domain) => Self::summarize(&domain).map(Some),
            None => Ok(None),
        }
    }

    fn domain_info(&self, name: &str) -> Result<DomainInfo> {
        let info = self.domain(name)?.get_info().map_err(failed)?;
        Ok(DomainInfo {
            state: info.state,
            max_memory_kib: info.max_mem,
            memory_kib: info.memory,
            vcpus: info.nr_virt_cpu,
            cpu_time_ns: info.cpu_time,
        })
    }

    fn domain_xml(&self, name: &str) -> Result<String> {
        self.domain(name)?.get_xml_desc(0).map_err(failed)
    }

    fn start_domain(&self, name: &str) -> Result<()> {
        self.domain(name)?.create().map_err(failed)?;
        Ok(())
    }

    fn shutdown_domain(&self, name: &str) -> Result<()> {
        self.domain(name)?.shutdown().map_err(failed)?;
        Ok(())
    }

    fn destroy_domain(&self, name: &str) -> Result<()> {
        self.domain(name)?.destroy().map_err(failed)?;
        Ok(())
    }

    fn undefine_domain(&self, name: &str, flags: UndefineFlags) -> Result<()> {
        let domain = self.domain(name)?;

        // Volume paths have to be read before the definition is gone.
        let volumes = if flags.remove_storage {
            let xml = domain.get_xml_desc(0).map_err(failed)?;
            DomainDescriptor::parse(&xml)?.disk_paths
        } else {
            Vec::new()
        };

        let mut raw = 0;
        if flags.managed_save {
            raw |= sys::VIR_DOMAIN_UNDEFINE_MANAGED_SAVE;
        }
        if flags.snapshots_metadata {
            raw |= sys::VIR_DOMAIN_UNDEFINE_SNAPSHOTS_METADATA;
        }
        if flags.nvram {
            raw |= sys::VIR_DOMAIN_UNDEFINE_NVRAM;
        }

        if raw == 0 {
            domain.undefine().map_err(failed)?;
        } else {
            domain.undefine_flags(raw).map_err(failed)?;
        }

        if !volumes.is_empty() {
            self.delete_volumes(&volumes);
        }

        info!(vm = %name, "Domain undefined");
        Ok(())
    }

    fn attach_device(&self, name: &str, device_xml: &str, flags: DeviceFlags) -> Result<()> {
        self.domain(name)?
            .attach_device_flags(device_xml, device_flags(flags))
            .map_err(failed)?;
        Ok(())
    }

    fn detach_device(&self, name: &str, device_xml: &str, flags: DeviceFlags) -> Result<()> {
        self.domain(name)?
            .detach_device_flags(device_xml, device_flags(flags))
            .map_err(failed)?;
        Ok(())
    }

    fn guest_agent_interfaces(&self, name: &str) -> Result<Vec<GuestInterface>> {
        let interfaces = self
            .domain(name)?
            .interface_addresses(sys::VIR_DOMAIN_INTERFACE_ADDRESSES_SRC_AGENT, 0)
            .map_err(failed)?;

        Ok(interfaces
            .into_iter()
            .map(|iface| GuestInterface {
                name: iface.name,
                hwaddr: Some(iface.hwaddr).filter(|h| !h.is_empty()),
                addresses: iface
                    .addrs
                    .into_iter()
                    .map(|a| format!("{}/{}", a.addr, a.prefix))
                    .collect(),
            })
            .collect())
    }

    fn list_active_network_names(&self) -> Result<Vec<String>> {
        self.conn.list_networks().map_err(failed)
    }

    fn list_defined_network_names(&self) -> Result<Vec<String>> {
        self.conn.list_defined_networks().map_err(failed)
    }

    fn network_state(&self, name: &str) -> Result<Option<NetworkState>> {
        let Some(network) = found(Network::lookup_by_name(&self.conn, name))? else {
            return Ok(None);
        };
        Ok(Some(NetworkState {
            active: network.is_active().map_err(failed)?,
            autostart: network.get_autostart().map_err(failed)?,
        }))
    }

    fn network_xml(&self, name: &str) -> Result<String> {
        self.network(name)?.get_xml_desc(0).map_err(failed)
    }

    fn define_network(&self, xml: &str) -> Result<()> {
        Network::define_xml(&self.conn, xml).map_err(failed)?;
        Ok(())
    }

    fn start_network(&self, name: &str) -> Result<()> {
        self.network(name)?.create().map_err(failed)?;
        Ok(())
    }

    fn stop_network(&self, name: &str) -> Result<()> {
        self.network(name)?.destroy().map_err(failed)?;
        Ok(())
    }

    fn undefine_network(&self, name: &str) -> Result<()> {
        self.network(name)?.undefine().map_err(failed)?;
        Ok(())
    }

    fn set_network_autostart(&self, name: &str, autostart: bool) -> Result<()> {
        self.network(name)?.set_autostart(autostart).map_err(failed)?;
        Ok(())
    }

    fn network_dhcp_leases(&self, name: &str) -> Result<String> {
        // The lease table is read the way an operator would, through virsh.
        let output = std::process::Command::new("virsh")
            .args(["-c", self.uri.as_str(), "net-dhcp-leases", name])
            .output()
            .map_err(|e| HypervisorError::ExternalTool {
                tool: "virsh".to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.contains("Network not found") {
                return Err(HypervisorError::NetworkNotFound(name.to_string()));
            }
            return Err(HypervisorError::ExternalTool {
                tool: "virsh".to_string(),
                message: stderr,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn device_flags(flags: DeviceFlags) -> u32 {
    let mut raw = 0;
    if flags.live {
        raw |= sys::VIR_DOMAIN_AFFECT_LIVE;
    }
    if flags.config {
        raw |= sys::VIR_DOMAIN_AFFECT_CONFIG;
    }
    raw
}
