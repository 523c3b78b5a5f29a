//! Network object lifecycle and NIC hot-plug.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use super::generate_mac_address;
use crate::capabilities::DeviceFlags;
use crate::error::{HypervisorError, Result};
use crate::registry::require_domain;
use crate::traits::{Connection, Connector};
use crate::types::NetworkSummary;
use crate::xml::{
    bridged_network_xml, DomainDescriptor, InterfaceDescriptor, NetworkDescriptor,
    DEFAULT_NIC_MODEL,
};

/// Manages network objects and VM interfaces on them.
#[derive(Clone)]
pub struct NetworkManager {
    connector: Arc<dyn Connector>,
}

impl NetworkManager {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self { connector }
    }

    /// Active networks first, then inactive ones.
    #[instrument(skip(self))]
    pub fn list(&self) -> Result<Vec<NetworkSummary>> {
        let conn = self.connector.open()?;

        let mut names = conn.list_active_network_names()?;
        names.extend(conn.list_defined_network_names()?);

        let mut networks = Vec::with_capacity(names.len());
        for name in names {
            if let Some(summary) = summarize(conn.as_ref(), &name)? {
                networks.push(summary);
            }
        }

        debug!(count = networks.len(), "Listed networks");
        Ok(networks)
    }

    /// Make sure a bridged network named `name` exists, is active and
    /// starts with the host. Existing definitions are left as they are.
    #[instrument(skip(self))]
    pub fn ensure(&self, name: &str, bridge: &str) -> Result<NetworkSummary> {
        if name.trim().is_empty() || bridge.trim().is_empty() {
            return Err(HypervisorError::InvalidRequest(
                "network name and bridge are required".to_string(),
            ));
        }

        let conn = self.connector.open()?;

        let state = match conn.network_state(name)? {
            Some(state) => state,
            None => {
                let xml = bridged_network_xml(name, bridge);
                debug!(xml = %xml, "Defining network");
                conn.define_network(&xml)?;
                info!(bridge = %bridge, "Network defined");
                conn.network_state(name)?
                    .ok_or_else(|| HypervisorError::NetworkNotFound(name.to_string()))?
            }
        };

        if !state.active {
            conn.start_network(name)?;
            info!("Network started");
        }
        if !state.autostart {
            conn.set_network_autostart(name, true)?;
            debug!("Network autostart enabled");
        }

        summarize(conn.as_ref(), name)?
            .ok_or_else(|| HypervisorError::NetworkNotFound(name.to_string()))
    }

    /// Stop (if active) and undefine.
    #[instrument(skip(self))]
    pub fn delete(&self, name: &str) -> Result<()> {
        let conn = self.connector.open()?;

        let state = conn
            .network_state(name)?
            .ok_or_else(|| HypervisorError::NetworkNotFound(name.to_string()))?;

        if state.active {
            conn.stop_network(name)?;
            debug!("Network stopped");
        }
        conn.undefine_network(name)?;

        info!("Network deleted");
        Ok(())
    }

    /// Add a virtio NIC on `network` to `vm`. The change is persistent
    /// and also applied live when the VM is running. Returns the MAC.
    #[instrument(skip(self))]
    pub fn attach_interface(&self, vm: &str, network: &str) -> Result<String> {
        let conn = self.connector.open()?;
        let domain = require_domain(conn.as_ref(), vm)?;

        if conn.network_state(network)?.is_none() {
            return Err(HypervisorError::NetworkNotFound(network.to_string()));
        }

        let mac = generate_mac_address();
        let iface = InterfaceDescriptor {
            mac: Some(mac.clone()),
            network: Some(network.to_string()),
            bridge: None,
            model: Some(DEFAULT_NIC_MODEL.to_string()),
        };
        let flags = DeviceFlags::for_domain(domain.active);

        conn.attach_device(vm, &iface.to_xml(), flags)?;

        info!(mac = %mac, live = flags.live, "Interface attached");
        Ok(mac)
    }

    /// Remove the NIC with hardware address `mac` (any case) from `vm`.
    #[instrument(skip(self))]
    pub fn detach_interface(&self, vm: &str, mac: &str) -> Result<()> {
        let conn = self.connector.open()?;
        let domain = require_domain(conn.as_ref(), vm)?;

        let descriptor = DomainDescriptor::parse(&conn.domain_xml(vm)?)?;
        let iface = descriptor
            .find_interface(mac)
            .ok_or_else(|| HypervisorError::InterfaceNotFound {
                vm: vm.to_string(),
                mac: mac.to_string(),
            })?;
        let flags = DeviceFlags::for_domain(domain.active);

        conn.detach_device(vm, &iface.to_xml(), flags)?;

        info!(live = flags.live, "Interface detached");
        Ok(())
    }
}

/// Summary of one network, `None` if it vanished mid-listing.
fn summarize(conn: &dyn Connection, name: &str) -> Result<Option<NetworkSummary>> {
    let Some(state) = conn.network_state(name)? else {
        return Ok(None);
    };

    let bridge = match conn.network_xml(name) {
        Ok(xml) => NetworkDescriptor::parse(&xml)?.bridge,
        Err(e) if e.is_not_found() => return Ok(None),
        Err(e) => {
            warn!(network = %name, error = %e, "Network descriptor unavailable");
            None
        }
    };

    Ok(Some(NetworkSummary {
        name: name.to_string(),
        active: state.active,
        autostart: state.autostart,
        bridge,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockConnector, MockDomain};

    fn setup() -> (MockConnector, NetworkManager) {
        let connector = MockConnector::new();
        let manager = NetworkManager::new(Arc::new(connector.clone()));
        (connector, manager)
    }

    #[test]
    fn test_ensure_is_idempotent() {
        let (connector, manager) = setup();

        let first = manager.ensure("lan", "br0").unwrap();
        let second = manager.ensure("lan", "br0").unwrap();

        assert_eq!(first, second);
        assert!(first.active);
        assert!(first.autostart);
        assert_eq!(first.bridge.as_deref(), Some("br0"));
        assert_eq!(connector.network_count(), 2);
    }

    #[test]
    fn test_ensure_starts_inactive_network() {
        let (connector, manager) = setup();
        connector.add_network(&bridged_network_xml("lan", "br0"), false);

        let summary = manager.ensure("lan", "br9").unwrap();

        assert!(summary.active);
        assert_eq!(summary.bridge.as_deref(), Some("br0"));
    }

    #[test]
    fn test_list_orders_active_first() {
        let (connector, manager) = setup();
        connector.add_network(&bridged_network_xml("aaa", "br1"), false);

        let names: Vec<String> = manager.list().unwrap().into_iter().map(|n| n.name).collect();
        assert_eq!(names, vec!["default".to_string(), "aaa".to_string()]);
    }

    #[test]
    fn test_delete() {
        let (connector, manager) = setup();
        manager.ensure("lan", "br0").unwrap();

        manager.delete("lan").unwrap();

        assert!(connector.network("lan").is_none());
        assert!(matches!(
            manager.delete("lan"),
            Err(HypervisorError::NetworkNotFound(_))
        ));
    }

    #[test]
    fn test_attach_to_stopped_vm_is_config_only() {
        let (connector, manager) = setup();
        connector.add_domain(MockDomain::new("web1"));

        let mac = manager.attach_interface("web1", "default").unwrap();

        let domain = connector.domain("web1").unwrap();
        assert!(domain.interfaces.iter().any(|i| i.has_mac(&mac)));
    }

    #[test]
    fn test_attach_to_unknown_network() {
        let (connector, manager) = setup();
        connector.add_domain(MockDomain::new("web1").running());

        assert!(matches!(
            manager.attach_interface("web1", "nope"),
            Err(HypervisorError::NetworkNotFound(_))
        ));
    }

    #[test]
    fn test_detach_matches_mac_case_insensitively() {
        let (connector, manager) = setup();
        connector.add_domain(
            MockDomain::new("web1")
                .running()
                .with_interface("52:54:00:aa:bb:cc", "default"),
        );

        manager.detach_interface("web1", "52:54:00:AA:BB:CC").unwrap();

        assert!(connector.domain("web1").unwrap().interfaces.is_empty());
    }

    #[test]
    fn test_missing_vm() {
        let (_, manager) = setup();

        assert!(matches!(
            manager.attach_interface("ghost", "default"),
            Err(HypervisorError::VmNotFound(_))
        ));
        assert!(matches!(
            manager.detach_interface("ghost", "52:54:00:00:00:01"),
            Err(HypervisorError::VmNotFound(_))
        ));
    }
}
