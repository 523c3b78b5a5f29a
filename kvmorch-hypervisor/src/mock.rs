//! In-memory daemon and tool runner for testing and development.
//!
//! [`MockConnector`] simulates the virtualization daemon: domains, networks,
//! lease tables and guest-agent replies live in shared memory and behave
//! the way the real daemon does for the calls this crate makes (starting a
//! running domain is rejected, undefine with storage removal deletes the
//! overlay, and so on). [`MockToolRunner`] interprets `qemu-img`,
//! `cloud-localds` and `virt-install` invocations against the same state,
//! so the whole provisioning pipeline runs without a hypervisor.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockWriteGuard};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::capabilities::{DaemonCapabilities, DeviceFlags, UndefineFlags};
use crate::error::{HypervisorError, Result};
use crate::network::generate_mac_address;
use crate::tools::{CommandRunner, ToolInvocation, ToolOutput};
use crate::traits::{Connection, Connector};
use crate::types::{DomainInfo, DomainState, DomainSummary, GuestInterface, NetworkState};
use crate::xml::{DomainXmlBuilder, InterfaceDescriptor, NetworkDescriptor};

/// Header `virsh net-dhcp-leases` prints above the lease rows.
pub const LEASE_TABLE_HEADER: &str = " Expiry Time           MAC address         Protocol   IP address           Hostname   Client ID or DUID\n-------------------------------------------------------------------------------------------------------------\n";

/// A simulated domain.
#[derive(Debug, Clone)]
pub struct MockDomain {
    pub name: String,
    pub uuid: String,
    pub id: Option<u32>,
    pub state: DomainState,
    pub vcpus: u32,
    pub memory_kib: u64,
    /// `(path, device)` with device `disk`, `cdrom` or `block`.
    pub disks: Vec<(String, String)>,
    pub nvram: Option<String>,
    pub interfaces: Vec<InterfaceDescriptor>,
    /// `None` while the guest agent is not answering.
    pub agent_interfaces: Option<Vec<GuestInterface>>,
}

impl MockDomain {
    /// A stopped domain with one vcpu and 1 GiB of memory.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uuid: uuid::Uuid::new_v4().to_string(),
            id: None,
            state: DomainState::Shutoff,
            vcpus: 1,
            memory_kib: 1024 * 1024,
            disks: Vec::new(),
            nvram: None,
            interfaces: Vec::new(),
            agent_interfaces: None,
        }
    }

    /// Mark as running. The numeric handle is assigned when added.
    pub fn running(mut self) -> Self {
        self.state = DomainState::Running;
        self
    }

    pub fn with_vcpus(mut self, vcpus: u32) -> Self {
        self.vcpus = vcpus;
        self
    }

    pub fn with_memory_kib(mut self, memory_kib: u64) -> Self {
        self.memory_kib = memory_kib;
        self
    }

    pub fn with_disk(mut self, path: impl Into<String>) -> Self {
        self.disks.push((path.into(), "disk".to_string()));
        self
    }

    pub fn with_cdrom(mut self, path: impl Into<String>) -> Self {
        self.disks.push((path.into(), "cdrom".to_string()));
        self
    }

    /// Pass a host block device through as a disk.
    pub fn with_block_disk(mut self, dev: impl Into<String>) -> Self {
        self.disks.push((dev.into(), "block".to_string()));
        self
    }

    pub fn with_nvram(mut self, path: impl Into<String>) -> Self {
        self.nvram = Some(path.into());
        self
    }

    /// Add a virtio NIC on `network`.
    pub fn with_interface(mut self, mac: impl Into<String>, network: impl Into<String>) -> Self {
        self.interfaces.push(InterfaceDescriptor {
            mac: Some(mac.into()),
            network: Some(network.into()),
            bridge: None,
            model: Some("virtio".to_string()),
        });
        self
    }

    /// Make the guest agent answer with these interfaces.
    pub fn with_agent_interfaces(mut self, interfaces: Vec<GuestInterface>) -> Self {
        self.agent_interfaces = Some(interfaces);
        self
    }

    pub fn is_active(&self) -> bool {
        self.id.is_some()
    }

    fn summary(&self) -> DomainSummary {
        DomainSummary {
            name: self.name.clone(),
            uuid: self.uuid.clone(),
            state: self.state,
            active: self.is_active(),
        }
    }

    fn xml(&self) -> String {
        let mut builder = DomainXmlBuilder::new(&self.name, &self.uuid)
            .memory_kib(self.memory_kib)
            .vcpus(self.vcpus)
            .nvram(self.nvram.as_deref())
            .interfaces(&self.interfaces);
        for (path, device) in &self.disks {
            builder = builder.disk(path, device);
        }
        builder.build()
    }
}

/// A simulated network object.
#[derive(Debug, Clone)]
pub struct MockNetwork {
    pub name: String,
    pub xml: String,
    pub active: bool,
    pub autostart: bool,
}

impl MockNetwork {
    fn bridge(&self) -> Option<String> {
        NetworkDescriptor::parse(&self.xml).ok().and_then(|d| d.bridge)
    }
}

#[derive(Default)]
struct MockDaemon {
    domains: BTreeMap<String, MockDomain>,
    networks: BTreeMap<String, MockNetwork>,
    leases: HashMap<String, String>,
    capabilities: DaemonCapabilities,
    next_id: u32,
    next_lease_host: u8,
    fail_connect: bool,
    reject_flagged_undefine: bool,
    info_unavailable: HashSet<String>,
    stops_during_destroy: HashSet<String>,
    open_connections: usize,
    opened_total: usize,
    undefine_calls: Vec<UndefineFlags>,
}

impl MockDaemon {
    fn assign_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn domain(&self, name: &str) -> Result<&MockDomain> {
        self.domains
            .get(name)
            .ok_or_else(|| HypervisorError::VmNotFound(name.to_string()))
    }

    fn domain_mut(&mut self, name: &str) -> Result<&mut MockDomain> {
        self.domains
            .get_mut(name)
            .ok_or_else(|| HypervisorError::VmNotFound(name.to_string()))
    }

    fn network_mut(&mut self, name: &str) -> Result<&mut MockNetwork> {
        self.networks
            .get_mut(name)
            .ok_or_else(|| HypervisorError::NetworkNotFound(name.to_string()))
    }

    fn append_lease(&mut self, network: &str, mac: &str, ip_cidr: &str, hostname: &str) {
        let table = self
            .leases
            .entry(network.to_string())
            .or_insert_with(|| LEASE_TABLE_HEADER.to_string());
        table.push_str(&format!(
            " 2030-01-01 00:00:00   {:<19} ipv4       {:<20} {:<10} -\n",
            mac, ip_cidr, hostname
        ));
    }
}

/// Connector to an in-memory daemon. Clones share the same state.
#[derive(Clone)]
pub struct MockConnector {
    uri: String,
    daemon: Arc<RwLock<MockDaemon>>,
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnector {
    /// A daemon with every capability and an active, autostarted
    /// `default` NAT network on `virbr0`.
    pub fn new() -> Self {
        info!("Creating mock hypervisor daemon");
        let connector = Self::empty();
        connector.add_network(
            "<network>\n  <name>default</name>\n  <forward mode='nat'/>\n  <bridge name='virbr0'/>\n</network>",
            true,
        );
        connector
    }

    /// A daemon with no networks at all.
    pub fn empty() -> Self {
        let daemon = MockDaemon {
            capabilities: DaemonCapabilities::full(),
            ..Default::default()
        };
        Self {
            uri: "mock:///default".to_string(),
            daemon: Arc::new(RwLock::new(daemon)),
        }
    }

    fn lock(&self) -> RwLockWriteGuard<'_, MockDaemon> {
        self.daemon.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Define a domain. A running domain gets a fresh numeric handle.
    pub fn add_domain(&self, mut domain: MockDomain) {
        let mut daemon = self.lock();
        if domain.state == DomainState::Running {
            domain.id = Some(daemon.assign_id());
        }
        daemon.domains.insert(domain.name.clone(), domain);
    }

    /// Define a network from XML.
    pub fn add_network(&self, xml: &str, active: bool) {
        let name = NetworkDescriptor::parse(xml)
            .ok()
            .and_then(|d| d.name)
            .unwrap_or_default();
        self.lock().networks.insert(
            name.clone(),
            MockNetwork {
                name,
                xml: xml.to_string(),
                active,
                autostart: active,
            },
        );
    }

    /// Append a row to a network's lease table.
    pub fn add_lease(&self, network: &str, mac: &str, ip_cidr: &str, hostname: &str) {
        self.lock().append_lease(network, mac, ip_cidr, hostname);
    }

    /// Replace a network's lease table text.
    pub fn set_lease_table(&self, network: &str, text: impl Into<String>) {
        self.lock().leases.insert(network.to_string(), text.into());
    }

    /// Make (or stop making) the guest agent of `name` answer.
    pub fn set_agent_interfaces(&self, name: &str, interfaces: Option<Vec<GuestInterface>>) {
        if let Some(domain) = self.lock().domains.get_mut(name) {
            domain.agent_interfaces = interfaces;
        }
    }

    pub fn set_capabilities(&self, capabilities: DaemonCapabilities) {
        self.lock().capabilities = capabilities;
    }

    /// Refuse new connections.
    pub fn set_fail_connect(&self, fail: bool) {
        self.lock().fail_connect = fail;
    }

    /// Reject undefine calls that carry any optional flag.
    pub fn set_reject_flagged_undefine(&self, reject: bool) {
        self.lock().reject_flagged_undefine = reject;
    }

    /// Make the info query fail for `name`.
    pub fn set_info_unavailable(&self, name: &str) {
        self.lock().info_unavailable.insert(name.to_string());
    }

    /// Have `name` power off on its own just as a hard stop arrives, so
    /// the destroy call reports the domain as not running.
    pub fn set_stops_during_destroy(&self, name: &str) {
        self.lock().stops_during_destroy.insert(name.to_string());
    }

    /// Snapshot of a domain.
    pub fn domain(&self, name: &str) -> Option<MockDomain> {
        self.lock().domains.get(name).cloned()
    }

    /// Snapshot of a network.
    pub fn network(&self, name: &str) -> Option<MockNetwork> {
        self.lock().networks.get(name).cloned()
    }

    pub fn network_count(&self) -> usize {
        self.lock().networks.len()
    }

    /// Connections currently open.
    pub fn open_connections(&self) -> usize {
        self.lock().open_connections
    }

    /// Connections ever opened.
    pub fn opened_total(&self) -> usize {
        self.lock().opened_total
    }

    /// Flags of every undefine call, accepted or not.
    pub fn undefine_calls(&self) -> Vec<UndefineFlags> {
        self.lock().undefine_calls.clone()
    }
}

impl Connector for MockConnector {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn open(&self) -> Result<Box<dyn Connection>> {
        let mut daemon = self.lock();
        if daemon.fail_connect {
            return Err(HypervisorError::ConnectionFailed(format!(
                "Failed to connect socket to '{}': Connection refused",
                self.uri
            )));
        }
        daemon.open_connections += 1;
        daemon.opened_total += 1;
        Ok(Box::new(MockConnection {
            daemon: Arc::clone(&self.daemon),
        }))
    }
}

struct MockConnection {
    daemon: Arc<RwLock<MockDaemon>>,
}

impl MockConnection {
    fn lock(&self) -> RwLockWriteGuard<'_, MockDaemon> {
        self.daemon.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        let mut daemon = self.lock();
        daemon.open_connections = daemon.open_connections.saturating_sub(1);
    }
}

fn not_running(name: &str) -> HypervisorError {
    HypervisorError::OperationFailed(format!(
        "Requested operation is not valid: domain '{}' is not running",
        name
    ))
}

fn raw_state(state: DomainState) -> u32 {
    match state {
        DomainState::NoState => 0,
        DomainState::Running => 1,
        DomainState::Blocked => 2,
        DomainState::Paused => 3,
        DomainState::Shutdown => 4,
        DomainState::Shutoff => 5,
        DomainState::Crashed => 6,
        DomainState::PmSuspended => 7,
    }
}

impl Connection for MockConnection {
    fn capabilities(&self) -> Result<DaemonCapabilities> {
        Ok(self.lock().capabilities)
    }

    fn list_active_domain_ids(&self) -> Result<Vec<u32>> {
        let mut ids: Vec<u32> = self.lock().domains.values().filter_map(|d| d.id).collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn list_defined_domain_names(&self) -> Result<Vec<String>> {
        Ok(self
            .lock()
            .domains
            .values()
            .filter(|d| !d.is_active())
            .map(|d| d.name.clone())
            .collect())
    }

    fn domain_summary_by_id(&self, id: u32) -> Result<Option<DomainSummary>> {
        Ok(self
            .lock()
            .domains
            .values()
            .find(|d| d.id == Some(id))
            .map(MockDomain::summary))
    }

    fn domain_summary(&self, name: &str) -> Result<Option<DomainSummary>> {
        Ok(self.lock().domains.get(name).map(MockDomain::summary))
    }

    fn domain_info(&self, name: &str) -> Result<DomainInfo> {
        let daemon = self.lock();
        let domain = daemon.domain(name)?;
        if daemon.info_unavailable.contains(name) {
            return Err(HypervisorError::OperationFailed(
                "internal error: cannot read domain info".to_string(),
            ));
        }
        Ok(DomainInfo {
            state: raw_state(domain.state),
            max_memory_kib: domain.memory_kib,
            memory_kib: if domain.is_active() { domain.memory_kib } else { 0 },
            vcpus: domain.vcpus,
            cpu_time_ns: 0,
        })
    }

    fn domain_xml(&self, name: &str) -> Result<String> {
        Ok(self.lock().domain(name)?.xml())
    }

    fn start_domain(&self, name: &str) -> Result<()> {
        let mut daemon = self.lock();
        if daemon.domain(name)?.is_active() {
            return Err(HypervisorError::OperationFailed(
                "Requested operation is not valid: domain is already running".to_string(),
            ));
        }
        let id = daemon.assign_id();
        let domain = daemon.domain_mut(name)?;
        domain.id = Some(id);
        domain.state = DomainState::Running;
        debug!(vm = %name, id, "Mock domain started");
        Ok(())
    }

    fn shutdown_domain(&self, name: &str) -> Result<()> {
        let mut daemon = self.lock();
        let domain = daemon.domain_mut(name)?;
        if !domain.is_active() {
            return Err(not_running(name));
        }
        // The simulated guest honours the request immediately.
        domain.id = None;
        domain.state = DomainState::Shutoff;
        domain.agent_interfaces = None;
        Ok(())
    }

    fn destroy_domain(&self, name: &str) -> Result<()> {
        let mut daemon = self.lock();
        let stops_first = daemon.stops_during_destroy.remove(name);
        let domain = daemon.domain_mut(name)?;
        if !domain.is_active() {
            return Err(not_running(name));
        }
        domain.id = None;
        domain.state = DomainState::Shutoff;
        domain.agent_interfaces = None;
        if stops_first {
            return Err(not_running(name));
        }
        Ok(())
    }

    fn undefine_domain(&self, name: &str, flags: UndefineFlags) -> Result<()> {
        let mut daemon = self.lock();
        daemon.undefine_calls.push(flags);
        let domain = daemon.domain(name)?.clone();

        if daemon.reject_flagged_undefine && !flags.is_empty() {
            return Err(HypervisorError::OperationFailed(
                "unsupported flags (0x4) in function qemuDomainUndefineFlags".to_string(),
            ));
        }
        if domain.nvram.is_some() && !flags.nvram {
            return Err(HypervisorError::OperationFailed(
                "Requested operation is not valid: cannot undefine domain with nvram".to_string(),
            ));
        }

        daemon.domains.remove(name);

        if flags.remove_storage {
            // Only pool-managed volumes go; the cdrom seed is not one.
            for (path, device) in &domain.disks {
                if device == "disk" {
                    let _ = std::fs::remove_file(path);
                }
            }
        }
        if flags.nvram {
            if let Some(ref nvram) = domain.nvram {
                let _ = std::fs::remove_file(nvram);
            }
        }

        debug!(vm = %name, ?flags, "Mock domain undefined");
        Ok(())
    }

    fn attach_device(&self, name: &str, device_xml: &str, flags: DeviceFlags) -> Result<()> {
        let iface = InterfaceDescriptor::parse(device_xml)?;
        let mut daemon = self.lock();

        if let Some(ref network) = iface.network {
            if !daemon.networks.contains_key(network) {
                return Err(HypervisorError::NetworkNotFound(network.clone()));
            }
        }

        let domain = daemon.domain_mut(name)?;
        if flags.live && !domain.is_active() {
            return Err(not_running(name));
        }
        if !flags.live && !flags.config {
            return Err(HypervisorError::OperationFailed(
                "no device affect flags given".to_string(),
            ));
        }
        if let Some(ref mac) = iface.mac {
            if domain.interfaces.iter().any(|i| i.has_mac(mac)) {
                return Err(HypervisorError::OperationFailed(format!(
                    "MAC address {} is already in use",
                    mac
                )));
            }
        }

        let mut iface = iface;
        if iface.mac.is_none() {
            iface.mac = Some(generate_mac_address());
        }
        domain.interfaces.push(iface);
        Ok(())
    }

    fn detach_device(&self, name: &str, device_xml: &str, flags: DeviceFlags) -> Result<()> {
        let iface = InterfaceDescriptor::parse(device_xml)?;
        let mut daemon = self.lock();
        let domain = daemon.domain_mut(name)?;

        if flags.live && !domain.is_active() {
            return Err(not_running(name));
        }
        let mac = iface.mac.unwrap_or_default();
        let before = domain.interfaces.len();
        domain.interfaces.retain(|i| !i.has_mac(&mac));
        if domain.interfaces.len() == before {
            return Err(HypervisorError::OperationFailed(
                "operation failed: no matching device found".to_string(),
            ));
        }
        Ok(())
    }

    fn guest_agent_interfaces(&self, name: &str) -> Result<Vec<GuestInterface>> {
        let daemon = self.lock();
        let domain = daemon.domain(name)?;
        if !domain.is_active() {
            return Err(not_running(name));
        }
        domain.agent_interfaces.clone().ok_or_else(|| {
            HypervisorError::OperationFailed(
                "Guest agent is not responding: QEMU guest agent is not connected".to_string(),
            )
        })
    }

    fn list_active_network_names(&self) -> Result<Vec<String>> {
        Ok(self
            .lock()
            .networks
            .values()
            .filter(|n| n.active)
            .map(|n| n.name.clone())
            .collect())
    }

    fn list_defined_network_names(&self) -> Result<Vec<String>> {
        Ok(self
            .lock()
            .networks
            .values()
            .filter(|n| !n.active)
            .map(|n| n.name.clone())
            .collect())
    }

    fn network_state(&self, name: &str) -> Result<Option<NetworkState>> {
        Ok(self.lock().networks.get(name).map(|n| NetworkState {
            active: n.active,
            autostart: n.autostart,
        }))
    }

    fn network_xml(&self, name: &str) -> Result<String> {
        Ok(self.lock().network_mut(name)?.xml.clone())
    }

    fn define_network(&self, xml: &str) -> Result<()> {
        let name = NetworkDescriptor::parse(xml)?
            .name
            .ok_or_else(|| HypervisorError::XmlError("network has no <name>".to_string()))?;
        let mut daemon = self.lock();
        match daemon.networks.get_mut(&name) {
            Some(existing) => existing.xml = xml.to_string(),
            None => {
                daemon.networks.insert(
                    name.clone(),
                    MockNetwork {
                        name,
                        xml: xml.to_string(),
                        active: false,
                        autostart: false,
                    },
                );
            }
        }
        Ok(())
    }

    fn start_network(&self, name: &str) -> Result<()> {
        let mut daemon = self.lock();
        let network = daemon.network_mut(name)?;
        if network.active {
            return Err(HypervisorError::OperationFailed(
                "Requested operation is not valid: network is already active".to_string(),
            ));
        }
        network.active = true;
        Ok(())
    }

    fn stop_network(&self, name: &str) -> Result<()> {
        let mut daemon = self.lock();
        let network = daemon.network_mut(name)?;
        if !network.active {
            return Err(HypervisorError::OperationFailed(
                "Requested operation is not valid: network is not active".to_string(),
            ));
        }
        network.active = false;
        Ok(())
    }

    fn undefine_network(&self, name: &str) -> Result<()> {
        let mut daemon = self.lock();
        daemon.network_mut(name)?;
        daemon.networks.remove(name);
        daemon.leases.remove(name);
        Ok(())
    }

    fn set_network_autostart(&self, name: &str, autostart: bool) -> Result<()> {
        self.lock().network_mut(name)?.autostart = autostart;
        Ok(())
    }

    fn network_dhcp_leases(&self, name: &str) -> Result<String> {
        let mut daemon = self.lock();
        daemon.network_mut(name)?;
        Ok(daemon
            .leases
            .get(name)
            .cloned()
            .unwrap_or_else(|| LEASE_TABLE_HEADER.to_string()))
    }
}

// =============================================================================
// TOOL RUNNER
// =============================================================================

/// Interprets provisioning tool invocations against a [`MockConnector`].
///
/// - `qemu-img create` writes a placeholder overlay file
/// - `cloud-localds` and the ISO tools write the seed documents into the output file
/// - `virt-install` defines a running domain with a fresh MAC and, unless
///   disabled, hands out a DHCP lease on its network
pub struct MockToolRunner {
    connector: MockConnector,
    auto_lease: bool,
    fail_tools: Mutex<HashSet<String>>,
    invocations: Mutex<Vec<ToolInvocation>>,
}

impl MockToolRunner {
    pub fn new(connector: MockConnector) -> Self {
        Self {
            connector,
            auto_lease: true,
            fail_tools: Mutex::new(HashSet::new()),
            invocations: Mutex::new(Vec::new()),
        }
    }

    /// Do not hand out leases for newly installed domains.
    pub fn without_leases(mut self) -> Self {
        self.auto_lease = false;
        self
    }

    /// Make `tool` exit non-zero.
    pub fn fail_tool(&self, tool: &str) {
        self.fail_tools
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tool.to_string());
    }

    /// Every invocation seen so far.
    pub fn invocations(&self) -> Vec<ToolInvocation> {
        self.invocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn qemu_img(&self, args: &[String]) -> ToolOutput {
        // create -f qcow2 -F qcow2 -b <base> <overlay> <size>
        let Some(overlay) = args.len().checked_sub(2).and_then(|i| args.get(i)) else {
            return ToolOutput::failed(1, "qemu-img: Expecting image file name");
        };
        match std::fs::write(overlay, b"QFI\xfb") {
            Ok(()) => ToolOutput::ok(),
            Err(e) => ToolOutput::failed(1, format!("qemu-img: {}: Could not create image: {}", overlay, e)),
        }
    }

    fn seed_tool(&self, invocation: &ToolInvocation, args: &[String]) -> ToolOutput {
        let (output, inputs) = match invocation.flag_value("-output") {
            Some(output) => (output.to_string(), &args[args.len().saturating_sub(2)..]),
            None => match args.split_first() {
                Some((output, inputs)) => (output.clone(), inputs),
                None => return ToolOutput::failed(1, "usage: cloud-localds output user-data [meta-data]"),
            },
        };

        let mut image = Vec::new();
        for input in inputs {
            match std::fs::read(input) {
                Ok(bytes) => image.extend(bytes),
                Err(e) => return ToolOutput::failed(1, format!("failed to read {}: {}", input, e)),
            }
        }
        match std::fs::write(&output, image) {
            Ok(()) => ToolOutput::ok(),
            Err(e) => ToolOutput::failed(1, format!("failed to write {}: {}", output, e)),
        }
    }

    fn virt_install(&self, invocation: &ToolInvocation) -> ToolOutput {
        let Some(name) = invocation.flag_value("--name") else {
            return ToolOutput::failed(1, "ERROR    --name is required");
        };
        let network = invocation
            .flag_value("--network")
            .and_then(|n| n.strip_prefix("network="))
            .unwrap_or("default");
        let memory_mb: u64 = invocation
            .flag_value("--memory")
            .and_then(|m| m.parse().ok())
            .unwrap_or(1024);
        let vcpus: u32 = invocation
            .flag_value("--vcpus")
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);

        let mut daemon = self.connector.lock();
        if daemon.domains.contains_key(name) {
            return ToolOutput::failed(
                1,
                format!("ERROR    Guest name '{}' is already in use.", name),
            );
        }
        match daemon.networks.get(network) {
            Some(n) if n.active => {}
            Some(_) => {
                return ToolOutput::failed(
                    1,
                    format!("ERROR    Requested operation is not valid: network '{}' is not active", network),
                )
            }
            None => {
                return ToolOutput::failed(
                    1,
                    format!("ERROR    Network not found: no network with matching name '{}'", network),
                )
            }
        }

        let mac = generate_mac_address();
        let mut domain = MockDomain::new(name)
            .running()
            .with_vcpus(vcpus)
            .with_memory_kib(memory_mb.saturating_mul(1024))
            .with_interface(&mac, network);
        for spec in invocation.flag_values("--disk") {
            let mut path = None;
            let mut device = "disk";
            for part in spec.split(',') {
                if let Some(p) = part.strip_prefix("path=") {
                    path = Some(p);
                } else if let Some(d) = part.strip_prefix("device=") {
                    device = d;
                }
            }
            if let Some(path) = path {
                domain.disks.push((path.to_string(), device.to_string()));
            }
        }
        domain.id = Some(daemon.assign_id());
        daemon.domains.insert(name.to_string(), domain);

        if self.auto_lease {
            daemon.next_lease_host = daemon.next_lease_host.wrapping_add(1).max(1);
            let host = 100u16 + u16::from(daemon.next_lease_host % 150);
            daemon.append_lease(network, &mac, &format!("192.168.122.{}/24", host), name);
        }

        info!(vm = %name, mac = %mac, network = %network, "Mock domain installed");
        ToolOutput::ok()
    }
}

#[async_trait]
impl CommandRunner for MockToolRunner {
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput> {
        self.invocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(invocation.clone());

        let tool = invocation.tool_name();
        let base = Path::new(tool)
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        let args: &[String] = if invocation.program == "sudo" {
            invocation.args.get(1..).unwrap_or(&[])
        } else {
            &invocation.args
        };

        let failing = self
            .fail_tools
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&base);
        if failing {
            return Ok(ToolOutput::failed(1, format!("{}: simulated failure", base)));
        }

        let output = match base.as_str() {
            "qemu-img" => self.qemu_img(args),
            "cloud-localds" | "genisoimage" | "mkisofs" | "xorrisofs" => {
                self.seed_tool(invocation, args)
            }
            "virt-install" => self.virt_install(invocation),
            _ => ToolOutput::failed(127, format!("{}: command not found", tool)),
        };
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connections_are_counted() {
        let connector = MockConnector::new();
        {
            let _a = connector.open().unwrap();
            let _b = connector.open().unwrap();
            assert_eq!(connector.open_connections(), 2);
        }
        assert_eq!(connector.open_connections(), 0);
        assert_eq!(connector.opened_total(), 2);
    }

    #[test]
    fn test_refused_connection() {
        let connector = MockConnector::new();
        connector.set_fail_connect(true);

        assert!(matches!(
            connector.open().err(),
            Some(HypervisorError::ConnectionFailed(_))
        ));
    }

    #[test]
    fn test_running_domains_get_handles() {
        let connector = MockConnector::new();
        connector.add_domain(MockDomain::new("a").running());
        connector.add_domain(MockDomain::new("b"));

        let conn = connector.open().unwrap();
        assert_eq!(conn.list_active_domain_ids().unwrap().len(), 1);
        assert_eq!(conn.list_defined_domain_names().unwrap(), vec!["b".to_string()]);
        assert!(conn.start_domain("a").is_err());
        assert!(conn.destroy_domain("b").is_err());
    }

    #[test]
    fn test_domain_xml_parses_back() {
        let connector = MockConnector::new();
        connector.add_domain(
            MockDomain::new("web1")
                .with_disk("/images/web1.qcow2")
                .with_interface("52:54:00:00:00:01", "default"),
        );

        let xml = connector.open().unwrap().domain_xml("web1").unwrap();
        let desc = crate::xml::DomainDescriptor::parse(&xml).unwrap();
        assert_eq!(desc.disk_paths, vec!["/images/web1.qcow2".to_string()]);
        assert_eq!(desc.networks(), vec!["default".to_string()]);
    }

    #[test]
    fn test_lease_rows_carry_mac_and_address() {
        let connector = MockConnector::new();
        connector.add_lease("default", "52:54:00:aa:bb:cc", "10.0.0.5/24", "web1");

        let table = connector.open().unwrap().network_dhcp_leases("default").unwrap();
        let row = table.lines().last().unwrap();
        assert!(row.contains("52:54:00:aa:bb:cc"));
        assert!(row.contains("10.0.0.5/24"));
    }

    #[tokio::test]
    async fn test_virt_install_defines_running_domain() {
        let connector = MockConnector::new();
        let runner = MockToolRunner::new(connector.clone());
        let install = ToolInvocation::new("virt-install")
            .args(["--name", "web1", "--memory", "2048", "--vcpus", "2"])
            .args(["--disk", "path=/images/web1.qcow2,format=qcow2"])
            .args(["--network", "network=default"]);

        assert!(runner.run(&install).await.unwrap().success);
        let domain = connector.domain("web1").unwrap();
        assert!(domain.is_active());
        assert_eq!(domain.vcpus, 2);
        assert_eq!(domain.memory_kib, 2048 * 1024);
        assert_eq!(domain.interfaces.len(), 1);

        let again = runner.run(&install).await.unwrap();
        assert!(!again.success);
        assert!(again.stderr.contains("already in use"));
    }

    #[tokio::test]
    async fn test_virt_install_huge_memory_saturates() {
        let connector = MockConnector::new();
        let runner = MockToolRunner::new(connector.clone());
        let memory = u64::MAX.to_string();
        let install = ToolInvocation::new("virt-install")
            .args(["--name", "big", "--memory", memory.as_str()])
            .args(["--network", "network=default"]);

        assert!(runner.run(&install).await.unwrap().success);
        assert_eq!(connector.domain("big").unwrap().memory_kib, u64::MAX);
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let runner = MockToolRunner::new(MockConnector::new());
        let out = runner.run(&ToolInvocation::new("mkfs.ext4")).await.unwrap();

        assert_eq!(out.code, Some(127));
    }
}
