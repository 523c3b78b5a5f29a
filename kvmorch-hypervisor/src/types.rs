//! Type definitions for domains, networks, and provisioning requests.

use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{HypervisorError, Result};

// =============================================================================
// DOMAINS
// =============================================================================

/// Domain lifecycle state, numbered the way the daemon reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainState {
    NoState,
    Running,
    Blocked,
    Paused,
    Shutdown,
    Shutoff,
    Crashed,
    PmSuspended,
}

impl DomainState {
    /// Map the daemon's numeric state. Unknown values collapse to `NoState`.
    pub fn from_raw(state: u32) -> Self {
        match state {
            1 => Self::Running,
            2 => Self::Blocked,
            3 => Self::Paused,
            4 => Self::Shutdown,
            5 => Self::Shutoff,
            6 => Self::Crashed,
            7 => Self::PmSuspended,
            _ => Self::NoState,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoState => "nostate",
            Self::Running => "running",
            Self::Blocked => "blocked",
            Self::Paused => "paused",
            Self::Shutdown => "shutdown",
            Self::Shutoff => "shutoff",
            Self::Crashed => "crashed",
            Self::PmSuspended => "pmsuspended",
        }
    }
}

impl fmt::Display for DomainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of one defined domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainSummary {
    pub name: String,
    pub uuid: String,
    pub state: DomainState,
    pub active: bool,
}

/// Raw resource figures reported by the daemon's info query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DomainInfo {
    pub state: u32,
    pub max_memory_kib: u64,
    pub memory_kib: u64,
    pub vcpus: u32,
    pub cpu_time_ns: u64,
}

/// Summary plus resource figures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainDetails {
    #[serde(flatten)]
    pub summary: DomainSummary,
    pub vcpus: u32,
    pub memory_kib_max: u64,
    pub memory_kib_cur: u64,
}

// =============================================================================
// NETWORKS
// =============================================================================

/// Activation flags of a network object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkState {
    pub active: bool,
    pub autostart: bool,
}

/// Network object as listed to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSummary {
    pub name: String,
    pub active: bool,
    pub autostart: bool,
    pub bridge: Option<String>,
}

/// Interface addresses reported by the in-guest agent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuestInterface {
    pub name: String,
    pub hwaddr: Option<String>,
    /// Addresses as reported, with or without a `/prefix` suffix.
    pub addresses: Vec<String>,
}

// =============================================================================
// PROVISIONING
// =============================================================================

/// Maximum VM name length.
pub const MAX_NAME_LEN: usize = 32;

/// Upper bounds on requested sizes.
pub const MAX_VCPUS: u32 = 1024;
pub const MAX_MEMORY_MB: u64 = 16 * 1024 * 1024;
pub const MAX_DISK_GB: u64 = 64 * 1024;

fn default_vcpus() -> u32 {
    2
}

fn default_memory_mb() -> u64 {
    2048
}

fn default_disk_gb() -> u64 {
    10
}

fn default_network() -> String {
    "default".to_string()
}

/// Request to create a new VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningRequest {
    pub name: String,
    #[serde(default = "default_vcpus")]
    pub vcpus: u32,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
    #[serde(default = "default_disk_gb")]
    pub disk_gb: u64,
    #[serde(default = "default_network")]
    pub network: String,
    #[serde(default)]
    pub ssh_pubkey: Option<String>,
}

impl ProvisioningRequest {
    /// Create a request with default sizing.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vcpus: default_vcpus(),
            memory_mb: default_memory_mb(),
            disk_gb: default_disk_gb(),
            network: default_network(),
            ssh_pubkey: None,
        }
    }

    pub fn with_vcpus(mut self, vcpus: u32) -> Self {
        self.vcpus = vcpus;
        self
    }

    pub fn with_memory_mb(mut self, memory_mb: u64) -> Self {
        self.memory_mb = memory_mb;
        self
    }

    pub fn with_disk_gb(mut self, disk_gb: u64) -> Self {
        self.disk_gb = disk_gb;
        self
    }

    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = network.into();
        self
    }

    pub fn with_ssh_key(mut self, key: impl Into<String>) -> Self {
        self.ssh_pubkey = Some(key.into());
        self
    }

    /// Check the name pattern and that every size is positive and bounded.
    pub fn validate(&self) -> Result<()> {
        validate_vm_name(&self.name)?;

        if self.vcpus == 0 || self.vcpus > MAX_VCPUS {
            return Err(HypervisorError::InvalidRequest(format!(
                "vcpus must be between 1 and {}",
                MAX_VCPUS
            )));
        }
        if self.memory_mb == 0 || self.memory_mb > MAX_MEMORY_MB {
            return Err(HypervisorError::InvalidRequest(format!(
                "memory_mb must be between 1 and {}",
                MAX_MEMORY_MB
            )));
        }
        if self.disk_gb == 0 || self.disk_gb > MAX_DISK_GB {
            return Err(HypervisorError::InvalidRequest(format!(
                "disk_gb must be between 1 and {}",
                MAX_DISK_GB
            )));
        }
        if self.network.trim().is_empty() {
            return Err(HypervisorError::InvalidRequest("network must not be empty".into()));
        }
        Ok(())
    }
}

/// Names are 1-32 ASCII letters, digits or dashes.
pub fn validate_vm_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');

    if valid {
        Ok(())
    } else {
        Err(HypervisorError::InvalidRequest(format!(
            "name '{}' must be 1-{} letters, digits or dashes",
            name, MAX_NAME_LEN
        )))
    }
}

/// Artifacts produced by a successful provisioning run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedVm {
    pub name: String,
    pub disk_path: PathBuf,
    pub seed_path: PathBuf,
}

// =============================================================================
// ADDRESS RESOLUTION
// =============================================================================

/// Which tier produced an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressSource {
    #[serde(rename = "guest-agent")]
    GuestAgent,
    #[serde(rename = "dhcp-leases")]
    DhcpLeases,
}

impl AddressSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GuestAgent => "guest-agent",
            Self::DhcpLeases => "dhcp-leases",
        }
    }
}

impl fmt::Display for AddressSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved guest address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedIp {
    pub ip: Ipv4Addr,
    pub source: AddressSource,
}

// =============================================================================
// DELETION
// =============================================================================

/// A file the daemon left behind that could not be removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeftoverArtifact {
    pub path: PathBuf,
    pub reason: String,
}

/// Outcome of a delete.
///
/// The domain being undefined is the authoritative result; `leftovers`
/// is advisory and never turns a delete into a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeleteReport {
    pub name: String,
    /// Flags the successful undefine call used.
    pub flags: crate::capabilities::UndefineFlags,
    /// True when the flagged undefine was rejected and a plain one succeeded.
    pub used_fallback: bool,
    /// Artifact paths this run removed itself.
    pub removed: Vec<PathBuf>,
    pub leftovers: Vec<LeftoverArtifact>,
}

impl DeleteReport {
    /// True when no leftover artifact remains.
    pub fn is_clean(&self) -> bool {
        self.leftovers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_mapping() {
        assert_eq!(DomainState::from_raw(1), DomainState::Running);
        assert_eq!(DomainState::from_raw(5), DomainState::Shutoff);
        assert_eq!(DomainState::from_raw(42), DomainState::NoState);
        assert_eq!(DomainState::PmSuspended.to_string(), "pmsuspended");
        assert_eq!(
            serde_json::to_string(&DomainState::Shutoff).unwrap(),
            "\"shutoff\""
        );
    }

    #[test]
    fn test_request_defaults() {
        let req: ProvisioningRequest = serde_json::from_str(r#"{"name":"web1"}"#).unwrap();

        assert_eq!(req, ProvisioningRequest::new("web1"));
        assert_eq!(req.vcpus, 2);
        assert_eq!(req.memory_mb, 2048);
        assert_eq!(req.disk_gb, 10);
        assert_eq!(req.network, "default");
        assert!(req.ssh_pubkey.is_none());
    }

    #[test]
    fn test_name_validation() {
        assert!(validate_vm_name("web-1").is_ok());
        assert!(validate_vm_name(&"a".repeat(32)).is_ok());
        assert!(validate_vm_name("").is_err());
        assert!(validate_vm_name(&"a".repeat(33)).is_err());
        assert!(validate_vm_name("../etc").is_err());
        assert!(validate_vm_name("web_1").is_err());
    }

    #[test]
    fn test_request_rejects_zero_sizes() {
        assert!(ProvisioningRequest::new("vm").with_vcpus(0).validate().is_err());
        assert!(ProvisioningRequest::new("vm").with_memory_mb(0).validate().is_err());
        assert!(ProvisioningRequest::new("vm").with_disk_gb(0).validate().is_err());
        assert!(ProvisioningRequest::new("vm").validate().is_ok());
    }

    #[test]
    fn test_request_rejects_oversized() {
        assert!(ProvisioningRequest::new("vm")
            .with_memory_mb(u64::MAX)
            .validate()
            .is_err());
        assert!(ProvisioningRequest::new("vm")
            .with_vcpus(MAX_VCPUS + 1)
            .validate()
            .is_err());
        assert!(ProvisioningRequest::new("vm")
            .with_disk_gb(MAX_DISK_GB + 1)
            .validate()
            .is_err());
        assert!(ProvisioningRequest::new("vm")
            .with_memory_mb(MAX_MEMORY_MB)
            .with_vcpus(MAX_VCPUS)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_address_source_labels() {
        let resolved = ResolvedIp {
            ip: Ipv4Addr::new(10, 0, 0, 5),
            source: AddressSource::DhcpLeases,
        };
        let json = serde_json::to_value(resolved).unwrap();

        assert_eq!(json["ip"], "10.0.0.5");
        assert_eq!(json["source"], "dhcp-leases");
    }
}
