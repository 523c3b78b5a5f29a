//! Capability negotiation against the connected daemon.
//!
//! Optional undefine flags appeared in different daemon releases. Rather
//! than assume them, a connection reports what it supports once and the
//! callers derive the flag sets they pass to undefine/attach/detach.

use serde::Serialize;

/// Daemon version that introduced `VIR_DOMAIN_UNDEFINE_MANAGED_SAVE` (0.9.4).
pub const MANAGED_SAVE_SINCE: u32 = 9_004;
/// Daemon version that introduced `VIR_DOMAIN_UNDEFINE_SNAPSHOTS_METADATA` (0.9.5).
pub const SNAPSHOTS_METADATA_SINCE: u32 = 9_005;
/// Daemon version that introduced `VIR_DOMAIN_UNDEFINE_NVRAM` (1.2.9).
pub const NVRAM_SINCE: u32 = 1_002_009;

/// What the connected daemon can do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DaemonCapabilities {
    /// Version encoded as `major * 1_000_000 + minor * 1_000 + micro`.
    pub version: u32,
    pub undefine_managed_save: bool,
    pub undefine_snapshots_metadata: bool,
    pub undefine_nvram: bool,
    /// Storage volumes can be deleted through the daemon.
    pub remove_storage: bool,
}

impl DaemonCapabilities {
    /// Derive undefine support from the daemon version and whether a
    /// storage driver answered.
    pub fn negotiate(version: u32, storage_driver: bool) -> Self {
        Self {
            version,
            undefine_managed_save: version >= MANAGED_SAVE_SINCE,
            undefine_snapshots_metadata: version >= SNAPSHOTS_METADATA_SINCE,
            undefine_nvram: version >= NVRAM_SINCE,
            remove_storage: storage_driver,
        }
    }

    /// Every capability on.
    pub fn full() -> Self {
        Self::negotiate(u32::MAX, true)
    }

    /// Richest undefine flag set this daemon accepts.
    pub fn undefine_flags(&self) -> UndefineFlags {
        UndefineFlags {
            managed_save: self.undefine_managed_save,
            snapshots_metadata: self.undefine_snapshots_metadata,
            nvram: self.undefine_nvram,
            remove_storage: self.remove_storage,
        }
    }

    /// Human-readable version string.
    pub fn version_string(&self) -> String {
        format!(
            "{}.{}.{}",
            self.version / 1_000_000,
            (self.version / 1_000) % 1_000,
            self.version % 1_000
        )
    }
}

/// Optional behaviours of an undefine call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UndefineFlags {
    pub managed_save: bool,
    pub snapshots_metadata: bool,
    pub nvram: bool,
    pub remove_storage: bool,
}

impl UndefineFlags {
    /// Plain undefine.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::none()
    }
}

/// Where an attach/detach takes effect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceFlags {
    pub live: bool,
    pub config: bool,
}

impl DeviceFlags {
    /// Persisted config always, live instance only while it runs.
    ///
    /// The daemon rejects a live change on an inactive domain.
    pub fn for_domain(active: bool) -> Self {
        Self {
            live: active,
            config: true,
        }
    }
}
