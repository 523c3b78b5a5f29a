//! VM deletion with artifact cleanup.
//!
//! The descriptor is read before anything is torn down, since it is the
//! only record of which disk, seed and firmware files belong to the VM.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::capabilities::UndefineFlags;
use crate::error::Result;
use crate::registry::{force_stop, require_domain};
use crate::storage::remove_if_exists;
use crate::traits::Connector;
use crate::types::{DeleteReport, LeftoverArtifact};
use crate::xml::DomainDescriptor;

/// Deletes VMs and whatever files they leave behind.
#[derive(Clone)]
pub struct CleanupOrchestrator {
    connector: Arc<dyn Connector>,
}

impl CleanupOrchestrator {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self { connector }
    }

    /// Force-stop, undefine and remove artifacts.
    ///
    /// Fails only when the VM cannot be found, stopped or undefined. Files
    /// that cannot be removed afterwards are reported as leftovers.
    #[instrument(skip(self))]
    pub fn delete(&self, name: &str) -> Result<DeleteReport> {
        let conn = self.connector.open()?;
        let summary = require_domain(conn.as_ref(), name)?;

        let descriptor = DomainDescriptor::parse(&conn.domain_xml(name)?)?;
        let artifacts = descriptor.artifact_paths();
        debug!(artifacts = ?artifacts, "Collected artifacts");

        if summary.active {
            info!("Force stopping before undefine");
            force_stop(conn.as_ref(), name)?;
        }

        let capabilities = conn.capabilities()?;
        let flags = capabilities.undefine_flags();

        let (flags, used_fallback) = match conn.undefine_domain(name, flags) {
            Ok(()) => (flags, false),
            Err(e) if !flags.is_empty() && !e.is_not_found() => {
                warn!(error = %e, ?flags, "Flagged undefine rejected, retrying without flags");
                let plain = UndefineFlags::none();
                conn.undefine_domain(name, plain)?;
                (plain, true)
            }
            Err(e) => return Err(e),
        };
        info!(?flags, used_fallback, "Domain undefined");

        let mut removed = Vec::new();
        let mut leftovers = Vec::new();
        for path in artifacts.into_iter().map(PathBuf::from) {
            match remove_if_exists(&path) {
                Ok(true) => {
                    debug!(path = %path.display(), "Removed artifact");
                    removed.push(path);
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Could not remove artifact");
                    leftovers.push(LeftoverArtifact {
                        path,
                        reason: e.to_string(),
                    });
                }
            }
        }

        Ok(DeleteReport {
            name: name.to_string(),
            flags,
            used_fallback,
            removed,
            leftovers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::DaemonCapabilities;
    use crate::error::HypervisorError;
    use crate::mock::{MockConnector, MockDomain};

    fn touch(dir: &std::path::Path, file: &str) -> String {
        let path = dir.join(file);
        std::fs::write(&path, b"x").unwrap();
        path.display().to_string()
    }

    #[test]
    fn test_delete_running_vm_removes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let disk = touch(dir.path(), "web1.qcow2");
        let seed = touch(dir.path(), "web1-seed.iso");
        let nvram = touch(dir.path(), "web1_VARS.fd");

        let connector = MockConnector::new();
        connector.add_domain(
            MockDomain::new("web1")
                .running()
                .with_disk(&disk)
                .with_cdrom(&seed)
                .with_nvram(&nvram),
        );

        let report = CleanupOrchestrator::new(Arc::new(connector.clone()))
            .delete("web1")
            .unwrap();

        assert!(connector.domain("web1").is_none());
        assert!(!report.used_fallback);
        assert!(report.flags.remove_storage);
        assert!(report.is_clean());
        // The daemon removed the overlay and nvram; the seed was ours to remove.
        assert_eq!(report.removed, vec![PathBuf::from(&seed)]);
        for path in [&disk, &seed, &nvram] {
            assert!(!std::path::Path::new(path).exists());
        }
        assert_eq!(connector.open_connections(), 0);
    }

    #[test]
    fn test_passthrough_block_device_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let disk = touch(dir.path(), "db.qcow2");
        let device = touch(dir.path(), "sdb");

        let connector = MockConnector::new();
        connector.add_domain(
            MockDomain::new("db")
                .running()
                .with_disk(&disk)
                .with_block_disk(&device),
        );

        let report = CleanupOrchestrator::new(Arc::new(connector.clone()))
            .delete("db")
            .unwrap();

        assert!(connector.domain("db").is_none());
        assert!(report.is_clean());
        assert!(!report.removed.contains(&PathBuf::from(&device)));
        assert!(std::path::Path::new(&device).exists());
        assert!(!std::path::Path::new(&disk).exists());
    }

    #[test]
    fn test_guest_stopping_during_delete_is_not_an_error() {
        let connector = MockConnector::new();
        connector.add_domain(MockDomain::new("web1").running());
        connector.set_stops_during_destroy("web1");

        let report = CleanupOrchestrator::new(Arc::new(connector.clone()))
            .delete("web1")
            .unwrap();

        assert_eq!(report.name, "web1");
        assert!(connector.domain("web1").is_none());
    }

    #[test]
    fn test_rejected_flags_fall_back_to_plain_undefine() {
        let dir = tempfile::tempdir().unwrap();
        let disk = touch(dir.path(), "db.qcow2");

        let connector = MockConnector::new();
        connector.set_reject_flagged_undefine(true);
        connector.add_domain(MockDomain::new("db").with_disk(&disk));

        let report = CleanupOrchestrator::new(Arc::new(connector.clone()))
            .delete("db")
            .unwrap();

        assert!(report.used_fallback);
        assert!(report.flags.is_empty());
        assert_eq!(report.removed, vec![PathBuf::from(&disk)]);
        assert_eq!(connector.undefine_calls().len(), 2);
    }

    #[test]
    fn test_old_daemon_gets_reduced_flags() {
        let connector = MockConnector::new();
        connector.set_capabilities(DaemonCapabilities::negotiate(9_004, false));
        connector.add_domain(MockDomain::new("old"));

        let report = CleanupOrchestrator::new(Arc::new(connector.clone()))
            .delete("old")
            .unwrap();

        assert!(report.flags.managed_save);
        assert!(!report.flags.snapshots_metadata);
        assert!(!report.flags.nvram);
        assert!(!report.flags.remove_storage);
    }

    #[test]
    fn test_second_delete_is_not_found() {
        let connector = MockConnector::new();
        connector.add_domain(MockDomain::new("web1"));
        let cleanup = CleanupOrchestrator::new(Arc::new(connector));

        cleanup.delete("web1").unwrap();
        assert!(matches!(
            cleanup.delete("web1"),
            Err(HypervisorError::VmNotFound(_))
        ));
    }

    #[test]
    fn test_missing_artifacts_are_not_leftovers() {
        let connector = MockConnector::new();
        connector.add_domain(MockDomain::new("web1").with_cdrom("/nonexistent/web1-seed.iso"));

        let report = CleanupOrchestrator::new(Arc::new(connector))
            .delete("web1")
            .unwrap();

        assert!(report.is_clean());
        assert!(report.removed.is_empty());
    }

    #[test]
    fn test_unremovable_artifact_is_advisory() {
        let dir = tempfile::tempdir().unwrap();
        let stuck = dir.path().join("seed-dir");
        std::fs::create_dir(&stuck).unwrap();

        let connector = MockConnector::new();
        connector.add_domain(MockDomain::new("web1").with_cdrom(stuck.display().to_string()));

        let report = CleanupOrchestrator::new(Arc::new(connector.clone()))
            .delete("web1")
            .unwrap();

        assert!(connector.domain("web1").is_none());
        assert_eq!(report.leftovers.len(), 1);
        assert_eq!(report.leftovers[0].path, stuck);
    }
}
