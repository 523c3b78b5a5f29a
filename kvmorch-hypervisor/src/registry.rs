//! Domain registry: enumerate, inspect and drive domain power state.
//!
//! Nothing is cached. Every call opens a connection, re-reads the daemon
//! and drops the connection before returning.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::error::{HypervisorError, Result};
use crate::traits::{Connection, Connector};
use crate::types::{DomainDetails, DomainState, DomainSummary};
use crate::xml::DomainDescriptor;

/// Read/command interface over the daemon's domains.
#[derive(Clone)]
pub struct DomainRegistry {
    connector: Arc<dyn Connector>,
}

impl DomainRegistry {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self { connector }
    }

    /// Running domains first (by numeric handle), then defined-but-stopped
    /// domains (by name).
    #[instrument(skip(self))]
    pub fn list(&self) -> Result<Vec<DomainSummary>> {
        let conn = self.connector.open()?;
        let mut domains = Vec::new();

        for id in conn.list_active_domain_ids()? {
            // The domain may have stopped since enumeration.
            if let Some(summary) = conn.domain_summary_by_id(id)? {
                domains.push(summary);
            }
        }

        for name in conn.list_defined_domain_names()? {
            if let Some(summary) = conn.domain_summary(&name)? {
                domains.push(summary);
            }
        }

        debug!(count = domains.len(), "Listed domains");
        Ok(domains)
    }

    /// Detailed record, or `None` when no domain has this name.
    #[instrument(skip(self))]
    pub fn get(&self, name: &str) -> Result<Option<DomainDetails>> {
        let conn = self.connector.open()?;

        let Some(summary) = conn.domain_summary(name)? else {
            return Ok(None);
        };

        let details = match conn.domain_info(name) {
            Ok(info) => DomainDetails {
                summary,
                vcpus: info.vcpus,
                memory_kib_max: info.max_memory_kib,
                memory_kib_cur: info.memory_kib,
            },
            Err(e) => {
                warn!(error = %e, "Domain info unavailable, returning summary only");
                DomainDetails {
                    summary,
                    vcpus: 0,
                    memory_kib_max: 0,
                    memory_kib_cur: 0,
                }
            }
        };

        Ok(Some(details))
    }

    /// Whether a domain with this name is defined.
    pub fn exists(&self, name: &str) -> Result<bool> {
        let conn = self.connector.open()?;
        Ok(conn.domain_summary(name)?.is_some())
    }

    /// Start the domain. Already running is a no-op.
    #[instrument(skip(self))]
    pub fn start(&self, name: &str) -> Result<()> {
        let conn = self.connector.open()?;
        let summary = require_domain(conn.as_ref(), name)?;

        if summary.active {
            debug!("Domain already running");
            return Ok(());
        }

        info!("Starting domain");
        conn.start_domain(name)?;
        info!("Domain started");
        Ok(())
    }

    /// Ask the guest to power off. Returns without waiting.
    #[instrument(skip(self))]
    pub fn shutdown(&self, name: &str) -> Result<()> {
        let conn = self.connector.open()?;
        require_domain(conn.as_ref(), name)?;

        info!("Sending graceful shutdown");
        conn.shutdown_domain(name)?;
        Ok(())
    }

    /// Hard stop. A domain that is already stopped counts as success.
    #[instrument(skip(self))]
    pub fn destroy(&self, name: &str) -> Result<()> {
        let conn = self.connector.open()?;
        let summary = require_domain(conn.as_ref(), name)?;

        if !summary.active {
            debug!("Domain already stopped");
            return Ok(());
        }

        info!("Force stopping domain");
        force_stop(conn.as_ref(), name)?;
        info!("Domain force stopped");
        Ok(())
    }

    /// Typed descriptor of a defined domain.
    #[instrument(skip(self))]
    pub fn descriptor(&self, name: &str) -> Result<DomainDescriptor> {
        let conn = self.connector.open()?;
        require_domain(conn.as_ref(), name)?;
        DomainDescriptor::parse(&conn.domain_xml(name)?)
    }

    /// Current state, `None` when undefined.
    pub fn state(&self, name: &str) -> Result<Option<DomainState>> {
        let conn = self.connector.open()?;
        Ok(conn.domain_summary(name)?.map(|s| s.state))
    }
}

/// Summary of a domain that must exist.
pub(crate) fn require_domain(conn: &dyn Connection, name: &str) -> Result<DomainSummary> {
    conn.domain_summary(name)?
        .ok_or_else(|| HypervisorError::VmNotFound(name.to_string()))
}

/// Hard stop of a domain last seen active. A failure is forgiven when the
/// domain turns out to have stopped on its own in the meantime.
pub(crate) fn force_stop(conn: &dyn Connection, name: &str) -> Result<()> {
    if let Err(e) = conn.destroy_domain(name) {
        match conn.domain_summary(name)? {
            Some(s) if !s.active => {
                debug!(error = %e, "Domain stopped concurrently");
            }
            _ => return Err(e),
        }
    }
    Ok(())
}
