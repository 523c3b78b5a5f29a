//! Guest IPv4 address discovery.
//!
//! Two tiers, each polled until its own deadline:
//! 1. the in-guest agent's interface list
//! 2. the DHCP lease table of the VM's networks, matched by MAC
//!
//! Errors inside a tier (agent not up yet, lease query failing) are
//! logged and retried until the deadline. Each poll runs on the blocking
//! pool; only the waits between polls happen on the async runtime.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, instrument};

use crate::error::{HypervisorError, Result};
use crate::registry::require_domain;
use crate::traits::{spawn_daemon_call, Connector};
use crate::types::{AddressSource, GuestInterface, ResolvedIp};
use crate::xml::DomainDescriptor;

/// Poll intervals and the default per-tier deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolverConfig {
    pub agent_poll_interval: Duration,
    pub lease_poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            agent_poll_interval: Duration::from_secs(1),
            lease_poll_interval: Duration::from_secs(2),
            timeout: Duration::from_secs(60),
        }
    }
}

/// One row of a lease table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    pub mac: String,
    pub ip: Ipv4Addr,
    pub prefix: u8,
    pub hostname: Option<String>,
}

/// Resolves a VM name to a guest IPv4 address.
#[derive(Clone)]
pub struct IpResolver {
    connector: Arc<dyn Connector>,
    config: ResolverConfig,
}

impl IpResolver {
    pub fn new(connector: Arc<dyn Connector>, config: ResolverConfig) -> Self {
        Self { connector, config }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Find an address for `name`.
    ///
    /// `network` restricts the lease lookup; without it every network the
    /// VM's interfaces reference is scanned. `timeout` overrides the
    /// configured per-tier deadline.
    #[instrument(skip(self, timeout), fields(timeout_secs = tracing::field::Empty))]
    pub async fn resolve(
        &self,
        name: &str,
        network: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<ResolvedIp> {
        let timeout = timeout.unwrap_or(self.config.timeout);
        tracing::Span::current().record("timeout_secs", timeout.as_secs());

        let connector = self.connector.clone();
        let vm = name.to_string();
        spawn_daemon_call(move || {
            let conn = connector.open()?;
            require_domain(conn.as_ref(), &vm).map(|_| ())
        })
        .await?;

        info!("Resolving address via guest agent");
        let deadline = Instant::now() + timeout;
        loop {
            match self.poll_agent(name).await {
                Ok(Some(ip)) => {
                    info!(ip = %ip, "Address reported by guest agent");
                    return Ok(ResolvedIp {
                        ip,
                        source: AddressSource::GuestAgent,
                    });
                }
                Ok(None) => debug!("Guest agent reported no usable address"),
                Err(e) => debug!(error = %e, "Guest agent query failed"),
            }
            if !sleep_until_next(deadline, self.config.agent_poll_interval).await {
                break;
            }
        }

        info!("Falling back to DHCP leases");
        let deadline = Instant::now() + timeout;
        loop {
            match self.poll_leases(name, network).await {
                Ok(Some(ip)) => {
                    info!(ip = %ip, "Address found in lease table");
                    return Ok(ResolvedIp {
                        ip,
                        source: AddressSource::DhcpLeases,
                    });
                }
                Ok(None) => debug!("No matching lease"),
                Err(e) => debug!(error = %e, "Lease query failed"),
            }
            if !sleep_until_next(deadline, self.config.lease_poll_interval).await {
                break;
            }
        }

        Err(HypervisorError::TimeoutNoResult(name.to_string()))
    }

    async fn poll_agent(&self, name: &str) -> Result<Option<Ipv4Addr>> {
        let connector = self.connector.clone();
        let name = name.to_string();
        spawn_daemon_call(move || {
            let conn = connector.open()?;
            let interfaces = conn.guest_agent_interfaces(&name)?;
            Ok(first_agent_ipv4(&interfaces))
        })
        .await
    }

    async fn poll_leases(&self, name: &str, network: Option<&str>) -> Result<Option<Ipv4Addr>> {
        let connector = self.connector.clone();
        let name = name.to_string();
        let network = network.map(str::to_string);
        spawn_daemon_call(move || lookup_lease(connector.as_ref(), &name, network.as_deref())).await
    }
}

fn lookup_lease(
    connector: &dyn Connector,
    name: &str,
    network: Option<&str>,
) -> Result<Option<Ipv4Addr>> {
    let conn = connector.open()?;
    let descriptor = DomainDescriptor::parse(&conn.domain_xml(name)?)?;
    let macs = descriptor.macs();
    if macs.is_empty() {
        return Ok(None);
    }

    let networks = match network {
        Some(n) => vec![n.to_string()],
        None => descriptor.networks(),
    };

    for net in networks {
        let table = conn.network_dhcp_leases(&net)?;
        if let Some(ip) = lease_ip_for(&table, &macs) {
            debug!(network = %net, "Lease matched");
            return Ok(Some(ip));
        }
    }
    Ok(None)
}

/// Sleep one interval, cut short at `deadline`. False once the deadline
/// has passed.
async fn sleep_until_next(deadline: Instant, interval: Duration) -> bool {
    let now = Instant::now();
    if now >= deadline {
        return false;
    }
    tokio::time::sleep(interval.min(deadline - now)).await;
    true
}

/// First address that is IPv4 and neither loopback nor link-local.
pub fn first_agent_ipv4(interfaces: &[GuestInterface]) -> Option<Ipv4Addr> {
    interfaces
        .iter()
        .flat_map(|iface| iface.addresses.iter())
        .filter_map(|addr| {
            let addr = addr.split_once('/').map_or(addr.as_str(), |(a, _)| a);
            addr.parse::<Ipv4Addr>().ok()
        })
        .find(|ip| !ip.is_loopback() && !ip.is_link_local() && !ip.is_unspecified())
}

/// Address on the first lease line mentioning any of `macs`.
pub fn lease_ip_for(table: &str, macs: &[String]) -> Option<Ipv4Addr> {
    let macs: Vec<String> = macs.iter().map(|m| m.to_ascii_lowercase()).collect();

    table
        .lines()
        .filter(|line| {
            let line = line.to_ascii_lowercase();
            macs.iter().any(|mac| line.contains(mac.as_str()))
        })
        .find_map(|line| line.split_whitespace().find_map(parse_cidr).map(|(ip, _)| ip))
}

/// Every lease row of a `net-dhcp-leases` table that carries an IPv4
/// address.
pub fn parse_lease_table(table: &str) -> Vec<LeaseRecord> {
    table
        .lines()
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            let mac = tokens.iter().find(|t| is_mac(t))?;
            let ip_index = tokens.iter().position(|t| parse_cidr(t).is_some())?;
            let (ip, prefix) = parse_cidr(tokens[ip_index])?;
            let hostname = tokens
                .get(ip_index + 1)
                .filter(|h| **h != "-")
                .map(|h| h.to_string());
            Some(LeaseRecord {
                mac: mac.to_ascii_lowercase(),
                ip,
                prefix,
                hostname,
            })
        })
        .collect()
}

fn parse_cidr(token: &str) -> Option<(Ipv4Addr, u8)> {
    let (addr, prefix) = token.split_once('/')?;
    let prefix: u8 = prefix.parse().ok()?;
    Some((addr.parse().ok()?, prefix))
}

fn is_mac(token: &str) -> bool {
    token.len() == 17
        && token
            .split(':')
            .all(|octet| octet.len() == 2 && octet.chars().all(|c| c.is_ascii_hexdigit()))
}
