//! Configuration management for the Node Daemon.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use kvmorch_common::LogFormat;
use kvmorch_hypervisor::libvirt::DEFAULT_URI;
use kvmorch_hypervisor::{ProvisionConfig, ResolverConfig};

use crate::cli::Args;

/// Location searched when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/kvmorch/node.yaml";

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Hypervisor backend configuration
    pub hypervisor: HypervisorConfig,
    /// Disk, seed and install tool settings
    pub provision: ProvisionConfig,
    /// Address discovery settings
    pub resolver: ResolverSettings,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    /// Parse a YAML document.
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).with_context(|| "Failed to parse config file")
    }

    /// Defaults with CLI overrides applied.
    pub fn default_with_cli(args: &Args) -> Result<Self> {
        Self::default().with_cli_overrides(args)
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Result<Self> {
        if let Some(ref listen) = args.listen {
            self.server.listen_address = listen.clone();
        }

        if let Some(ref uri) = args.libvirt_uri {
            self.hypervisor.libvirt_uri = uri.clone();
        }

        if let Some(ref dir) = args.images_dir {
            self.provision.images_dir = dir.into();
        }

        if args.sudo {
            self.provision.use_sudo = true;
        }

        if args.dev {
            self.hypervisor.backend = HypervisorBackend::Mock;
        }

        if let Some(ref level) = args.log_level {
            self.logging.level = level.clone();
        }

        if let Some(ref format) = args.log_format {
            self.logging.format = format.parse()?;
        }

        Ok(self)
    }
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on for HTTP
    pub listen_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:8000".to_string(),
        }
    }
}

/// Hypervisor backend configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    /// Backend type
    pub backend: HypervisorBackend,
    /// Libvirt connection URI
    pub libvirt_uri: String,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            backend: HypervisorBackend::default(),
            libvirt_uri: DEFAULT_URI.to_string(),
        }
    }
}

/// Hypervisor backend type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HypervisorBackend {
    /// In-memory daemon for testing/development
    Mock,
    /// Libvirt/QEMU backend
    #[default]
    Libvirt,
}

/// Address discovery settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResolverSettings {
    /// Deadline of each resolution tier
    pub timeout_secs: u64,
    pub agent_poll_interval_ms: u64,
    pub lease_poll_interval_ms: u64,
    /// Resolve the address before answering a create request
    pub wait_on_create: bool,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        let defaults = ResolverConfig::default();
        Self {
            timeout_secs: defaults.timeout.as_secs(),
            agent_poll_interval_ms: defaults.agent_poll_interval.as_millis() as u64,
            lease_poll_interval_ms: defaults.lease_poll_interval.as_millis() as u64,
            wait_on_create: true,
        }
    }
}

impl ResolverSettings {
    pub fn resolver_config(&self) -> ResolverConfig {
        ResolverConfig {
            agent_poll_interval: Duration::from_millis(self.agent_poll_interval_ms.max(1)),
            lease_poll_interval: Duration::from_millis(self.lease_poll_interval_ms.max(1)),
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}
