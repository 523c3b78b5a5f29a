//! Command-line argument parsing.

use clap::Parser;

/// kvmorch Node Daemon - VM lifecycle API for one libvirt host
#[derive(Parser, Debug, Default)]
#[command(name = "kvmorch-node")]
#[command(about = "kvmorch Node Daemon - VM lifecycle API for one libvirt host")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long, env = "KVMORCH_CONFIG")]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "KVMORCH_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Log format (pretty, json)
    #[arg(long)]
    pub log_format: Option<String>,

    /// Listen address for the HTTP API
    #[arg(long)]
    pub listen: Option<String>,

    /// Libvirt connection URI
    #[arg(long, env = "LIBVIRT_DEFAULT_URI")]
    pub libvirt_uri: Option<String>,

    /// Directory for VM overlays and seed images
    #[arg(long)]
    pub images_dir: Option<String>,

    /// Run provisioning tools through sudo
    #[arg(long)]
    pub sudo: bool,

    /// Enable development mode (mock hypervisor)
    #[arg(long)]
    pub dev: bool,
}
