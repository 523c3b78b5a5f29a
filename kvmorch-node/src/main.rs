//! # kvmorch Node Daemon
//!
//! Runs on a libvirt host and exposes VM lifecycle operations over HTTP:
//! provisioning from a cloud image, power control, deletion with artifact
//! cleanup, address discovery and virtual network management.
//!
//! ## Usage
//! ```bash
//! kvmorch-node --config /etc/kvmorch/node.yaml
//! kvmorch-node --dev --listen 127.0.0.1:8000
//! ```

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

mod cli;
mod config;
mod http_server;
mod server;
mod service;

use cli::Args;
use config::{Config, DEFAULT_CONFIG_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Load configuration before logging so its level and format apply
    let (config, source) = match &args.config {
        Some(config_path) => {
            let cfg = Config::load(config_path)?.with_cli_overrides(&args)?;
            (cfg, Some(config_path.clone()))
        }
        None => match Config::load(DEFAULT_CONFIG_PATH) {
            Ok(cfg) => (
                cfg.with_cli_overrides(&args)?,
                Some(DEFAULT_CONFIG_PATH.to_string()),
            ),
            Err(_) => (Config::default_with_cli(&args)?, None),
        },
    };

    kvmorch_common::init_logging_with_format(&config.logging.level, config.logging.format)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting kvmorch Node Daemon"
    );
    match &source {
        Some(path) => info!(config_path = %path, "Configuration loaded"),
        None => info!("No config file found, using defaults with CLI overrides"),
    }

    info!(
        listen = %config.server.listen_address,
        backend = ?config.hypervisor.backend,
        libvirt_compiled = kvmorch_hypervisor::libvirt::is_available(),
        uri = %config.hypervisor.libvirt_uri,
        images_dir = %config.provision.images_dir.display(),
        "Configuration"
    );

    if let Err(e) = server::run(config).await {
        error!(error = %e, "Server error");
        return Err(e);
    }

    info!("Node daemon shutdown complete");
    Ok(())
}
