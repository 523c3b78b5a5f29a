//! # kvmorch CLI
//!
//! Thin client for the node daemon's REST API.
//!
//! ## Usage
//! ```bash
//! kvmorch set-url http://10.0.0.2:8000
//! kvmorch create --name web1 --ssh-pubkey @~/.ssh/id_ed25519.pub
//! kvmorch ip web1
//! ```

use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;

mod cli;
mod client;
mod config;

use cli::{Cli, Command};
use client::{ApiClient, CreateVm, VmRow};
use config::ClientConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    kvmorch_common::init_logging(if cli.verbose { "debug" } else { "warn" })?;

    if let Command::SetUrl { url } = &cli.command {
        let path = ClientConfig::default_path()
            .ok_or_else(|| anyhow!("Cannot determine home directory"))?;
        ClientConfig {
            base_url: url.clone(),
        }
        .save_to(&path)?;
        println!("Saved base_url = {}", url);
        return Ok(());
    }

    let config = ClientConfig::load();
    let client = ApiClient::new(config.base())?;

    match cli.command {
        Command::SetUrl { .. } => {}
        Command::List => {
            let vms = client.list().await?;
            if vms.is_empty() {
                println!("No VMs found.");
            } else {
                print!("{}", format_table(&vms));
            }
        }
        Command::Ip { name } => match client.ip(&name).await? {
            Some(answer) => println!("{}: {} ({})", name, answer.ip, answer.source),
            None => bail!("No IP found."),
        },
        Command::Start { name } => println!("{}", client.power(&name, "start").await?),
        Command::Shutdown { name } => println!("{}", client.power(&name, "shutdown").await?),
        Command::Destroy { name } => println!("{}", client.power(&name, "destroy").await?),
        Command::Delete { name } => println!("{}", client.delete(&name).await?),
        Command::Create {
            name,
            vcpu,
            ram,
            disk,
            network,
            ssh_pubkey,
        } => {
            let ssh_pubkey = ssh_pubkey.map(|key| read_key(&key)).transpose()?;
            let created = client
                .create(&CreateVm {
                    name,
                    vcpus: vcpu,
                    memory_mb: ram,
                    disk_gb: disk,
                    network,
                    ssh_pubkey,
                })
                .await?;
            println!("{}", created.message);
            println!("IP: {}", created.ip.as_deref().unwrap_or("None"));
        }
    }

    Ok(())
}

/// A literal key, or the trimmed contents of a file given as `@path`.
fn read_key(arg: &str) -> Result<String> {
    match arg.strip_prefix('@') {
        Some(path) => {
            let content = std::fs::read_to_string(Path::new(path))
                .with_context(|| format!("Failed to read key file {}", path))?;
            Ok(content.trim().to_string())
        }
        None => Ok(arg.to_string()),
    }
}

fn format_table(vms: &[VmRow]) -> String {
    let mut out = format!("{:20} {:10} ACTIVE\n", "NAME", "STATE");
    for vm in vms {
        out.push_str(&format!("{:20} {:10} {}\n", vm.name, vm.state, vm.active));
    }
    out
}
