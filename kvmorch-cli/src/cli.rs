//! Command-line argument parsing.

use clap::{Parser, Subcommand};

/// kvmorch - manage VMs on a kvmorch node
#[derive(Parser, Debug)]
#[command(name = "kvmorch")]
#[command(about = "KVM Orchestrator CLI")]
#[command(version)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Persist the API base URL (~/.kvm_orchestrator/config.json)
    SetUrl {
        /// Base API URL, e.g. http://127.0.0.1:8000
        url: String,
    },
    /// List VMs
    List,
    /// Get a VM's IP (guest agent with DHCP lease fallback)
    Ip { name: String },
    /// Start a VM
    Start { name: String },
    /// Gracefully shut down a VM
    Shutdown { name: String },
    /// Force-stop a VM
    Destroy { name: String },
    /// Delete a VM and its disks
    Delete { name: String },
    /// Create a VM and print its IP when ready
    Create {
        /// VM name
        #[arg(short, long)]
        name: String,
        /// vCPU count
        #[arg(long, default_value_t = 2)]
        vcpu: u32,
        /// Memory (MB)
        #[arg(long, default_value_t = 2048)]
        ram: u64,
        /// Disk (GB)
        #[arg(long, default_value_t = 10)]
        disk: u64,
        /// Libvirt network
        #[arg(long, default_value = "default")]
        network: String,
        /// Public key string or @/path/to/key.pub
        #[arg(long)]
        ssh_pubkey: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_defaults() {
        let cli = Cli::parse_from(["kvmorch", "create", "--name", "web1"]);

        match cli.command {
            Command::Create {
                name,
                vcpu,
                ram,
                disk,
                network,
                ssh_pubkey,
            } => {
                assert_eq!(name, "web1");
                assert_eq!((vcpu, ram, disk), (2, 2048, 10));
                assert_eq!(network, "default");
                assert!(ssh_pubkey.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_set_url() {
        let cli = Cli::parse_from(["kvmorch", "set-url", "http://host:8000"]);
        assert!(matches!(cli.command, Command::SetUrl { url } if url == "http://host:8000"));
    }
}
