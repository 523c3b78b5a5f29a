//! Cloud-init NoCloud seed image generation.
//!
//! The seed image carries two documents read by cloud-init on first boot:
//! - `user-data` - hostname, the login user, SSH keys, guest agent install
//! - `meta-data` - instance id and local hostname
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! let config = SeedConfig::new("web1")
//!     .with_user("ubuntu")
//!     .with_ssh_key("ssh-ed25519 AAAA...");
//!
//! SeedImageGenerator::new()
//!     .generate(runner.as_ref(), &config, Path::new("/var/lib/libvirt/images/web1-seed.iso"))
//!     .await?;
//! ```

use std::path::Path;

use tracing::{debug, info, instrument};

use crate::error::{HypervisorError, Result};
use crate::tools::{run_checked, CommandRunner, ToolInvocation};

/// Login user created when none is configured.
pub const DEFAULT_USER: &str = "ubuntu";

/// Cloud-init configuration for one VM.
#[derive(Debug, Clone)]
pub struct SeedConfig {
    /// Unique instance ID
    pub instance_id: String,
    /// Hostname for the VM
    pub hostname: String,
    /// User to create
    pub username: String,
    /// SSH authorized keys to inject
    pub ssh_keys: Vec<String>,
}

impl SeedConfig {
    /// Seed for `hostname` with a fresh random instance id.
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            instance_id: uuid::Uuid::new_v4().to_string(),
            hostname: hostname.into(),
            username: DEFAULT_USER.to_string(),
            ssh_keys: Vec::new(),
        }
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    /// Set the user to create.
    pub fn with_user(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    /// Add an SSH public key. Blank keys are ignored.
    pub fn with_ssh_key(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        let key = key.trim();
        if !key.is_empty() {
            self.ssh_keys.push(key.to_string());
        }
        self
    }

    /// Render the `#cloud-config` user-data document.
    pub fn user_data(&self) -> String {
        let mut lines = vec![
            "#cloud-config".to_string(),
            format!("hostname: {}", self.hostname),
            "package_update: true".to_string(),
            "packages:".to_string(),
            "  - qemu-guest-agent".to_string(),
            "users:".to_string(),
            format!("  - name: {}", self.username),
            "    groups: [sudo]".to_string(),
            "    shell: /bin/bash".to_string(),
            "    sudo: ['ALL=(ALL) NOPASSWD:ALL']".to_string(),
        ];

        if !self.ssh_keys.is_empty() {
            lines.push("    ssh_authorized_keys:".to_string());
            for key in &self.ssh_keys {
                lines.push(format!("      - {}", yaml_quote(key)));
            }
        }

        lines.push("runcmd:".to_string());
        lines.push("  - [ systemctl, enable, --now, qemu-guest-agent ]".to_string());

        let mut user_data = lines.join("\n");
        user_data.push('\n');
        user_data
    }

    /// Render the meta-data document.
    pub fn meta_data(&self) -> String {
        format!(
            "instance-id: {}\nlocal-hostname: {}\n",
            self.instance_id, self.hostname
        )
    }
}

/// Double-quoted YAML scalar. JSON string syntax is valid YAML.
fn yaml_quote(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| format!("'{}'", value.replace('\'', "''")))
}

/// Which program packages the seed image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeedTool {
    /// `cloud-localds <out> <user-data> <meta-data>`
    CloudLocalds(String),
    /// `genisoimage`/`mkisofs`/`xorrisofs` building a `cidata` volume.
    IsoImage(String),
}

impl Default for SeedTool {
    fn default() -> Self {
        Self::CloudLocalds("cloud-localds".to_string())
    }
}

impl SeedTool {
    /// Pick the calling convention from the program name.
    pub fn from_program(program: impl Into<String>) -> Self {
        let program = program.into();
        let base = Path::new(&program)
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        if base == "cloud-localds" {
            Self::CloudLocalds(program)
        } else {
            Self::IsoImage(program)
        }
    }

    pub fn program(&self) -> &str {
        match self {
            Self::CloudLocalds(p) | Self::IsoImage(p) => p,
        }
    }

    /// Command that packages `dir/user-data` and `dir/meta-data` into `output`.
    pub fn invocation(&self, dir: &Path, output: &Path) -> ToolInvocation {
        match self {
            Self::CloudLocalds(program) => ToolInvocation::new(program)
                .arg(output.display().to_string())
                .arg(dir.join("user-data").display().to_string())
                .arg(dir.join("meta-data").display().to_string()),
            Self::IsoImage(program) => ToolInvocation::new(program)
                .arg("-output")
                .arg(output.display().to_string())
                .args(["-volid", "cidata", "-joliet", "-rock"])
                .arg(dir.join("user-data").display().to_string())
                .arg(dir.join("meta-data").display().to_string()),
        }
    }
}

/// Generator for NoCloud seed images.
#[derive(Debug, Clone, Default)]
pub struct SeedImageGenerator {
    tool: SeedTool,
    use_sudo: bool,
}

impl SeedImageGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool(mut self, tool: SeedTool) -> Self {
        self.tool = tool;
        self
    }

    pub fn with_sudo(mut self, use_sudo: bool) -> Self {
        self.use_sudo = use_sudo;
        self
    }

    pub fn tool(&self) -> &SeedTool {
        &self.tool
    }

    /// Write the documents to a scratch directory and package them at `output`.
    #[instrument(skip(self, runner, config), fields(hostname = %config.hostname))]
    pub async fn generate(
        &self,
        runner: &dyn CommandRunner,
        config: &SeedConfig,
        output: &Path,
    ) -> Result<()> {
        info!(output = %output.display(), "Generating seed image");

        let temp_dir = tempfile::tempdir()
            .map_err(|e| HypervisorError::Internal(format!("Failed to create temp dir: {}", e)))?;

        let user_data = config.user_data();
        std::fs::write(temp_dir.path().join("user-data"), &user_data)
            .map_err(|e| HypervisorError::Internal(format!("Failed to write user-data: {}", e)))?;
        debug!(content = %user_data, "Wrote user-data");

        let meta_data = config.meta_data();
        std::fs::write(temp_dir.path().join("meta-data"), &meta_data)
            .map_err(|e| HypervisorError::Internal(format!("Failed to write meta-data: {}", e)))?;
        debug!(content = %meta_data, "Wrote meta-data");

        let invocation = self
            .tool
            .invocation(temp_dir.path(), output)
            .sudo_if(self.use_sudo);
        run_checked(runner, &invocation).await?;

        info!("Seed image generated");
        Ok(())
    }
}
