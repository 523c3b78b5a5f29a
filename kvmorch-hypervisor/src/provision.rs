//! Provisioning pipeline: overlay disk, seed image, define-and-start.
//!
//! Steps run strictly in order and nothing is rolled back. A failure in a
//! later step leaves earlier artifacts behind; the caller cleans up with a
//! delete before retrying.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, instrument};

use crate::cloudinit::{SeedConfig, SeedImageGenerator, SeedTool, DEFAULT_USER};
use crate::error::Result;
use crate::storage::{ImageLayout, OverlayDiskCreator, DEFAULT_BASE_IMAGE, DEFAULT_IMAGES_DIR};
use crate::tools::{run_checked, CommandRunner, ToolInvocation};
use crate::types::{ProvisionedVm, ProvisioningRequest};

/// Provisioning settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProvisionConfig {
    /// Directory for overlays and seed images
    pub images_dir: PathBuf,
    /// Shared read-only base image
    pub base_image: PathBuf,
    /// `--os-variant` passed to the definition tool
    pub os_variant: String,
    /// Login user created by cloud-init
    pub default_user: String,
    /// Prefix every tool with `sudo`
    pub use_sudo: bool,
    pub disk_tool: String,
    pub seed_tool: String,
    pub install_tool: String,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            images_dir: PathBuf::from(DEFAULT_IMAGES_DIR),
            base_image: PathBuf::from(DEFAULT_BASE_IMAGE),
            os_variant: "ubuntu22.04".to_string(),
            default_user: DEFAULT_USER.to_string(),
            use_sudo: false,
            disk_tool: "qemu-img".to_string(),
            seed_tool: "cloud-localds".to_string(),
            install_tool: "virt-install".to_string(),
        }
    }
}

/// Turns a [`ProvisioningRequest`] into a running domain.
#[derive(Clone)]
pub struct ProvisioningPipeline {
    uri: String,
    runner: Arc<dyn CommandRunner>,
    layout: ImageLayout,
    disks: OverlayDiskCreator,
    seeds: SeedImageGenerator,
    install_tool: String,
    os_variant: String,
    default_user: String,
    use_sudo: bool,
}

impl ProvisioningPipeline {
    /// Pipeline defining domains on the daemon at `uri`.
    pub fn new(uri: impl Into<String>, runner: Arc<dyn CommandRunner>, config: &ProvisionConfig) -> Self {
        Self {
            uri: uri.into(),
            runner,
            layout: ImageLayout::new(&config.images_dir, &config.base_image),
            disks: OverlayDiskCreator::new()
                .with_qemu_img(&config.disk_tool)
                .with_sudo(config.use_sudo),
            seeds: SeedImageGenerator::new()
                .with_tool(SeedTool::from_program(&config.seed_tool))
                .with_sudo(config.use_sudo),
            install_tool: config.install_tool.clone(),
            os_variant: config.os_variant.clone(),
            default_user: config.default_user.clone(),
            use_sudo: config.use_sudo,
        }
    }

    pub fn layout(&self) -> &ImageLayout {
        &self.layout
    }

    /// Run all three steps. Returns once the daemon accepted the start;
    /// guest boot is not awaited.
    ///
    /// Duplicate names are the caller's concern.
    #[instrument(skip(self, request), fields(vm_name = %request.name))]
    pub async fn provision(&self, request: &ProvisioningRequest) -> Result<ProvisionedVm> {
        request.validate()?;

        info!(
            vcpus = request.vcpus,
            memory_mb = request.memory_mb,
            disk_gb = request.disk_gb,
            network = %request.network,
            "Provisioning VM"
        );

        let disk_path = self.layout.disk_path(&request.name);
        self.disks
            .create(
                self.runner.as_ref(),
                self.layout.base_image(),
                &disk_path,
                request.disk_gb,
            )
            .await?;

        let seed_path = self.layout.seed_path(&request.name);
        let mut seed = SeedConfig::new(&request.name).with_user(&self.default_user);
        if let Some(ref key) = request.ssh_pubkey {
            seed = seed.with_ssh_key(key);
        }
        self.seeds
            .generate(self.runner.as_ref(), &seed, &seed_path)
            .await?;

        let install = self.install_invocation(request, &disk_path, &seed_path);
        run_checked(self.runner.as_ref(), &install).await?;

        info!(disk = %disk_path.display(), seed = %seed_path.display(), "VM defined and started");

        Ok(ProvisionedVm {
            name: request.name.clone(),
            disk_path,
            seed_path,
        })
    }

    /// The definition-tool call: import the overlay, attach the seed as a
    /// read-only cdrom, headless, return as soon as the domain starts.
    pub fn install_invocation(
        &self,
        request: &ProvisioningRequest,
        disk_path: &std::path::Path,
        seed_path: &std::path::Path,
    ) -> ToolInvocation {
        ToolInvocation::new(&self.install_tool)
            .args(["--connect", self.uri.as_str()])
            .args(["--name", request.name.as_str()])
            .arg("--memory")
            .arg(request.memory_mb.to_string())
            .arg("--vcpus")
            .arg(request.vcpus.to_string())
            .arg("--disk")
            .arg(format!("path={},format=qcow2,cache=none", disk_path.display()))
            .arg("--disk")
            .arg(format!("path={},device=cdrom", seed_path.display()))
            .arg("--import")
            .args(["--os-variant", self.os_variant.as_str()])
            .arg("--network")
            .arg(format!("network={}", request.network))
            .args(["--graphics", "none"])
            .arg("--noautoconsole")
            .args(["--wait", "0"])
            .sudo_if(self.use_sudo)
    }
}
