//! Disk image layout and overlay creation.
//!
//! Every VM gets a QCOW2 copy-on-write overlay on top of one shared,
//! read-only base image. Overlays and seed images live side by side in
//! the images directory.

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument};

use crate::error::Result;
use crate::tools::{run_checked, CommandRunner, ToolInvocation};

/// Default directory for VM disks and seed images.
pub const DEFAULT_IMAGES_DIR: &str = "/var/lib/libvirt/images";

/// Default base cloud image.
pub const DEFAULT_BASE_IMAGE: &str = "/var/lib/libvirt/images/base/jammy-server-cloudimg-amd64.img";

/// Where per-VM artifacts are placed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageLayout {
    images_dir: PathBuf,
    base_image: PathBuf,
}

impl Default for ImageLayout {
    fn default() -> Self {
        Self::new(DEFAULT_IMAGES_DIR, DEFAULT_BASE_IMAGE)
    }
}

impl ImageLayout {
    pub fn new(images_dir: impl Into<PathBuf>, base_image: impl Into<PathBuf>) -> Self {
        Self {
            images_dir: images_dir.into(),
            base_image: base_image.into(),
        }
    }

    pub fn images_dir(&self) -> &Path {
        &self.images_dir
    }

    pub fn base_image(&self) -> &Path {
        &self.base_image
    }

    /// `<images>/<name>.qcow2`
    pub fn disk_path(&self, name: &str) -> PathBuf {
        self.images_dir.join(format!("{}.qcow2", name))
    }

    /// `<images>/<name>-seed.iso`
    pub fn seed_path(&self, name: &str) -> PathBuf {
        self.images_dir.join(format!("{}-seed.iso", name))
    }
}

/// Creates overlay disks with `qemu-img`.
#[derive(Debug, Clone)]
pub struct OverlayDiskCreator {
    qemu_img_path: String,
    use_sudo: bool,
}

impl Default for OverlayDiskCreator {
    fn default() -> Self {
        Self::new()
    }
}

impl OverlayDiskCreator {
    pub fn new() -> Self {
        Self {
            qemu_img_path: "qemu-img".to_string(),
            use_sudo: false,
        }
    }

    /// Set the qemu-img binary path.
    pub fn with_qemu_img(mut self, path: impl Into<String>) -> Self {
        self.qemu_img_path = path.into();
        self
    }

    pub fn with_sudo(mut self, use_sudo: bool) -> Self {
        self.use_sudo = use_sudo;
        self
    }

    /// The qemu-img call that creates `overlay` on top of `base`.
    pub fn invocation(&self, base: &Path, overlay: &Path, size_gb: u64) -> ToolInvocation {
        ToolInvocation::new(&self.qemu_img_path)
            .args(["create", "-f", "qcow2", "-F", "qcow2", "-b"])
            .arg(base.display().to_string())
            .arg(overlay.display().to_string())
            .arg(format!("{}G", size_gb))
            .sudo_if(self.use_sudo)
    }

    /// Create a QCOW2 overlay backed by `base`.
    #[instrument(skip(self, runner), fields(overlay = %overlay.display(), size_gb = size_gb))]
    pub async fn create(
        &self,
        runner: &dyn CommandRunner,
        base: &Path,
        overlay: &Path,
        size_gb: u64,
    ) -> Result<()> {
        info!("Creating overlay disk");

        run_checked(runner, &self.invocation(base, overlay, size_gb)).await?;

        debug!(base = %base.display(), "Overlay disk created");
        Ok(())
    }
}

/// Remove a file if it is still there.
///
/// Returns `Ok(false)` when nothing was present.
pub fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
