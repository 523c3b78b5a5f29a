//! Libvirt daemon backend.
//!
//! Requires the `libvirt` feature and the system libvirt client library.

#[cfg(feature = "libvirt")]
mod backend;

#[cfg(feature = "libvirt")]
pub use backend::{LibvirtConnection, LibvirtConnector};

/// Default connection URI.
pub const DEFAULT_URI: &str = "qemu:///system";

/// Check if libvirt backend is compiled in.
pub fn is_available() -> bool {
    cfg!(feature = "libvirt")
}
