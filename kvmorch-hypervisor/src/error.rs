//! Error types for the orchestration layer.

use thiserror::Error;

/// Errors that can occur during orchestration.
#[derive(Error, Debug)]
pub enum HypervisorError {
    /// Failed to open the control connection to the daemon.
    #[error("Failed to connect to hypervisor: {0}")]
    ConnectionFailed(String),

    /// No domain with this name is defined.
    #[error("VM '{0}' not found")]
    VmNotFound(String),

    /// No network object with this name exists.
    #[error("network '{0}' not found")]
    NetworkNotFound(String),

    /// The VM has no interface with this hardware address.
    #[error("MAC {mac} not found on {vm}")]
    InterfaceNotFound { vm: String, mac: String },

    /// A domain with this name is already defined.
    #[error("VM '{0}' already exists")]
    Conflict(String),

    /// An external tool exited unsuccessfully or could not be spawned.
    #[error("{tool} failed: {message}")]
    ExternalTool { tool: String, message: String },

    /// Address resolution exhausted every tier without a match.
    #[error("No IP found for '{0}'")]
    TimeoutNoResult(String),

    /// The daemon rejected an operation.
    #[error("Operation failed: {0}")]
    OperationFailed(String),

    /// Request failed validation.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// XML generation/parsing error.
    #[error("XML error: {0}")]
    XmlError(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl HypervisorError {
    /// True for every "target does not exist" variant.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::VmNotFound(_) | Self::NetworkNotFound(_) | Self::InterfaceNotFound { .. }
        )
    }
}

/// Result type alias for orchestration operations.
pub type Result<T> = std::result::Result<T, HypervisorError>;
