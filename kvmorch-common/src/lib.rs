//! # kvmorch Common
//!
//! Shared utilities for the kvmorch binaries.
//!
//! ```rust,ignore
//! use kvmorch_common::{init_logging_with_format, LogFormat};
//!
//! init_logging_with_format("info", LogFormat::Pretty)?;
//! ```

pub mod logging;

pub use logging::{init_logging, init_logging_json, init_logging_with_format, LogFormat};
