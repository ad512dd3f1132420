//! Strata Core - Foundational Types
//!
//! Error taxonomy, configuration and logging shared by the Strata
//! image builder crates.

pub mod config;
pub mod error;
pub mod log;

// Re-export commonly used types
pub use config::{BuilderConfig, NetworkConfig};
pub use error::{BuildError, Result};
pub use log::{init_tracing, LogConfig, LogFormat};

/// Strata version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
