//! ctr-remote Core - Foundational Types
//!
//! Error taxonomy, configuration, and the persisted label keys shared by
//! the runtime pipeline and the CLI.

pub mod config;
pub mod error;
pub mod labels;

// Re-export commonly used types
pub use config::{LogLevel, RemoteConfig};
pub use error::{RemoteError, Result, Stage};

/// ctr-remote version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
