//! Playdeck Common Library
//!
//! Shared run model, events, and error types used by the orchestrator and the
//! web boundary.

pub mod error;
pub mod types;

pub use error::{Error, ErrorKind, Result};
pub use types::*;

/// Playdeck version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default data directory (history log and archived reports)
pub fn default_data_dir() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".playdeck")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
