//! Error types for Playdeck

use thiserror::Error;

use crate::types::RunId;

/// Result type alias using Playdeck Error
pub type Result<T> = std::result::Result<T, Error>;

/// Playdeck error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("A run is already active: {run_id}")]
    AlreadyRunning { run_id: RunId },

    #[error("No run is active")]
    NotRunning,

    #[error("Run not found: {run_id}")]
    RunNotFound { run_id: String },

    #[error("Failed to spawn test suite: {0}")]
    Spawn(String),

    #[error("Report error: {0}")]
    Report(String),

    #[error("History error: {0}")]
    History(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification used by callers to decide how to surface an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad request from the caller (invalid config, unknown run)
    UserInput,
    /// Request conflicts with the current run state
    Conflict,
    /// Anything the caller could not have prevented
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidConfig(_) | Error::RunNotFound { .. } => ErrorKind::UserInput,
            Error::AlreadyRunning { .. } | Error::NotRunning => ErrorKind::Conflict,
            _ => ErrorKind::Internal,
        }
    }

    pub fn run_not_found(run_id: impl ToString) -> Self {
        Error::RunNotFound {
            run_id: run_id.to_string(),
        }
    }
}
