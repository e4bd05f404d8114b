//! Server error types

use meridian_core::StationError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while bringing a station process up or serving it.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Station(#[from] StationError),

    #[error("Invalid value for {key}: {reason}")]
    Env { key: String, reason: String },

    #[error("A station is already running on port {port} (lock {path})")]
    AlreadyRunning { port: u16, path: PathBuf },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to initialize telemetry: {0}")]
    Telemetry(String),

    #[error("Server error: {0}")]
    Serve(String),
}

pub type ServerResult<T> = Result<T, ServerError>;

impl ServerError {
    pub fn env(key: impl Into<String>, reason: impl Into<String>) -> Self {
        ServerError::Env {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ServerError::Io {
            path: path.into(),
            source,
        }
    }
}
