//! Configuration types

use crate::error::{StationError, StationResult, TransportError, ValidationError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Default number of entries kept in each agent log.
pub const DEFAULT_LOG_CAPACITY: usize = 200;

/// Default maximum size of one proxy transport frame.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Which remote transport backend the station uses. Fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// TLS-capable HTTP/2 gRPC
    Grpc,
    /// Remote object proxy over framed JSON
    Proxy,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Grpc => "grpc",
            TransportKind::Proxy => "proxy",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "grpc" => Ok(TransportKind::Grpc),
            "proxy" | "rmi" => Ok(TransportKind::Proxy),
            other => Err(ValidationError::InvalidValue {
                field: "transport".to_string(),
                reason: format!("unknown transport {}", other),
            }),
        }
    }
}

/// TLS material for the gRPC backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    /// CA used to verify peers
    pub ca_path: Option<PathBuf>,
}

/// Master station configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationConfig {
    /// Host name peers use to reach this station
    pub host: String,
    pub port: u16,
    /// Application data directory (packages, certs, registry, locks)
    pub data_dir: PathBuf,
    pub transport: TransportKind,
    pub tls: Option<TlsConfig>,
    pub log_capacity: usize,
    pub max_frame_bytes: usize,
}

impl StationConfig {
    pub fn new(host: impl Into<String>, port: u16, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            port,
            data_dir: data_dir.into(),
            transport: TransportKind::Grpc,
            tls: None,
            log_capacity: DEFAULT_LOG_CAPACITY,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    pub fn package_dir(&self) -> PathBuf {
        self.data_dir.join("packages")
    }

    pub fn cert_dir(&self) -> PathBuf {
        self.data_dir.join("certs")
    }

    pub fn registry_dir(&self) -> PathBuf {
        self.data_dir.join("registry")
    }

    /// Lock file guarding a single station per port.
    pub fn lock_path(&self) -> PathBuf {
        self.data_dir
            .join("locks")
            .join(format!("station-{}.lock", self.port))
    }

    pub fn validate(&self) -> StationResult<()> {
        if self.host.trim().is_empty() {
            return Err(StationError::missing("host"));
        }
        if self.port == 0 {
            return Err(StationError::Validation(ValidationError::InvalidValue {
                field: "port".to_string(),
                reason: "must be non-zero".to_string(),
            }));
        }
        if self.data_dir == Path::new("") {
            return Err(StationError::missing("data_dir"));
        }
        if self.log_capacity == 0 {
            return Err(StationError::Validation(ValidationError::InvalidValue {
                field: "log_capacity".to_string(),
                reason: "must be at least 1".to_string(),
            }));
        }
        if self.tls.is_some() && self.transport != TransportKind::Grpc {
            return Err(StationError::Transport(TransportError::Configuration {
                reason: "TLS is only supported by the grpc transport".to_string(),
            }));
        }
        Ok(())
    }
}
