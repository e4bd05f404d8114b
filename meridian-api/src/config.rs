//! Station Configuration Module
//!
//! Loads [`StationConfig`] plus server-only settings from environment
//! variables, with defaults suitable for a single local station.

use crate::error::{ServerError, ServerResult};
use meridian_core::{StationConfig, TlsConfig, TransportKind, DEFAULT_LOG_CAPACITY};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;

/// Default port a station listens on.
pub const DEFAULT_PORT: u16 = 1099;

/// Default LMDB map size of the registry, in megabytes.
pub const DEFAULT_REGISTRY_SIZE_MB: usize = 256;

/// Settings for one station process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    pub station: StationConfig,
    /// Address the inbound server binds to
    pub bind: IpAddr,
    pub registry_size_mb: usize,
}

impl ServerSettings {
    /// Load settings from the process environment.
    ///
    /// Environment variables:
    /// - `MERIDIAN_HOST`: host name peers use to reach this station (default: localhost)
    /// - `MERIDIAN_PORT`: listening port (default: 1099)
    /// - `MERIDIAN_BIND`: bind address (default: 0.0.0.0)
    /// - `MERIDIAN_DATA_DIR`: application data directory (default: ~/.meridian)
    /// - `MERIDIAN_TRANSPORT`: `grpc` or `proxy` (default: grpc)
    /// - `MERIDIAN_TLS_CERT` / `MERIDIAN_TLS_KEY`: PEM identity, enables TLS when both set
    /// - `MERIDIAN_TLS_CA`: PEM CA used to verify peers
    /// - `MERIDIAN_LOG_CAPACITY`: entries kept per agent log (default: 200)
    /// - `MERIDIAN_MAX_FRAME_BYTES`: proxy frame limit (default: 64 MiB)
    /// - `MERIDIAN_REGISTRY_SIZE_MB`: LMDB map size (default: 256)
    pub fn from_env() -> ServerResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> ServerResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let host = var("MERIDIAN_HOST").unwrap_or_else(|| "localhost".to_string());
        let port = parse_or(&var, "MERIDIAN_PORT", DEFAULT_PORT)?;
        let data_dir = match var("MERIDIAN_DATA_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => default_data_dir()?,
        };

        let mut station = StationConfig::new(host, port, data_dir);
        station.transport = parse_or(&var, "MERIDIAN_TRANSPORT", TransportKind::Grpc)?;
        station.log_capacity = parse_or(&var, "MERIDIAN_LOG_CAPACITY", DEFAULT_LOG_CAPACITY)?;
        station.max_frame_bytes =
            parse_or(&var, "MERIDIAN_MAX_FRAME_BYTES", station.max_frame_bytes)?;
        station.tls = match (var("MERIDIAN_TLS_CERT"), var("MERIDIAN_TLS_KEY")) {
            (Some(cert), Some(key)) => Some(TlsConfig {
                cert_path: cert.into(),
                key_path: key.into(),
                ca_path: var("MERIDIAN_TLS_CA").map(PathBuf::from),
            }),
            (None, None) => None,
            _ => {
                return Err(ServerError::env(
                    "MERIDIAN_TLS_CERT",
                    "MERIDIAN_TLS_CERT and MERIDIAN_TLS_KEY must be set together",
                ))
            }
        };
        station.validate()?;

        Ok(Self {
            station,
            bind: parse_or(&var, "MERIDIAN_BIND", IpAddr::V4(Ipv4Addr::UNSPECIFIED))?,
            registry_size_mb: parse_or(&var, "MERIDIAN_REGISTRY_SIZE_MB", DEFAULT_REGISTRY_SIZE_MB)?,
        })
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.station.port)
    }
}

/// `~/.meridian`, the fixed application data directory.
pub fn default_data_dir() -> ServerResult<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(".meridian"))
        .ok_or_else(|| ServerError::env("MERIDIAN_DATA_DIR", "no home directory to default to"))
}

fn parse_or<T, V>(var: &V, key: &str, default: T) -> ServerResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    V: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ServerError::env(key, format!("{} ({})", raw, e))),
        None => Ok(default),
    }
}
