//! Meridian API - Station Server
//!
//! Turns the station runtime into a process: environment configuration,
//! tracing setup, the application data directory and per-port lock, and
//! the two station-to-station transport backends.
//!
//! - `grpc`: HTTP/2 gRPC with optional TLS (Tonic)
//! - `proxy`: remote object proxy over newline-delimited JSON frames

pub mod builtin;
pub mod config;
pub mod error;
pub mod grpc;
pub mod process;
pub mod proxy;
pub mod server;
pub mod telemetry;

// Re-export commonly used types
pub use builtin::builtin_catalog;
pub use config::{default_data_dir, ServerSettings, DEFAULT_PORT, DEFAULT_REGISTRY_SIZE_MB};
pub use error::{ServerError, ServerResult};
pub use grpc::{GrpcInboundServer, GrpcTransport, TlsMaterial};
pub use process::{prepare_data_dir, StationLock};
pub use proxy::{ProxyInboundServer, ProxyTransport};
pub use server::{boot, build_transport, open_station, serve_inbound, shutdown_signal};
pub use telemetry::init_tracing;
