//! Station assembly and inbound serving
//!
//! Wires configuration into a running station: registry, package cache,
//! transport backend, loader. The inbound server matching the configured
//! backend then dispatches peer calls into the station.

use crate::config::ServerSettings;
use crate::error::{ServerError, ServerResult};
use crate::grpc::{GrpcInboundServer, GrpcTransport, TlsMaterial};
use crate::proxy::{ProxyInboundServer, ProxyTransport};
use meridian_agents::{AgentStation, Endpoint, InboundHandler, PackageLoader, RemoteTransport};
use meridian_core::{StationResult, TransportKind};
use meridian_storage::{LmdbRegistry, PackageStore};
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

/// Client side of the configured backend.
pub fn build_transport(settings: &ServerSettings) -> ServerResult<Arc<dyn RemoteTransport>> {
    let station = &settings.station;
    let transport: Arc<dyn RemoteTransport> = match station.transport {
        TransportKind::Grpc => {
            let tls = station.tls.as_ref().map(TlsMaterial::load).transpose()?;
            Arc::new(GrpcTransport::new(tls, station.max_frame_bytes)?)
        }
        TransportKind::Proxy => Arc::new(ProxyTransport::new(station.max_frame_bytes)?),
    };
    Ok(transport)
}

/// Assemble a station from `settings`. The data directory must exist.
pub fn open_station(
    settings: &ServerSettings,
    loader: Arc<dyn PackageLoader>,
) -> ServerResult<Arc<AgentStation>> {
    let config = &settings.station;
    let registry = LmdbRegistry::open(config.registry_dir(), settings.registry_size_mb)
        .map_err(meridian_core::StationError::from)?;
    let packages = PackageStore::new(config.package_dir())?;
    let transport = build_transport(settings)?;

    info!(
        host = %config.host,
        port = config.port,
        transport = %config.transport,
        tls = config.tls.is_some(),
        "Opening station"
    );
    Ok(
        AgentStation::builder(Endpoint::new(config.host.clone(), config.port), Arc::new(registry), packages)
            .with_transport(transport)
            .with_loader(loader)
            .with_log_capacity(config.log_capacity)
            .build(),
    )
}

/// Serve the inbound side of the configured backend until `shutdown`
/// resolves.
pub async fn serve_inbound<F>(
    settings: &ServerSettings,
    handler: Arc<dyn InboundHandler>,
    shutdown: F,
) -> ServerResult<()>
where
    F: Future<Output = ()> + Send,
{
    let config = &settings.station;
    let addr = settings.bind_addr();
    match config.transport {
        TransportKind::Grpc => {
            let mut server = GrpcInboundServer::new(handler, config.max_frame_bytes);
            if let Some(tls) = &config.tls {
                server = server.with_tls(TlsMaterial::load(tls)?);
            }
            server.serve(addr, shutdown).await
        }
        TransportKind::Proxy => {
            ProxyInboundServer::new(handler, config.max_frame_bytes)
                .serve(addr, shutdown)
                .await
        }
    }
}

/// Resolves on Ctrl-C.
pub async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => warn!(error = %e, "Failed to listen for Ctrl-C, shutting down"),
    }
}

/// Boot the station, logging what was restored.
pub fn boot(station: &AgentStation) -> StationResult<()> {
    let report = station.boot()?;
    info!(
        restored = report.restored,
        started = report.started,
        failed = report.failed.len(),
        "Station booted"
    );
    for key in &report.failed {
        warn!(agent = %key, "Persisted agent could not be restored");
    }
    Ok(())
}
