//! Meridian Station Entry Point
//!
//! Loads settings from the environment, takes the per-port lock, boots the
//! station and serves the configured inbound transport until Ctrl-C.

use std::process::ExitCode;
use std::sync::Arc;

use meridian_agents::InboundHandler;
use meridian_api::{
    boot, builtin_catalog, init_tracing, open_station, prepare_data_dir, serve_inbound,
    shutdown_signal, ServerResult, ServerSettings, StationLock,
};

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Station failed");
            eprintln!("meridian-station: {}", e);
            ExitCode::FAILURE
        }
    }
}

// The transport client owns its own runtime, so the station is built and
// dropped outside the server runtime.
fn run() -> ServerResult<()> {
    init_tracing()?;

    let settings = ServerSettings::from_env()?;
    prepare_data_dir(&settings.station)?;
    let _lock = StationLock::acquire(settings.station.lock_path(), settings.station.port)?;

    let station = open_station(&settings, Arc::new(builtin_catalog()))?;
    boot(&station)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("meridian-server")
        .enable_all()
        .build()
        .map_err(|e| meridian_api::ServerError::Serve(format!("server runtime: {}", e)))?;

    tracing::info!(addr = %settings.bind_addr(), "Starting Meridian station");
    let handler: Arc<dyn InboundHandler> = station.clone();
    let served = runtime.block_on(serve_inbound(&settings, handler, shutdown_signal()));
    drop(runtime);

    station.shutdown();
    tracing::info!("Station stopped");
    served
}
