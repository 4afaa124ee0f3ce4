//! # Realtime Relay Server
//!
//! Process entry point.
//!
//! ## Startup Sequence:
//! 1. Load `.env` and configuration
//! 2. Initialize structured logging
//! 3. Validate configuration (a missing API key exits non-zero, nothing is bound)
//! 4. Bind the listener and start serving
//! 5. Wait for SIGTERM/SIGINT or for the listener to end on its own
//!
//! ## Exit Codes:
//! - `0`: clean shutdown after a termination signal
//! - non-zero: startup error, bind error, or the listener terminated

use anyhow::Result;
use realtime_relay::logging::init_tracing;
use realtime_relay::{server, AppConfig, AppState};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

#[actix_web::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file (if present)
    dotenv::dotenv().ok();

    let config = AppConfig::load()?;
    init_tracing(config.logging.level)?;

    // Fail before binding: a relay without a credential must not accept clients
    if let Err(err) = config.validate() {
        error!(error = %err, "Refusing to start");
        return Err(err.into());
    }

    info!("Starting realtime-relay v{}", env!("CARGO_PKG_VERSION"));
    info!(
        address = %config.bind_address(),
        model = %config.upstream.model,
        upstream = %config.upstream.base_url,
        "Configuration loaded"
    );

    let state = AppState::new(config.clone());
    let mut handle = server::start(&config, state)?;

    // actix's signal handling is disabled, so termination is handled here
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        result = handle.wait() => {
            error!("Listener terminated, exiting");
            result?;
            anyhow::bail!("listener terminated unexpectedly");
        }
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }

    // Drain the pairings before the listener goes away
    info!("Shutdown signal received, closing pairings...");
    handle.shutdown().await?;

    info!("Server stopped gracefully");
    Ok(())
}
