//! # Relay Server
//!
//! Binds the client-facing listener and starts one [`RelaySocket`] per accepted
//! WebSocket.
//!
//! ## Routes:
//! - `GET /health`: JSON status (see [`crate::health`])
//! - any other path: WebSocket upgrade into a relay session
//!
//! ## Server Lifecycle:
//! ```text
//! LISTENING ──(listener ends on its own)──► TERMINATED
//! LISTENING ──(shutdown)──► pause accept ─► close every Pairing ─► stop ─► TERMINATED
//! ```
//! Accepting is paused before any Pairing is signalled. A client whose upgrade
//! was already in flight can still register afterwards; the drain loop signals
//! those late registrations as they appear.
//! A failing Pairing never changes the server state. The server does not
//! restart itself; that is the owning process's job.
//!
//! ## Signals:
//! actix's own signal handling is disabled. `main` listens for SIGTERM/SIGINT
//! and calls [`ListeningHandle::shutdown`], so active Pairings are closed
//! before the listener is released.

use crate::config::AppConfig;
use crate::error::{RelayError, RelayResult};
use crate::health;
use crate::session::{RelaySocket, Shutdown};
use crate::state::{AppState, PairingRegistry};
use actix_web::dev::ServerHandle;
use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
use actix_web_actors::ws;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;

const DRAIN_POLL: Duration = Duration::from_millis(50);

/// WebSocket upgrade handler for the client-facing leg.
pub async fn relay_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    let peer = req
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    info!(peer = %peer, path = req.path(), "Client connected");

    let max_frame = state.config.relay.max_message_bytes;
    ws::WsResponseBuilder::new(RelaySocket::new(state.get_ref().clone(), peer), &req, stream)
        .frame_size(max_frame)
        .start()
}

/// Route table shared by the server and the tests.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health::health_check))
        .default_service(web::to(relay_websocket));
}

/// Bind the listener and start serving.
///
/// ## Errors:
/// `RelayError::Bind` when the address is in use or otherwise unavailable.
pub fn start(config: &AppConfig, state: AppState) -> RelayResult<ListeningHandle> {
    let bind_addr = config.bind_address();
    let data = web::Data::new(state.clone());

    let server = HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .wrap(TracingLogger::default())
            .configure(configure)
    })
    .workers(config.server.workers)
    .shutdown_timeout(config.server.shutdown_timeout_secs)
    .disable_signals()
    .bind(&bind_addr)
    .map_err(|err| RelayError::Bind(format!("{}: {}", bind_addr, err)))?;

    let local_addr = server
        .addrs()
        .first()
        .copied()
        .ok_or_else(|| RelayError::Bind(format!("{}: no address bound", bind_addr)))?;

    let server = server.run();
    let server_handle = server.handle();
    let task = actix_web::rt::spawn(server);

    info!(address = %local_addr, workers = config.server.workers, "Relay listening");

    Ok(ListeningHandle {
        local_addr,
        server: server_handle,
        task: Some(task),
        state,
        shutdown_timeout: config.shutdown_timeout(),
    })
}

/// A running listener.
pub struct ListeningHandle {
    local_addr: SocketAddr,
    server: ServerHandle,
    task: Option<JoinHandle<std::io::Result<()>>>,
    state: AppState,
    shutdown_timeout: Duration,
}

impl ListeningHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Resolves when the listener ends without being asked to. The server is
    /// TERMINATED afterwards.
    pub async fn wait(&mut self) -> RelayResult<()> {
        let Some(task) = self.task.as_mut() else {
            return Ok(());
        };
        let outcome = task.await;
        self.task = None;
        self.state.mark_terminated();

        match outcome {
            Ok(Ok(())) => {
                warn!("Listener stopped");
                Ok(())
            }
            Ok(Err(err)) => {
                error!(error = %err, "Listener failed");
                Err(RelayError::Bind(format!("listener failed: {}", err)))
            }
            Err(err) => {
                error!(error = %err, "Listener task failed");
                Err(RelayError::Bind(format!("listener task failed: {}", err)))
            }
        }
    }

    /// Stop accepting, close every active Pairing, then release the listener.
    pub async fn shutdown(mut self) -> RelayResult<()> {
        // No new connections from here on.
        self.server.pause().await;
        info!(pairings = self.state.registry.len(), "Shutting down relay");

        let registry = self.state.registry.clone();
        if !drain_pairings(&registry, self.shutdown_timeout).await {
            warn!(
                remaining = registry.len(),
                timeout_secs = self.shutdown_timeout.as_secs(),
                "Pairings still open at shutdown deadline"
            );
        }

        self.server.stop(true).await;
        let result = match self.task.take() {
            Some(task) => match task.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(RelayError::Bind(format!("listener failed: {}", err))),
                Err(err) => Err(RelayError::Bind(format!("listener task failed: {}", err))),
            },
            None => Ok(()),
        };
        self.state.mark_terminated();

        info!("Relay stopped");
        result
    }
}

/// Signal every registered Pairing, including ones that register while
/// draining, until the registry is empty. Returns `false` on timeout.
async fn drain_pairings(registry: &PairingRegistry, timeout: Duration) -> bool {
    let mut signalled = HashSet::new();
    let drained = tokio::time::timeout(timeout, async {
        loop {
            for (id, recipient) in registry.recipients() {
                if signalled.insert(id) {
                    recipient.do_send(Shutdown);
                }
            }
            if registry.is_empty() {
                break;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
    })
    .await;
    drained.is_ok()
}
