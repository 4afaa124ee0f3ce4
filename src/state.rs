//! # Application State Management
//!
//! Shared state handed to every HTTP worker and every relay session through
//! `web::Data<AppState>`.
//!
//! ## What lives here:
//! - **config**: the validated startup configuration (read-only after start)
//! - **registry**: inbound-connection id → shutdown recipient of its session
//! - **metrics**: counters for the health endpoint
//! - **lifecycle**: LISTENING until the listener ends on its own, then TERMINATED
//!
//! ## Arc<RwLock<T>> Pattern
//! Every field is behind an `Arc`, so cloning `AppState` is cheap and all
//! clones observe the same data. Locks are held only for the duration of a
//! single counter update or map operation, never across an `.await`.
//!
//! The registry is the only state shared between Pairings, and it is used only
//! to find live sessions during shutdown.

use crate::config::AppConfig;
use crate::connection::ConnectionId;
use crate::forwarder::{Direction, Forwarded};
use crate::session::Shutdown;
use actix::Recipient;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

/// Server lifecycle. There is no degraded state: a failing Pairing never
/// changes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Listening,
    Terminated,
}

impl ServerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerState::Listening => "listening",
            ServerState::Terminated => "terminated",
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub registry: PairingRegistry,
    pub metrics: Arc<RwLock<RelayMetrics>>,
    pub start_time: Instant,
    lifecycle: Arc<RwLock<ServerState>>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RelayMetrics {
    pub active_pairings: u64,
    pub total_pairings: u64,
    pub frames_to_upstream: u64,
    pub frames_to_client: u64,
    pub frames_dropped: u64,
    pub connector_failures: u64,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(config),
            registry: PairingRegistry::default(),
            metrics: Arc::new(RwLock::new(RelayMetrics::default())),
            start_time: Instant::now(),
            lifecycle: Arc::new(RwLock::new(ServerState::Listening)),
        }
    }

    pub fn server_state(&self) -> ServerState {
        *self.lifecycle.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn mark_terminated(&self) {
        *self.lifecycle.write().unwrap_or_else(PoisonError::into_inner) = ServerState::Terminated;
    }

    pub fn pairing_opened(&self) {
        let mut metrics = self.metrics_mut();
        metrics.active_pairings += 1;
        metrics.total_pairings += 1;
    }

    pub fn pairing_closed(&self) {
        let mut metrics = self.metrics_mut();
        metrics.active_pairings = metrics.active_pairings.saturating_sub(1);
    }

    pub fn connector_failed(&self) {
        self.metrics_mut().connector_failures += 1;
    }

    pub fn record_forward(&self, direction: Direction, outcome: Forwarded) {
        let mut metrics = self.metrics_mut();
        match (outcome, direction) {
            (Forwarded::Dropped, _) => metrics.frames_dropped += 1,
            (Forwarded::Delivered, Direction::ToOutbound) => metrics.frames_to_upstream += 1,
            (Forwarded::Delivered, Direction::ToInbound) => metrics.frames_to_client += 1,
        }
    }

    pub fn metrics_snapshot(&self) -> RelayMetrics {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    fn metrics_mut(&self) -> std::sync::RwLockWriteGuard<'_, RelayMetrics> {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Live sessions, keyed by the id of their inbound connection.
#[derive(Clone, Default)]
pub struct PairingRegistry {
    inner: Arc<RwLock<HashMap<ConnectionId, Recipient<Shutdown>>>>,
}

impl PairingRegistry {
    pub fn register(&self, id: ConnectionId, recipient: Recipient<Shutdown>) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, recipient);
    }

    /// Returns whether the id was still registered.
    pub fn release(&self, id: &ConnectionId) -> bool {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Recipients of every live session at this moment.
    pub fn recipients(&self) -> Vec<(ConnectionId, Recipient<Shutdown>)> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, recipient)| (*id, recipient.clone()))
            .collect()
    }
}

impl fmt::Debug for PairingRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PairingRegistry")
            .field("live", &self.len())
            .finish()
    }
}
