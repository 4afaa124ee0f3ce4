//! # Realtime Relay
//!
//! A WebSocket relay between browser clients and a realtime speech/text API.
//! Every accepted client gets exactly one upstream connection; frames move
//! verbatim in both directions and closing either leg closes the other.
//!
//! ## Module Structure:
//! - [`connection`]: the Connection abstraction, frames, and lifecycle state
//! - [`forwarder`]: Pairing of two connections and the close-one-close-both rule
//! - [`connector`]: the upstream leg (handshake, headers, events)
//! - [`client`]: companion client with bounded reconnection
//! - [`reconnect`]: exponential backoff policy
//! - [`session`]: per-client WebSocket actor that owns a Pairing
//! - [`server`]: listener, routes, and graceful shutdown
//! - [`state`], [`health`]: shared state and the health endpoint
//! - [`config`], [`logging`], [`error`]: ambient plumbing

pub mod client;
pub mod config;
pub mod connection;
pub mod connector;
pub mod error;
pub mod forwarder;
pub mod health;
pub mod logging;
pub mod reconnect;
pub mod server;
pub mod session;
pub mod state;
mod transport;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::AppConfig;
pub use error::{RelayError, RelayResult};
pub use state::AppState;
pub use transport::SocketHandle;
