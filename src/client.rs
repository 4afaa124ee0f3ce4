//! # Relay Client
//!
//! Client-facing counterpart of the relay: connects to a relay (or any WebSocket
//! endpoint) and keeps the connection up with bounded exponential backoff.
//!
//! ## Reconnection rules:
//! - Only an unclean end (handshake failure, transport error, no close frame) triggers a retry
//! - A clean close from either side ends the client for good
//! - The attempt counter resets every time a connection opens
//! - Once the policy is spent the last failure is reported as a single give-up
//!   `Error` followed by `Closed`, and the client stops
//!
//! Unlike the relay's upstream leg, this client is allowed to come back after a
//! drop; it does not carry any session state across reconnects.

use crate::connection::{Command, ConnectionEvent, ConnectionId, ConnectionState, StateCell};
use crate::error::RelayError;
use crate::reconnect::ReconnectPolicy;
use crate::transport::{self, PumpExit, SocketHandle};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Handle to a client connection.
pub type ClientConnection = SocketHandle;

#[derive(Debug, Clone)]
pub struct RelayClient {
    id: ConnectionId,
    url: String,
    policy: ReconnectPolicy,
    connect_timeout: Duration,
    close_timeout: Duration,
}

impl RelayClient {
    pub fn new(url: impl Into<String>, policy: ReconnectPolicy) -> Self {
        Self {
            id: Uuid::new_v4(),
            url: url.into(),
            policy,
            connect_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(5),
        }
    }

    /// Start connecting in the background.
    pub fn connect(self) -> (ClientConnection, UnboundedReceiver<ConnectionEvent>) {
        let state = StateCell::new(ConnectionState::Connecting);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let handle = SocketHandle::new(self.id, "client", state.clone(), commands_tx);
        tokio::spawn(self.run(state, commands_rx, events_tx));

        (handle, events_rx)
    }

    async fn run(
        self,
        state: StateCell,
        mut commands: UnboundedReceiver<Command>,
        events: UnboundedSender<ConnectionEvent>,
    ) {
        let mut attempt = 0;

        loop {
            let outcome = tokio::select! {
                result = tokio::time::timeout(self.connect_timeout, connect_async(self.url.as_str())) => result,
                _ = transport::wait_for_close(&mut commands) => {
                    finish(&state, &events);
                    return;
                }
            };

            let err = match outcome {
                Ok(Ok((mut stream, _))) => {
                    if !state.mark_open() {
                        if let Err(err) = stream.close(None).await {
                            debug!(client_id = %self.id, error = %err, "Close frame not sent");
                        }
                        finish(&state, &events);
                        return;
                    }

                    attempt = 0;
                    info!(client_id = %self.id, url = %self.url, "Client connected");
                    transport::emit(&events, ConnectionEvent::Open);

                    let exit = transport::pump(
                        stream,
                        self.id,
                        &state,
                        &mut commands,
                        &events,
                        self.close_timeout,
                    )
                    .await;

                    match exit {
                        PumpExit::LocalClose | PumpExit::RemoteClose => {
                            info!(client_id = %self.id, "Client connection closed");
                            finish(&state, &events);
                            return;
                        }
                        PumpExit::Dropped(err) => {
                            warn!(client_id = %self.id, error = %err, "Client connection dropped");
                            err
                        }
                    }
                }
                Ok(Err(err)) => RelayError::from(err),
                Err(_) => RelayError::OutboundConnect("Handshake timed out".to_string()),
            };

            // Out of retries: this failure is reported once, as the give-up.
            let Some(delay) = self.policy.delay_for(attempt) else {
                error!(client_id = %self.id, error = %err, "Max reconnection attempts reached");
                state.set(ConnectionState::Closed);
                transport::emit(
                    &events,
                    ConnectionEvent::Error(RelayError::OutboundConnect(format!(
                        "max reconnection attempts reached: {}",
                        err
                    ))),
                );
                transport::emit(&events, ConnectionEvent::Closed);
                return;
            };
            self.lost(&state, &events, err);
            attempt += 1;

            debug!(client_id = %self.id, attempt, delay_ms = delay.as_millis() as u64, "Reconnecting");
            transport::emit(&events, ConnectionEvent::Reconnecting { attempt, delay });

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = transport::wait_for_close(&mut commands) => {
                    finish(&state, &events);
                    return;
                }
            }
        }
    }

    /// Report an unclean end; the state goes back to CONNECTING for the next attempt.
    fn lost(&self, state: &StateCell, events: &UnboundedSender<ConnectionEvent>, err: RelayError) {
        state.set(ConnectionState::Connecting);
        transport::emit(events, ConnectionEvent::Error(err));
        transport::emit(events, ConnectionEvent::Closed);
    }
}

fn finish(state: &StateCell, events: &UnboundedSender<ConnectionEvent>) {
    state.set(ConnectionState::Closed);
    transport::emit(events, ConnectionEvent::Closed);
}
