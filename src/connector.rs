//! # Outbound Connector
//!
//! Opens and owns the single upstream connection of one Pairing.
//!
//! ## Handshake:
//! - URL: `{base_url}?model={model}`
//! - `Authorization: Bearer <api key>`
//! - `OpenAI-Beta: <protocol marker>` (default `realtime=v1`)
//!
//! The request is built in [`OutboundConnector::new`], so a malformed URL or
//! credential fails before any socket is opened.
//!
//! ## Events (in order):
//! `Open`, then any number of `Message`s in receipt order, then `Closed`. A
//! transport failure emits `Error` immediately before `Closed`; the leg is
//! never left half-open.
//!
//! ## No resumption:
//! The reconnect policy only covers the initial handshake. Once `Open` has been
//! emitted, a dropped connection ends with `Closed` and the Pairing goes with it.

use crate::config::UpstreamConfig;
use crate::connection::{Command, ConnectionEvent, ConnectionId, ConnectionState, StateCell};
use crate::error::{RelayError, RelayResult};
use crate::reconnect::ReconnectPolicy;
use crate::transport::{self, PumpExit, SocketHandle};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::{HeaderValue, Request};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header carrying the realtime protocol version marker.
pub const BETA_HEADER: &str = "openai-beta";

/// Handle to the upstream leg of a Pairing.
pub type OutboundConnection = SocketHandle;

type UpstreamStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Everything needed to dial the remote realtime endpoint once.
#[derive(Debug)]
pub struct OutboundConnector {
    id: ConnectionId,
    url: String,
    authorization: HeaderValue,
    beta: HeaderValue,
    connect_timeout: Duration,
    close_timeout: Duration,
    policy: ReconnectPolicy,
}

impl OutboundConnector {
    /// Prepare a connector. Fails immediately on configuration that can never connect.
    pub fn new(upstream: &UpstreamConfig, policy: ReconnectPolicy) -> RelayResult<Self> {
        let mut authorization = HeaderValue::from_str(&format!("Bearer {}", upstream.api_key))
            .map_err(|_| {
                RelayError::OutboundConnect("API key is not a valid header value".to_string())
            })?;
        authorization.set_sensitive(true);

        let beta = HeaderValue::from_str(&upstream.beta_header).map_err(|_| {
            RelayError::OutboundConnect(format!(
                "Invalid protocol marker: {:?}",
                upstream.beta_header
            ))
        })?;

        let connector = Self {
            id: Uuid::new_v4(),
            url: upstream.endpoint_url(),
            authorization,
            beta,
            connect_timeout: upstream.connect_timeout(),
            close_timeout: upstream.close_timeout(),
            policy,
        };
        connector.build_request()?;

        Ok(connector)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Start connecting in the background.
    ///
    /// The returned handle reports CONNECTING until the `Open` event; sends before
    /// then are dropped.
    pub fn open(self) -> (OutboundConnection, UnboundedReceiver<ConnectionEvent>) {
        let state = StateCell::new(ConnectionState::Connecting);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let handle = SocketHandle::new(self.id, "upstream", state.clone(), commands_tx);
        tokio::spawn(self.run(state, commands_rx, events_tx));

        (handle, events_rx)
    }

    fn build_request(&self) -> RelayResult<Request<()>> {
        let mut request = self.url.as_str().into_client_request()?;

        match request.uri().scheme_str() {
            Some("ws") | Some("wss") => {}
            other => {
                return Err(RelayError::OutboundConnect(format!(
                    "Unsupported upstream scheme: {}",
                    other.unwrap_or("<none>")
                )));
            }
        }
        if request.uri().host().is_none() {
            return Err(RelayError::OutboundConnect(format!(
                "Upstream URL has no host: {}",
                self.url
            )));
        }

        // tungstenite fills in the upgrade headers itself
        let headers = request.headers_mut();
        headers.insert(AUTHORIZATION, self.authorization.clone());
        headers.insert(BETA_HEADER, self.beta.clone());

        Ok(request)
    }

    async fn run(
        self,
        state: StateCell,
        mut commands: UnboundedReceiver<Command>,
        events: UnboundedSender<ConnectionEvent>,
    ) {
        let outcome = tokio::select! {
            result = self.handshake() => result,
            _ = transport::wait_for_close(&mut commands) => {
                info!(outbound_id = %self.id, "Upstream connection cancelled during handshake");
                state.set(ConnectionState::Closed);
                transport::emit(&events, ConnectionEvent::Closed);
                return;
            }
        };

        // Handshake failures never produce `Open`, only `Error` then `Closed`.
        let mut stream = match outcome {
            Ok(stream) => stream,
            Err(err) => {
                error!(outbound_id = %self.id, error = %err, "Upstream connection failed");
                state.set(ConnectionState::Closed);
                transport::emit(&events, ConnectionEvent::Error(err));
                transport::emit(&events, ConnectionEvent::Closed);
                return;
            }
        };

        // A close requested mid-handshake wins over the finished handshake.
        if !state.mark_open() {
            debug!(outbound_id = %self.id, "Close requested while handshake completed");
            if let Err(err) = stream.close(None).await {
                debug!(outbound_id = %self.id, error = %err, "Close frame not sent");
            }
            state.set(ConnectionState::Closed);
            transport::emit(&events, ConnectionEvent::Closed);
            return;
        }

        info!(outbound_id = %self.id, "Connected to upstream");
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
        state.set(ConnectionState::Closed);

        match exit {
            PumpExit::LocalClose => info!(outbound_id = %self.id, "Upstream connection closed"),
            PumpExit::RemoteClose => info!(outbound_id = %self.id, "Upstream closed the connection"),
            PumpExit::Dropped(err) => {
                error!(outbound_id = %self.id, error = %err, "Upstream connection dropped");
                transport::emit(&events, ConnectionEvent::Error(err));
            }
        }
        transport::emit(&events, ConnectionEvent::Closed);
    }

    async fn handshake(&self) -> RelayResult<UpstreamStream> {
        let mut attempt = 0;
        loop {
            let request = self.build_request()?;
            let err = match tokio::time::timeout(self.connect_timeout, connect_async(request)).await
            {
                Ok(Ok((stream, response))) => {
                    debug!(
                        outbound_id = %self.id,
                        status = %response.status(),
                        "Upstream handshake complete"
                    );
                    return Ok(stream);
                }
                Ok(Err(err)) => RelayError::from(err),
                Err(_) => RelayError::OutboundConnect(format!(
                    "Handshake timed out after {}s",
                    self.connect_timeout.as_secs()
                )),
            };

            let Some(delay) = self.policy.delay_for(attempt) else {
                if self.policy.is_enabled() {
                    warn!(outbound_id = %self.id, attempts = attempt + 1, "Upstream handshake retries exhausted");
                }
                return Err(err);
            };
            attempt += 1;
            warn!(
                outbound_id = %self.id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Upstream handshake failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
