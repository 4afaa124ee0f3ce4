//! # Relay Sessions
//!
//! One [`RelaySocket`] actor per accepted client. The actor is the Pairing's
//! state object: it owns the [`Pairing`] of the client leg and the upstream leg
//! and is the only code that touches either of them.
//!
//! ## Session Lifecycle:
//! 1. **Started**: the Outbound Connector is built and opened; the Pairing is bound
//!    and registered for shutdown
//! 2. **Relaying**: client frames go upstream, upstream frames go to the client
//! 3. **Teardown**: any close path (client close, client error, upstream close,
//!    heartbeat timeout, idle timeout, server shutdown) calls `Pairing::teardown`
//! 4. **Stopped**: only after the upstream leg reported CLOSED; the registry entry
//!    is released here
//!
//! ## Message Flow:
//! ```text
//! client ──ws::Message──► RelaySocket ──Frame──► OutboundConnection ──► upstream
//! client ◄──ctx.text──── RelaySocket ◄─ConnectionEvent── connector task ◄── upstream
//! ```
//!
//! Upstream frames reach the client through the actor's own mailbox (`Deliver`),
//! so they are written in the order the upstream sent them. The end of the
//! upstream event stream goes through the same mailbox (`UpstreamFinished`), so
//! the client's close frame is never written ahead of a frame still queued.
//!
//! ## Limits:
//! A client frame, or a fragmented client message once reassembled, may not
//! exceed `relay.max_message_bytes`. A message that grows past it is discarded
//! and the client is closed with code 1009 (message too big).

use crate::connection::{
    Connection, ConnectionEvent, ConnectionId, ConnectionState, Frame, StateCell,
};
use crate::connector::{OutboundConnection, OutboundConnector};
use crate::error::RelayError;
use crate::forwarder::{Direction, Pairing};
use crate::state::AppState;
use actix::prelude::*;
use actix_http::ws::Item;
use actix_web::web::{Bytes, BytesMut};
use actix_web_actors::ws;
use std::time::{Duration, Instant};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Ask a session to close both legs; sent to every live session on shutdown.
#[derive(Message, Debug, Clone, Copy)]
#[rtype(result = "()")]
pub struct Shutdown;

/// Write one upstream frame to the client.
#[derive(Message)]
#[rtype(result = "()")]
struct Deliver(Frame);

/// Start the close handshake on the client leg.
#[derive(Message)]
#[rtype(result = "()")]
struct CloseClient;

/// The upstream event stream ended; queued behind every `Deliver` it produced.
#[derive(Message)]
#[rtype(result = "()")]
struct UpstreamFinished;

/// The client leg as seen by the Pairing.
#[derive(Clone)]
pub struct ClientLink {
    id: ConnectionId,
    state: StateCell,
    addr: Addr<RelaySocket>,
}

impl Connection for ClientLink {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }

    fn send(&self, frame: Frame) -> Result<(), RelayError> {
        let state = self.state.get();
        if state != ConnectionState::Open {
            warn!(
                pairing_id = %self.id,
                state = %state,
                bytes = frame.byte_len(),
                "Client not open, frame dropped"
            );
            return Ok(());
        }
        if !self.addr.connected() {
            return Err(RelayError::Forward("client session has stopped".to_string()));
        }
        self.addr.do_send(Deliver(frame));
        Ok(())
    }

    fn close(&self) {
        if self.state.begin_close() {
            self.addr.do_send(CloseClient);
        }
    }
}

/// Releases the registry entry when dropped, however the session ends.
struct Registration {
    id: ConnectionId,
    state: AppState,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if self.state.registry.release(&self.id) {
            self.state.pairing_closed();
            debug!(pairing_id = %self.id, "Pairing released");
        }
    }
}

/// A fragmented client message being reassembled.
#[derive(Debug)]
enum Fragments {
    Text(BytesMut),
    Binary(BytesMut),
}

impl Fragments {
    fn start(item: Item) -> Option<Self> {
        match item {
            Item::FirstText(data) => Some(Fragments::Text(BytesMut::from(&data[..]))),
            Item::FirstBinary(data) => Some(Fragments::Binary(BytesMut::from(&data[..]))),
            Item::Continue(_) | Item::Last(_) => None,
        }
    }

    fn len(&self) -> usize {
        match self {
            Fragments::Text(buf) | Fragments::Binary(buf) => buf.len(),
        }
    }

    fn push(&mut self, data: &Bytes) {
        match self {
            Fragments::Text(buf) | Fragments::Binary(buf) => buf.extend_from_slice(data),
        }
    }

    fn finish(self) -> Result<Frame, RelayError> {
        match self {
            Fragments::Binary(buf) => Ok(Frame::Binary(buf.to_vec())),
            Fragments::Text(buf) => String::from_utf8(buf.to_vec())
                .map(Frame::Text)
                .map_err(|_| RelayError::Forward("fragmented text is not valid UTF-8".to_string())),
        }
    }
}

/// WebSocket actor for one client and its Pairing.
pub struct RelaySocket {
    id: ConnectionId,
    state: AppState,
    peer: String,
    client_state: StateCell,
    pairing: Option<Pairing<ClientLink, OutboundConnection>>,
    registration: Option<Registration>,
    fragments: Option<Fragments>,
    close_sent: bool,
    upstream_opened: bool,
    upstream_failed: bool,
    last_heartbeat: Instant,
    last_activity: Instant,
}

impl RelaySocket {
    pub fn new(state: AppState, peer: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            state,
            peer: peer.into(),
            client_state: StateCell::new(ConnectionState::Connecting),
            pairing: None,
            registration: None,
            fragments: None,
            close_sent: false,
            upstream_opened: false,
            upstream_failed: false,
            last_heartbeat: Instant::now(),
            last_activity: Instant::now(),
        }
    }

    /// Send at most one close frame to the client.
    fn close_client(&mut self, ctx: &mut ws::WebsocketContext<Self>, reason: Option<ws::CloseReason>) {
        self.client_state.begin_close();
        if self.close_sent {
            return;
        }
        self.close_sent = true;
        ctx.close(reason);
    }

    fn upstream_close_reason(&self) -> ws::CloseReason {
        if self.upstream_failed {
            ws::CloseCode::Error.into()
        } else {
            ws::CloseCode::Normal.into()
        }
    }

    /// The client leg ended or must end; closes the upstream leg too.
    fn end_from_client(
        &mut self,
        ctx: &mut ws::WebsocketContext<Self>,
        reason: Option<ws::CloseReason>,
        cause: &'static str,
    ) {
        info!(pairing_id = %self.id, peer = %self.peer, cause, "Client disconnected");
        self.close_client(ctx, reason);
        if let Some(pairing) = self.pairing.as_mut() {
            pairing.inbound_closed();
        }
    }

    fn forward_to_upstream(&mut self, frame: Frame) {
        self.last_activity = Instant::now();
        if let Some(pairing) = self.pairing.as_mut() {
            let outcome = pairing.forward_to_outbound(frame);
            self.state.record_forward(Direction::ToOutbound, outcome);
        }
    }

    fn handle_continuation(&mut self, ctx: &mut ws::WebsocketContext<Self>, item: Item) {
        let fragments = match (self.fragments.take(), item) {
            (None, item) => match Fragments::start(item) {
                Some(fragments) => fragments,
                None => {
                    warn!(pairing_id = %self.id, "Continuation frame without a first fragment");
                    return;
                }
            },
            (Some(mut fragments), Item::Continue(data)) => {
                fragments.push(&data);
                fragments
            }
            (Some(mut fragments), Item::Last(data)) => {
                fragments.push(&data);
                if !self.within_message_limit(ctx, &fragments) {
                    return;
                }
                match fragments.finish() {
                    Ok(frame) => self.forward_to_upstream(frame),
                    Err(err) => warn!(pairing_id = %self.id, error = %err, "Fragmented frame dropped"),
                }
                return;
            }
            (Some(_), item) => {
                warn!(pairing_id = %self.id, "New fragmented message before the last one ended");
                match Fragments::start(item) {
                    Some(fragments) => fragments,
                    None => return,
                }
            }
        };
        if self.within_message_limit(ctx, &fragments) {
            self.fragments = Some(fragments);
        }
    }

    /// Ends the Pairing with 1009 once a reassembled message is over the limit.
    fn within_message_limit(
        &mut self,
        ctx: &mut ws::WebsocketContext<Self>,
        fragments: &Fragments,
    ) -> bool {
        let limit = self.state.config.relay.max_message_bytes;
        if fragments.len() <= limit {
            return true;
        }
        warn!(
            pairing_id = %self.id,
            bytes = fragments.len(),
            limit,
            "Fragmented message too large, closing client"
        );
        self.end_from_client(ctx, Some(ws::CloseCode::Size.into()), "message_too_large");
        false
    }

    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let relay = &self.state.config.relay;
        let client_timeout = relay.client_timeout();

        ctx.run_interval(relay.heartbeat_interval(), move |act, ctx| {
            if act.close_sent {
                return;
            }
            if Instant::now().duration_since(act.last_heartbeat) > client_timeout {
                warn!(pairing_id = %act.id, "Client heartbeat timed out");
                act.end_from_client(ctx, Some(ws::CloseCode::Away.into()), "heartbeat_timeout");
                return;
            }
            ctx.ping(b"");
        });

        if let Some(idle_timeout) = relay.idle_timeout() {
            let check_every = idle_timeout.min(Duration::from_secs(1));
            ctx.run_interval(check_every, move |act, ctx| {
                if act.close_sent {
                    return;
                }
                if Instant::now().duration_since(act.last_activity) >= idle_timeout {
                    info!(
                        pairing_id = %act.id,
                        idle_secs = idle_timeout.as_secs(),
                        "Pairing idle, closing"
                    );
                    act.end_from_client(ctx, Some(ws::CloseCode::Normal.into()), "idle_timeout");
                }
            });
        }
    }
}

impl Actor for RelaySocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        // The client handshake is already done when the actor starts.
        self.client_state.set(ConnectionState::Open);

        let upstream = &self.state.config.upstream;
        let connector = match OutboundConnector::new(upstream, upstream.handshake_policy()) {
            Ok(connector) => connector,
            Err(err) => {
                error!(pairing_id = %self.id, peer = %self.peer, error = %err, "Cannot build upstream connector");
                self.state.connector_failed();
                self.close_client(ctx, Some(ws::CloseCode::Error.into()));
                ctx.stop();
                return;
            }
        };

        debug!(pairing_id = %self.id, outbound_id = %connector.id(), "Dialing upstream");
        let (outbound, events) = connector.open();
        ctx.add_stream(UnboundedReceiverStream::new(events));

        let link = ClientLink {
            id: self.id,
            state: self.client_state.clone(),
            addr: ctx.address(),
        };
        self.pairing = Some(Pairing::bind(link, outbound));

        // Registered before anything can end the session, so shutdown always sees it.
        self.state.registry.register(self.id, ctx.address().recipient());
        self.state.pairing_opened();
        self.registration = Some(Registration {
            id: self.id,
            state: self.state.clone(),
        });

        self.start_heartbeat(ctx);
        debug!(pairing_id = %self.id, "Relay session started");
    }

    fn stopping(&mut self, _ctx: &mut Self::Context) -> Running {
        if let Some(pairing) = self.pairing.as_mut() {
            if !pairing.is_torn_down() {
                warn!(pairing_id = %self.id, "Session stopped outside a close path");
                pairing.teardown();
            }
        }
        Running::Stop
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.client_state.set(ConnectionState::Closed);
        drop(self.registration.take());
        info!(pairing_id = %self.id, peer = %self.peer, "Relay session stopped");
    }
}

/// Frames from the client.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RelaySocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        self.last_heartbeat = Instant::now();

        match msg {
            Ok(ws::Message::Text(text)) => self.forward_to_upstream(Frame::Text(text.to_string())),
            Ok(ws::Message::Binary(data)) => self.forward_to_upstream(Frame::Binary(data.to_vec())),
            Ok(ws::Message::Continuation(item)) => self.handle_continuation(ctx, item),
            Ok(ws::Message::Ping(data)) => ctx.pong(&data),
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                debug!(pairing_id = %self.id, ?reason, "Client sent close");
                self.end_from_client(ctx, reason, "client_close");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                warn!(pairing_id = %self.id, error = %err, "Client protocol error");
                self.end_from_client(ctx, Some(ws::CloseCode::Protocol.into()), "protocol_error");
            }
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        if !self.close_sent {
            // Transport gone: no close frame can reach the client any more.
            self.close_sent = true;
            self.end_from_client(ctx, None, "client_stream_ended");
        }
        if self.pairing.is_none() {
            ctx.stop();
        }
    }
}

/// Events from the upstream leg.
impl StreamHandler<ConnectionEvent> for RelaySocket {
    fn handle(&mut self, event: ConnectionEvent, _ctx: &mut Self::Context) {
        match event {
            ConnectionEvent::Open => {
                self.upstream_opened = true;
                info!(pairing_id = %self.id, "Upstream leg open");
            }
            ConnectionEvent::Message(frame) => {
                self.last_activity = Instant::now();
                if let Some(pairing) = self.pairing.as_mut() {
                    let outcome = pairing.forward_to_inbound(frame);
                    self.state.record_forward(Direction::ToInbound, outcome);
                }
            }
            ConnectionEvent::Error(err) => {
                self.upstream_failed = true;
                if !self.upstream_opened {
                    self.state.connector_failed();
                }
                error!(pairing_id = %self.id, error = %err, "Upstream leg failed");
            }
            ConnectionEvent::Closed => {
                info!(pairing_id = %self.id, "Upstream leg closed");
                if let Some(pairing) = self.pairing.as_mut() {
                    pairing.outbound_closed();
                }
            }
            ConnectionEvent::Reconnecting { attempt, delay } => {
                debug!(pairing_id = %self.id, attempt, delay_ms = delay.as_millis() as u64, "Upstream reconnecting");
            }
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        // Upstream frames handled above may still sit in the mailbox as `Deliver`.
        ctx.address().do_send(UpstreamFinished);
    }
}

impl Handler<UpstreamFinished> for RelaySocket {
    type Result = ();

    fn handle(&mut self, _msg: UpstreamFinished, ctx: &mut Self::Context) {
        // The upstream task is done, so the upstream leg is CLOSED.
        if let Some(pairing) = self.pairing.as_mut() {
            pairing.outbound_closed();
        }
        let reason = self.upstream_close_reason();
        self.close_client(ctx, Some(reason));
        ctx.stop();
    }
}

impl Handler<Deliver> for RelaySocket {
    type Result = ();

    fn handle(&mut self, msg: Deliver, ctx: &mut Self::Context) {
        if self.close_sent {
            dropped_while_closing(self.id, &msg.0);
            return;
        }
        match msg.0 {
            Frame::Text(text) => ctx.text(text),
            Frame::Binary(data) => ctx.binary(data),
        }
    }
}

impl Handler<CloseClient> for RelaySocket {
    type Result = ();

    fn handle(&mut self, _msg: CloseClient, ctx: &mut Self::Context) {
        let reason = self.upstream_close_reason();
        self.close_client(ctx, Some(reason));
    }
}

impl Handler<Shutdown> for RelaySocket {
    type Result = ();

    fn handle(&mut self, _msg: Shutdown, ctx: &mut Self::Context) {
        info!(pairing_id = %self.id, "Server shutting down, closing pairing");
        self.close_client(ctx, Some(ws::CloseCode::Away.into()));
        if let Some(pairing) = self.pairing.as_mut() {
            pairing.teardown();
        }
    }
}

/// An upstream frame reached the session after the client close was sent.
fn dropped_while_closing(pairing_id: ConnectionId, frame: &Frame) {
    warn!(
        pairing_id = %pairing_id,
        kind = frame.kind(),
        bytes = frame.byte_len(),
        "Client closing, frame dropped"
    );
}
