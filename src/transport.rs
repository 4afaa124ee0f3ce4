//! # Task-Owned WebSocket Connections
//!
//! Each socket-backed connection is owned by one spawned task. Everyone else
//! talks to it through a cheap [`SocketHandle`]:
//!
//! ```text
//!  SocketHandle ──Command──►  task  ──ConnectionEvent──► owner
//!        └──── StateCell ◄──────┘
//! ```
//!
//! The task is the only writer to the socket, so frames leave in the order the
//! handle queued them. Dropping every handle closes the connection.

use crate::connection::{
    Command, Connection, ConnectionEvent, ConnectionId, ConnectionState, Frame, StateCell,
};
use crate::error::RelayError;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

/// Handle to a connection owned by a background task.
#[derive(Debug, Clone)]
pub struct SocketHandle {
    id: ConnectionId,
    label: &'static str,
    state: StateCell,
    commands: UnboundedSender<Command>,
}

impl SocketHandle {
    pub(crate) fn new(
        id: ConnectionId,
        label: &'static str,
        state: StateCell,
        commands: UnboundedSender<Command>,
    ) -> Self {
        Self {
            id,
            label,
            state,
            commands,
        }
    }
}

impl Connection for SocketHandle {
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
                connection_id = %self.id,
                leg = self.label,
                state = %state,
                bytes = frame.byte_len(),
                "Connection not open, frame dropped"
            );
            return Ok(());
        }

        self.commands
            .send(Command::Send(frame))
            .map_err(|_| RelayError::Forward(format!("{} task has exited", self.label)))
    }

    fn close(&self) {
        if self.state.begin_close() && self.commands.send(Command::Close).is_err() {
            self.state.set(ConnectionState::Closed);
        }
    }
}

/// Why [`pump`] returned.
#[derive(Debug)]
pub(crate) enum PumpExit {
    /// Close requested through the handle (or every handle dropped)
    LocalClose,
    /// Peer sent a close frame
    RemoteClose,
    /// Transport failed or ended without a close handshake
    Dropped(RelayError),
}

/// Emit an event; a missing listener is not an error for the task.
pub(crate) fn emit(events: &UnboundedSender<ConnectionEvent>, event: ConnectionEvent) -> bool {
    events.send(event).is_ok()
}

/// Wait until a close is requested or every handle is gone.
pub(crate) async fn wait_for_close(commands: &mut UnboundedReceiver<Command>) {
    while let Some(command) = commands.recv().await {
        if let Command::Close = command {
            return;
        }
    }
}

/// Move frames between an open socket, its handle, and its event listener.
///
/// Returns once the connection is finished. The caller owns the final state
/// transition and the closing events.
pub(crate) async fn pump<S>(
    stream: WebSocketStream<S>,
    id: ConnectionId,
    state: &StateCell,
    commands: &mut UnboundedReceiver<Command>,
    events: &UnboundedSender<ConnectionEvent>,
    close_timeout: Duration,
) -> PumpExit
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut source) = stream.split();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Send(frame)) => {
                    let bytes = frame.byte_len();
                    if let Err(err) = sink.send(Message::from(frame)).await {
                        warn!(connection_id = %id, bytes, error = %err, "Send failed, frame dropped");
                    }
                }
                Some(Command::Close) | None => {
                    state.set(ConnectionState::Closing);
                    close_locally(id, &mut sink, &mut source, close_timeout).await;
                    return PumpExit::LocalClose;
                }
            },
            incoming = source.next() => match incoming {
                Some(Ok(Message::Close(close_frame))) => {
                    state.set(ConnectionState::Closing);
                    debug!(connection_id = %id, ?close_frame, "Peer closed the connection");
                    // Flushes the close reply tungstenite queued on receipt.
                    if let Err(err) = sink.close().await {
                        debug!(connection_id = %id, error = %err, "Close reply not flushed");
                    }
                    return PumpExit::RemoteClose;
                }
                Some(Ok(message)) => {
                    if let Some(frame) = Frame::from_message(message) {
                        if !emit(events, ConnectionEvent::Message(frame)) {
                            debug!(connection_id = %id, "Event listener gone, closing");
                            state.set(ConnectionState::Closing);
                            close_locally(id, &mut sink, &mut source, close_timeout).await;
                            return PumpExit::LocalClose;
                        }
                    }
                }
                Some(Err(err)) => return PumpExit::Dropped(err.into()),
                None => {
                    return PumpExit::Dropped(RelayError::OutboundConnect(
                        "connection ended without a close frame".to_string(),
                    ));
                }
            }
        }
    }
}

/// Send a close frame and wait, bounded, for the peer's reply.
async fn close_locally<S>(
    id: ConnectionId,
    sink: &mut SplitSink<WebSocketStream<S>, Message>,
    source: &mut SplitStream<WebSocketStream<S>>,
    close_timeout: Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Err(err) = sink.send(Message::Close(None)).await {
        debug!(connection_id = %id, error = %err, "Close frame not sent");
        return;
    }

    let drained = tokio::time::timeout(close_timeout, async {
        while let Some(Ok(message)) = source.next().await {
            if message.is_close() {
                break;
            }
        }
    })
    .await;

    if drained.is_err() {
        warn!(
            connection_id = %id,
            timeout_ms = close_timeout.as_millis() as u64,
            "Peer did not answer close in time"
        );
    }
}
