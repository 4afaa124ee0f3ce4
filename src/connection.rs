//! # Connections
//!
//! The abstract bidirectional message channel both legs of a Pairing are built on.
//!
//! ## Lifecycle:
//! ```text
//! CONNECTING ──► OPEN ──► CLOSING ──► CLOSED
//!      └────────────────────┘
//! ```
//! A connection may go straight from CONNECTING to CLOSING when it is closed
//! before its handshake completes. CLOSED is terminal.
//!
//! ## Payloads:
//! Frames are opaque. Text stays text and binary stays binary; control frames
//! (ping, pong, close) belong to the transport and are never forwarded.

use crate::error::RelayError;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

/// Ephemeral identity of one connection.
pub type ConnectionId = Uuid;

/// One data message, forwarded verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    /// Payload size in bytes.
    pub fn byte_len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(data) => data.len(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Text(_) => "text",
            Frame::Binary(_) => "binary",
        }
    }

    /// Extract the data frame from a transport message. Control frames yield `None`.
    pub fn from_message(message: Message) -> Option<Frame> {
        match message {
            Message::Text(text) => Some(Frame::Text(text)),
            Message::Binary(data) => Some(Frame::Binary(data)),
            Message::Ping(_) | Message::Pong(_) | Message::Close(_) | Message::Frame(_) => None,
        }
    }
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(data) => Message::Binary(data),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Open,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared, lock-free lifecycle state.
///
/// ## Thread Safety:
/// The owning task and every handle read and write the same atomic, so a handle
/// always observes the state the transport last reported.
#[derive(Debug, Clone)]
pub struct StateCell(Arc<AtomicU8>);

impl StateCell {
    pub fn new(initial: ConnectionState) -> Self {
        Self(Arc::new(AtomicU8::new(initial as u8)))
    }

    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub fn set(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.get() == ConnectionState::Open
    }

    /// CONNECTING → OPEN. Fails when a close was requested during the handshake.
    pub fn mark_open(&self) -> bool {
        self.transition(ConnectionState::Connecting, ConnectionState::Open)
    }

    /// Move to CLOSING from CONNECTING or OPEN.
    ///
    /// Returns `true` only for the caller that performed the transition, which
    /// makes every `close()` built on it idempotent.
    pub fn begin_close(&self) -> bool {
        self.transition(ConnectionState::Open, ConnectionState::Closing)
            || self.transition(ConnectionState::Connecting, ConnectionState::Closing)
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// A message channel that can take part in a Pairing.
pub trait Connection {
    fn id(&self) -> ConnectionId;

    fn state(&self) -> ConnectionState;

    /// Hand a frame to the transport. Not OPEN means the frame is dropped with a warning.
    fn send(&self, frame: Frame) -> Result<(), RelayError>;

    /// Idempotent; no effect once CLOSED.
    fn close(&self);

    fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }
}

/// Lifecycle events emitted by socket-backed connections.
///
/// `Error` is always followed by `Closed`. Only a reconnecting client emits
/// anything after `Closed`, and then it starts with `Reconnecting`.
#[derive(Debug)]
pub enum ConnectionEvent {
    Open,
    Message(Frame),
    Error(RelayError),
    Closed,
    /// Only emitted by connections with a reconnect policy.
    Reconnecting { attempt: u32, delay: Duration },
}

/// Requests from a handle to the task that owns the socket.
#[derive(Debug)]
pub(crate) enum Command {
    Send(Frame),
    Close,
}
