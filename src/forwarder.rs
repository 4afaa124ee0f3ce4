//! # Frame Forwarder
//!
//! Binds one inbound and one outbound [`Connection`] into a [`Pairing`] and moves
//! frames between them untouched.
//!
//! ## Delivery policy:
//! - A frame is forwarded only while the target leg is OPEN
//! - Otherwise it is dropped with a warning; there is no buffer and no retry, so
//!   delivery is at-most-once
//! - A send that fails on an OPEN leg is also dropped; the leg's own close event,
//!   not the forwarder, decides whether the Pairing ends
//!
//! ## Lifecycle coupling:
//! Every close path funnels into [`Pairing::teardown`], which closes whichever
//! side is still open. Teardown runs at most once per Pairing.
//!
//! ## Ordering:
//! Frames in one direction leave in the order they arrived. The two directions
//! are independent streams with no ordering between them.

use crate::connection::{Connection, ConnectionId, Frame};
use tracing::{debug, info, warn};

/// Direction of travel through a Pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client → upstream
    ToOutbound,
    /// Upstream → client
    ToInbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ToOutbound => "client_to_upstream",
            Direction::ToInbound => "upstream_to_client",
        }
    }
}

/// Outcome of one forwarding attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forwarded {
    Delivered,
    Dropped,
}

/// One client session: exactly one inbound and one outbound connection.
pub struct Pairing<I: Connection, O: Connection> {
    inbound: I,
    outbound: O,
    torn_down: bool,
}

impl<I: Connection, O: Connection> Pairing<I, O> {
    /// Bind two connections together. Neither is shared with any other Pairing.
    pub fn bind(inbound: I, outbound: O) -> Self {
        debug!(
            pairing_id = %inbound.id(),
            outbound_id = %outbound.id(),
            "Pairing bound"
        );
        Self {
            inbound,
            outbound,
            torn_down: false,
        }
    }

    /// The Pairing is identified by its inbound connection.
    pub fn id(&self) -> ConnectionId {
        self.inbound.id()
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// A frame arrived from the client.
    pub fn forward_to_outbound(&mut self, frame: Frame) -> Forwarded {
        let id = self.id();
        deliver(id, &self.outbound, frame, Direction::ToOutbound)
    }

    /// A frame arrived from the upstream endpoint.
    pub fn forward_to_inbound(&mut self, frame: Frame) -> Forwarded {
        let id = self.id();
        deliver(id, &self.inbound, frame, Direction::ToInbound)
    }

    /// The client side closed or errored.
    pub fn inbound_closed(&mut self) -> bool {
        self.teardown()
    }

    /// The upstream side closed or errored.
    pub fn outbound_closed(&mut self) -> bool {
        self.teardown()
    }

    /// Close both sides if still open. Returns `true` the first time only.
    pub fn teardown(&mut self) -> bool {
        if self.torn_down {
            return false;
        }
        self.torn_down = true;

        info!(
            pairing_id = %self.id(),
            inbound_state = %self.inbound.state(),
            outbound_state = %self.outbound.state(),
            "Tearing down pairing"
        );

        self.outbound.close();
        self.inbound.close();
        true
    }
}

fn deliver<C: Connection>(
    pairing_id: ConnectionId,
    target: &C,
    frame: Frame,
    direction: Direction,
) -> Forwarded {
    if !target.is_open() {
        warn!(
            pairing_id = %pairing_id,
            direction = direction.as_str(),
            target_state = %target.state(),
            kind = frame.kind(),
            bytes = frame.byte_len(),
            "Dropping frame, target leg is not open"
        );
        return Forwarded::Dropped;
    }

    let bytes = frame.byte_len();
    let kind = frame.kind();
    match target.send(frame) {
        Ok(()) => {
            debug!(
                pairing_id = %pairing_id,
                direction = direction.as_str(),
                kind,
                bytes,
                "Forwarded frame"
            );
            Forwarded::Delivered
        }
        Err(err) => {
            warn!(
                pairing_id = %pairing_id,
                direction = direction.as_str(),
                kind,
                bytes,
                error = %err,
                "Dropping frame after failed send"
            );
            Forwarded::Dropped
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionState, StateCell};
    use crate::error::RelayError;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;
    use uuid::Uuid;

    /// In-memory connection that records what it was asked to do.
    #[derive(Clone)]
    struct RecordingConnection {
        id: Uuid,
        state: StateCell,
        sent: Rc<RefCell<Vec<Frame>>>,
        close_calls: Rc<Cell<u32>>,
        fail_sends: Rc<Cell<bool>>,
    }

    impl RecordingConnection {
        fn open() -> Self {
            Self {
                id: Uuid::new_v4(),
                state: StateCell::new(ConnectionState::Open),
                sent: Rc::new(RefCell::new(Vec::new())),
                close_calls: Rc::new(Cell::new(0)),
                fail_sends: Rc::new(Cell::new(false)),
            }
        }

        fn connecting() -> Self {
            let connection = Self::open();
            connection.state.set(ConnectionState::Connecting);
            connection
        }

        fn sent(&self) -> Vec<Frame> {
            self.sent.borrow().clone()
        }
    }

    impl Connection for RecordingConnection {
        fn id(&self) -> Uuid {
            self.id
        }

        fn state(&self) -> ConnectionState {
            self.state.get()
        }

        fn send(&self, frame: Frame) -> Result<(), RelayError> {
            if self.fail_sends.get() {
                return Err(RelayError::Forward("broken pipe".to_string()));
            }
            self.sent.borrow_mut().push(frame);
            Ok(())
        }

        fn close(&self) {
            self.close_calls.set(self.close_calls.get() + 1);
            if self.state.begin_close() {
                self.state.set(ConnectionState::Closed);
            }
        }
    }

    fn text(s: &str) -> Frame {
        Frame::Text(s.to_string())
    }

    #[test]
    fn test_client_frame_reaches_upstream_verbatim() {
        let inbound = RecordingConnection::open();
        let outbound = RecordingConnection::open();
        let mut pairing = Pairing::bind(inbound.clone(), outbound.clone());

        let audio = Frame::Binary(vec![0x00, 0xff, 0x7f, 0x80]);
        assert_eq!(pairing.forward_to_outbound(text("ping")), Forwarded::Delivered);
        assert_eq!(pairing.forward_to_outbound(audio.clone()), Forwarded::Delivered);

        assert_eq!(outbound.sent(), vec![text("ping"), audio]);
        assert!(inbound.sent().is_empty());
    }

    #[test]
    fn test_upstream_frames_keep_order() {
        let inbound = RecordingConnection::open();
        let outbound = RecordingConnection::open();
        let mut pairing = Pairing::bind(inbound.clone(), outbound.clone());

        for payload in ["A", "B", "C"] {
            pairing.forward_to_inbound(text(payload));
        }

        assert_eq!(inbound.sent(), vec![text("A"), text("B"), text("C")]);
    }

    #[test]
    fn test_frames_dropped_while_upstream_connecting() {
        let inbound = RecordingConnection::open();
        let outbound = RecordingConnection::connecting();
        let mut pairing = Pairing::bind(inbound, outbound.clone());

        assert_eq!(pairing.forward_to_outbound(text("early")), Forwarded::Dropped);
        assert!(outbound.sent().is_empty());

        // Nothing was buffered: the frame does not appear once the leg opens.
        outbound.state.set(ConnectionState::Open);
        assert_eq!(pairing.forward_to_outbound(text("late")), Forwarded::Delivered);
        assert_eq!(outbound.sent(), vec![text("late")]);
    }

    #[test]
    fn test_frames_dropped_when_client_closing() {
        let inbound = RecordingConnection::open();
        inbound.state.set(ConnectionState::Closing);
        let outbound = RecordingConnection::open();
        let mut pairing = Pairing::bind(inbound.clone(), outbound);

        assert_eq!(pairing.forward_to_inbound(text("late")), Forwarded::Dropped);
        assert!(inbound.sent().is_empty());
    }

    #[test]
    fn test_failed_send_does_not_close_either_side() {
        let inbound = RecordingConnection::open();
        let outbound = RecordingConnection::open();
        outbound.fail_sends.set(true);
        let mut pairing = Pairing::bind(inbound.clone(), outbound.clone());

        assert_eq!(pairing.forward_to_outbound(text("lost")), Forwarded::Dropped);
        assert_eq!(outbound.close_calls.get(), 0);
        assert_eq!(inbound.close_calls.get(), 0);
        assert!(!pairing.is_torn_down());
    }

    #[test]
    fn test_client_close_closes_upstream() {
        let inbound = RecordingConnection::open();
        let outbound = RecordingConnection::open();
        let mut pairing = Pairing::bind(inbound.clone(), outbound.clone());

        inbound.close();
        assert!(pairing.inbound_closed());

        assert_eq!(outbound.state(), ConnectionState::Closed);
        assert_eq!(inbound.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_upstream_close_closes_client() {
        let inbound = RecordingConnection::open();
        let outbound = RecordingConnection::open();
        let mut pairing = Pairing::bind(inbound.clone(), outbound.clone());

        outbound.state.set(ConnectionState::Closed);
        assert!(pairing.outbound_closed());

        assert_eq!(inbound.state(), ConnectionState::Closed);
        assert_eq!(inbound.close_calls.get(), 1);
    }

    #[test]
    fn test_teardown_is_idempotent() {
        let inbound = RecordingConnection::open();
        let outbound = RecordingConnection::open();
        let mut pairing = Pairing::bind(inbound.clone(), outbound.clone());

        assert!(pairing.teardown());
        assert!(!pairing.teardown());
        assert!(!pairing.outbound_closed());

        assert_eq!(outbound.close_calls.get(), 1);
        assert_eq!(inbound.close_calls.get(), 1);
    }

    #[test]
    fn test_pairings_are_independent() {
        let a_in = RecordingConnection::open();
        let a_out = RecordingConnection::open();
        let b_in = RecordingConnection::open();
        let b_out = RecordingConnection::open();
        let mut a = Pairing::bind(a_in.clone(), a_out.clone());
        let mut b = Pairing::bind(b_in.clone(), b_out.clone());

        a.forward_to_outbound(text("from-a"));
        a.teardown();
        b.forward_to_outbound(text("from-b"));

        assert_eq!(a_out.sent(), vec![text("from-a")]);
        assert_eq!(b_out.sent(), vec![text("from-b")]);
        assert!(b_in.is_open());
        assert!(b_out.is_open());
    }
}
