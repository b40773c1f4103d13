use crate::wire::{Message, WireError};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

/// Key identifying a reply we are waiting for
///
/// Request/response pairs on the overlay are correlated by the random
/// identifier the requester chose, scoped by message kind (and circuit
/// ID where one exists on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PendingKey {
    /// IntroductionResponse carrying this identifier
    IntroResponse(u16),
    /// Puncture probe carrying this identifier
    Puncture(u16),
    /// Created for this (circuit, identifier) pair
    Created(u32, u16),
}

/// Inbound traffic that is not a reply to anything we sent
#[derive(Debug)]
pub enum Event {
    /// A decoded message for the node to handle
    Message { from: SocketAddr, message: Message },
}

/// Routes decoded inbound frames either to a waiting requester or to
/// the node's event loop.
///
/// Malformed frames and unknown discriminators are logged and dropped;
/// a bad datagram from one peer never takes the node down.
pub struct Dispatcher {
    pending: Mutex<HashMap<PendingKey, oneshot::Sender<(SocketAddr, Message)>>>,
    events: mpsc::UnboundedSender<Event>,
}

impl Dispatcher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (events, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                pending: Mutex::new(HashMap::new()),
                events,
            },
            event_rx,
        )
    }

    /// Register interest in a reply. The returned receiver resolves
    /// when a matching message arrives; the caller owns the timeout.
    pub fn expect(&self, key: PendingKey) -> oneshot::Receiver<(SocketAddr, Message)> {
        let (tx, rx) = oneshot::channel();
        let previous = self
            .pending
            .lock()
            .expect("pending map lock poisoned")
            .insert(key, tx);
        if previous.is_some() {
            // Identifier collision; the earlier waiter times out.
            debug!(?key, "replaced pending reply registration");
        }
        rx
    }

    /// Drop a registration, typically after the caller timed out
    pub fn cancel(&self, key: PendingKey) {
        self.pending
            .lock()
            .expect("pending map lock poisoned")
            .remove(&key);
    }

    fn fulfill(&self, key: PendingKey, from: SocketAddr, message: Message) -> Option<Message> {
        let waiter = self
            .pending
            .lock()
            .expect("pending map lock poisoned")
            .remove(&key);

        match waiter {
            Some(tx) => {
                // Receiver dropped means the requester gave up; fine.
                let _ = tx.send((from, message));
                None
            }
            None => Some(message),
        }
    }

    /// Decode one received frame and route it
    pub fn handle_frame(&self, from: SocketAddr, frame: &[u8]) {
        let message = match Message::decode(frame) {
            Ok(message) => message,
            Err(WireError::UnknownKind(kind)) => {
                trace!(%from, kind, "ignoring unknown message kind");
                return;
            }
            Err(err) => {
                warn!(%from, error = %err, "dropping malformed frame");
                return;
            }
        };

        let unclaimed = match message {
            Message::IntroductionResponse(ref m) => {
                self.fulfill(PendingKey::IntroResponse(m.identifier), from, message)
            }
            Message::Puncture(ref m) => {
                self.fulfill(PendingKey::Puncture(m.identifier), from, message)
            }
            Message::Created(ref m) => self.fulfill(
                PendingKey::Created(m.circuit_id, m.identifier),
                from,
                message,
            ),
            other => Some(other),
        };

        if let Some(message) = unclaimed {
            if self.events.send(Event::Message { from, message }).is_err() {
                debug!("event channel closed, dropping message");
            }
        }
    }
}

/// Routes onion cells for circuits we originated
///
/// Keyed by circuit ID; during construction the builder consumes raw
/// cells, afterwards the circuit's demux task takes over the same
/// channel.
#[derive(Default)]
pub struct CircuitRouter {
    routes: Mutex<HashMap<u32, mpsc::UnboundedSender<Vec<u8>>>>,
}

impl CircuitRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, circuit_id: u32) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes
            .lock()
            .expect("circuit routes lock poisoned")
            .insert(circuit_id, tx);
        rx
    }

    pub fn unregister(&self, circuit_id: u32) {
        self.routes
            .lock()
            .expect("circuit routes lock poisoned")
            .remove(&circuit_id);
    }

    /// Deliver an inbound onion payload. Returns false when the
    /// circuit is not ours, so the caller can try the relay table.
    pub fn route(&self, circuit_id: u32, payload: Vec<u8>) -> bool {
        let routes = self.routes.lock().expect("circuit routes lock poisoned");
        match routes.get(&circuit_id) {
            Some(tx) => tx.send(payload).is_ok(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn from_addr() -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 7748))
    }

    #[tokio::test]
    async fn test_pending_reply_is_fulfilled() {
        let (dispatcher, mut events) = Dispatcher::new();
        let rx = dispatcher.expect(PendingKey::Created(42, 7));

        let created = Message::Created(wire::Created {
            circuit_id: 42,
            identifier: 7,
            ephemeral_key: vec![1; 32],
            auth: vec![2; 32],
            candidates: vec![],
        });
        dispatcher.handle_frame(from_addr(), &created.encode());

        let (from, message) = rx.await.unwrap();
        assert_eq!(from, from_addr());
        assert!(matches!(message, Message::Created(_)));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unclaimed_message_becomes_event() {
        let (dispatcher, mut events) = Dispatcher::new();

        let ping = Message::Ping(wire::Ping {
            circuit_id: 9,
            identifier: 1,
        });
        dispatcher.handle_frame(from_addr(), &ping.encode());

        let Some(Event::Message { message, .. }) = events.recv().await else {
            panic!("expected event");
        };
        assert!(matches!(message, Message::Ping(_)));
    }

    #[tokio::test]
    async fn test_mismatched_identifier_not_claimed() {
        let (dispatcher, mut events) = Dispatcher::new();
        let rx = dispatcher.expect(PendingKey::Created(42, 7));

        let created = Message::Created(wire::Created {
            circuit_id: 42,
            identifier: 8,
            ephemeral_key: vec![],
            auth: vec![],
            candidates: vec![],
        });
        dispatcher.handle_frame(from_addr(), &created.encode());

        assert!(events.recv().await.is_some());
        dispatcher.cancel(PendingKey::Created(42, 7));
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_malformed_frame_dropped_without_panic() {
        let (dispatcher, mut events) = Dispatcher::new();

        dispatcher.handle_frame(from_addr(), &[]);
        dispatcher.handle_frame(from_addr(), &[0xEE, 1, 2, 3]);
        dispatcher.handle_frame(from_addr(), &[2, 0, 0]);

        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_circuit_router_registration() {
        let router = CircuitRouter::new();
        let mut rx = router.register(11);

        assert!(router.route(11, vec![0xAA]));
        assert!(!router.route(99, vec![0xBB]));
        assert_eq!(rx.recv().await.unwrap(), vec![0xAA]);

        router.unregister(11);
        assert!(!router.route(11, vec![0xCC]));
    }
}
