use crate::bandwidth::ContributionTracker;
use crate::circuit::{
    CellCommand, CircuitId, CircuitManager, CircuitPool, SessionCell, SessionOutcome,
    MAX_CELL_PAYLOAD,
};
use crate::transport::Transport;
use crate::wire::{self, Message};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use swarmveil_common::{Result, TunnelError};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, trace};

/// What the exit told us about one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    ConnectOk,
    ConnectFail,
    Data(Vec<u8>),
    End,
}

/// Fans inbound session cells out to their streams
///
/// The per-circuit demux task peels cells and hands them here; each
/// live [`TunnelStream`] owns the receiving end of its entry.
#[derive(Default)]
pub struct SessionRouter {
    routes: std::sync::Mutex<HashMap<(u32, u16), mpsc::UnboundedSender<SessionEvent>>>,
}

impl SessionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, circuit: CircuitId, session: u16) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes
            .lock()
            .expect("session routes lock poisoned")
            .insert((circuit.as_u32(), session), tx);
        rx
    }

    pub fn in_use(&self, circuit: CircuitId, session: u16) -> bool {
        self.routes
            .lock()
            .expect("session routes lock poisoned")
            .contains_key(&(circuit.as_u32(), session))
    }

    pub fn unregister(&self, circuit: CircuitId, session: u16) {
        self.routes
            .lock()
            .expect("session routes lock poisoned")
            .remove(&(circuit.as_u32(), session));
    }

    /// Drop every session riding a circuit, e.g. when it is evicted
    pub fn drop_circuit(&self, circuit: CircuitId) {
        let mut routes = self.routes.lock().expect("session routes lock poisoned");
        routes.retain(|&(cid, _), tx| {
            if cid == circuit.as_u32() {
                let _ = tx.send(SessionEvent::End);
                false
            } else {
                true
            }
        });
    }

    /// Deliver one decoded session cell
    pub fn deliver(&self, circuit: CircuitId, cell: SessionCell) {
        let event = match cell.command {
            CellCommand::ConnectOk => SessionEvent::ConnectOk,
            CellCommand::ConnectFail => SessionEvent::ConnectFail,
            CellCommand::Data => SessionEvent::Data(cell.payload),
            CellCommand::End => SessionEvent::End,
            CellCommand::Connect => {
                trace!(circuit = circuit.as_u32(), "exit-bound connect at origin, dropping");
                return;
            }
        };

        let routes = self.routes.lock().expect("session routes lock poisoned");
        if let Some(tx) = routes.get(&(circuit.as_u32(), cell.session)) {
            let _ = tx.send(event);
        }
    }
}

/// A leased end-to-end session through a circuit
///
/// Reads and writes travel the full onion path; the remote endpoint
/// only ever sees the exit relay's address.
pub struct TunnelStream {
    circuit: CircuitId,
    session: u16,
    manager: Arc<RwLock<CircuitManager>>,
    transport: Transport,
    pool: Arc<CircuitPool>,
    sessions: Arc<SessionRouter>,
    contribution: Arc<ContributionTracker>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    remote_closed: bool,
}

impl TunnelStream {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        circuit: CircuitId,
        session: u16,
        manager: Arc<RwLock<CircuitManager>>,
        transport: Transport,
        pool: Arc<CircuitPool>,
        sessions: Arc<SessionRouter>,
        contribution: Arc<ContributionTracker>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
    ) -> Self {
        Self {
            circuit,
            session,
            manager,
            transport,
            pool,
            sessions,
            contribution,
            events,
            remote_closed: false,
        }
    }

    pub fn circuit_id(&self) -> CircuitId {
        self.circuit
    }

    /// Send bytes through the tunnel, chunked into session cells
    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        for chunk in data.chunks(MAX_CELL_PAYLOAD) {
            let cell = SessionCell::new(self.session, CellCommand::Data, chunk.to_vec());
            self.send_cell(&cell).await?;
        }
        self.contribution.record_consumed(data.len() as u64);
        Ok(())
    }

    /// Receive the next chunk. `None` means the remote side finished.
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        if self.remote_closed {
            return Ok(None);
        }
        loop {
            match self.events.recv().await {
                Some(SessionEvent::Data(data)) => {
                    self.contribution.record_consumed(data.len() as u64);
                    return Ok(Some(data));
                }
                Some(SessionEvent::End) | None => {
                    self.remote_closed = true;
                    return Ok(None);
                }
                Some(SessionEvent::ConnectOk) | Some(SessionEvent::ConnectFail) => {
                    // Handshake leftovers, not data.
                    continue;
                }
            }
        }
    }

    /// Close cleanly: tell the exit, release the lease
    pub async fn close(mut self) {
        let end = SessionCell::new(self.session, CellCommand::End, vec![]);
        // Best effort; the exit also reaps on circuit teardown.
        let _ = self.send_cell(&end).await;
        self.sessions.unregister(self.circuit, self.session);
        self.pool.release(self.circuit, SessionOutcome::Success).await;
        debug!(circuit = %self.circuit, session = self.session, "session closed");
    }

    /// Tear down after a failure. The circuit is reported broken and
    /// will be evicted.
    pub async fn abort(self) {
        self.sessions.unregister(self.circuit, self.session);
        self.pool.release(self.circuit, SessionOutcome::Failure).await;
        debug!(circuit = %self.circuit, session = self.session, "session aborted");
    }

    pub(crate) async fn send_cell(&mut self, cell: &SessionCell) -> Result<()> {
        let inner = Message::Data(wire::Data {
            circuit_id: self.circuit.as_u32(),
            payload: cell.encode(),
        });
        let (entry, sealed) = self
            .manager
            .write()
            .await
            .seal_outbound(self.circuit, &inner)?;
        self.transport
            .send_message(SocketAddr::V4(entry), &sealed)
            .await
            .map_err(TunnelError::from)
    }

    pub(crate) async fn await_connect_reply(
        &mut self,
        window: std::time::Duration,
    ) -> Result<()> {
        match tokio::time::timeout(window, self.events.recv()).await {
            Ok(Some(SessionEvent::ConnectOk)) => Ok(()),
            Ok(Some(SessionEvent::ConnectFail)) => Err(TunnelError::establishment(
                "exit could not reach destination",
            )),
            Ok(_) => Err(TunnelError::establishment("session ended during connect")),
            Err(_) => Err(TunnelError::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_router_delivers_to_registered_session() {
        let router = SessionRouter::new();
        let circuit = CircuitId::generate();
        let mut rx = router.register(circuit, 7);

        router.deliver(circuit, SessionCell::new(7, CellCommand::ConnectOk, vec![]));
        router.deliver(circuit, SessionCell::new(7, CellCommand::Data, b"abc".to_vec()));
        // Wrong session is ignored.
        router.deliver(circuit, SessionCell::new(8, CellCommand::Data, b"zzz".to_vec()));

        assert_eq!(rx.try_recv().unwrap(), SessionEvent::ConnectOk);
        assert_eq!(rx.try_recv().unwrap(), SessionEvent::Data(b"abc".to_vec()));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_drop_circuit_ends_all_its_sessions() {
        let router = SessionRouter::new();
        let doomed = CircuitId::generate();
        let survivor = CircuitId::generate();
        let mut doomed_rx = router.register(doomed, 1);
        let mut survivor_rx = router.register(survivor, 1);

        router.drop_circuit(doomed);

        assert_eq!(doomed_rx.try_recv().unwrap(), SessionEvent::End);
        router.deliver(survivor, SessionCell::new(1, CellCommand::Data, b"ok".to_vec()));
        assert_eq!(survivor_rx.try_recv().unwrap(), SessionEvent::Data(b"ok".to_vec()));
    }
}
