use super::session::{SessionRouter, TunnelStream};
use crate::bandwidth::ContributionTracker;
use crate::circuit::{CircuitId, CircuitManager, CircuitPool, SessionCell};
use crate::transport::Transport;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use swarmveil_common::{Result, TunnelError};
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Connection attempts before giving up on the overlay
const MAX_CONNECT_ATTEMPTS: u32 = 3;

/// Backoff base; doubles per attempt
const BACKOFF_BASE_MS: u64 = 1000;

/// Random jitter added to each backoff
const BACKOFF_JITTER_MS: u64 = 500;

/// Window for the exit to report its TCP connect result
const CONNECT_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Invoked right before a connection is downgraded to plain TCP, so
/// the caller always knows when traffic will leave the overlay.
pub type DowngradeNotice = Box<dyn Fn(SocketAddrV4) + Send + Sync>;

/// A connection handed to the data plane: tunnelled when the overlay
/// could serve it, direct only after an informed downgrade
pub enum TunnelSocket {
    /// Onion-routed through a circuit
    Circuit(TunnelStream),
    /// Plain TCP; only exists when fallback was allowed and announced
    Direct(TcpStream),
}

impl TunnelSocket {
    pub fn is_anonymous(&self) -> bool {
        matches!(self, Self::Circuit(_))
    }

    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Self::Circuit(stream) => stream.send(data).await,
            Self::Direct(stream) => {
                use tokio::io::AsyncWriteExt;
                stream.write_all(data).await.map_err(TunnelError::from)
            }
        }
    }

    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        match self {
            Self::Circuit(stream) => stream.recv().await,
            Self::Direct(stream) => {
                use tokio::io::AsyncReadExt;
                let mut buf = vec![0u8; 16 * 1024];
                match stream.read(&mut buf).await? {
                    0 => Ok(None),
                    len => {
                        buf.truncate(len);
                        Ok(Some(buf))
                    }
                }
            }
        }
    }

    pub async fn close(self) {
        match self {
            Self::Circuit(stream) => stream.close().await,
            Self::Direct(mut stream) => {
                use tokio::io::AsyncWriteExt;
                let _ = stream.shutdown().await;
            }
        }
    }
}

/// Opens destination connections through the circuit pool
///
/// Retries with exponential backoff and jitter over fresh circuits;
/// after the attempt budget it either downgrades to plain TCP (when
/// allowed, after notifying) or fails with a retryable error.
pub struct SocketConnector {
    pool: Arc<CircuitPool>,
    manager: Arc<RwLock<CircuitManager>>,
    transport: Transport,
    sessions: Arc<SessionRouter>,
    contribution: Arc<ContributionTracker>,
    next_session: AtomicU16,
    allow_plain_fallback: bool,
    on_downgrade: Option<DowngradeNotice>,
}

impl SocketConnector {
    pub fn new(
        pool: Arc<CircuitPool>,
        manager: Arc<RwLock<CircuitManager>>,
        transport: Transport,
        sessions: Arc<SessionRouter>,
        contribution: Arc<ContributionTracker>,
        allow_plain_fallback: bool,
    ) -> Self {
        Self {
            pool,
            manager,
            transport,
            sessions,
            contribution,
            next_session: AtomicU16::new(1),
            allow_plain_fallback,
            on_downgrade: None,
        }
    }

    /// Register the downgrade callback. Without one, fallback still
    /// logs loudly before any direct connection is made.
    pub fn on_downgrade(mut self, notice: DowngradeNotice) -> Self {
        self.on_downgrade = Some(notice);
        self
    }

    /// Open a tunnelled connection to `dest`
    pub async fn connect(&self, dest: SocketAddrV4) -> Result<TunnelSocket> {
        let mut last_error = TunnelError::unavailable("no connection attempt made");

        for attempt in 0..MAX_CONNECT_ATTEMPTS {
            match self.try_connect(dest).await {
                Ok(stream) => {
                    debug!(%dest, attempt, "tunnelled connection open");
                    return Ok(TunnelSocket::Circuit(stream));
                }
                Err(err) if err.is_retryable() => {
                    warn!(%dest, attempt, error = %err, "tunnel attempt failed");
                    last_error = err;
                    if attempt + 1 < MAX_CONNECT_ATTEMPTS {
                        tokio::time::sleep(Self::backoff(attempt)).await;
                    }
                }
                Err(err) => return Err(err),
            }
        }

        if self.allow_plain_fallback {
            // The caller opted in, but is still told every time.
            info!(%dest, "downgrading to a direct connection");
            if let Some(notice) = &self.on_downgrade {
                notice(dest);
            }
            let stream = TcpStream::connect(SocketAddr::V4(dest)).await?;
            return Ok(TunnelSocket::Direct(stream));
        }

        Err(last_error)
    }

    async fn try_connect(&self, dest: SocketAddrV4) -> Result<TunnelStream> {
        let circuit = self.pool.acquire().await?;
        let session = Self::allocate_session(&self.next_session, &self.sessions, circuit);

        let events = self.sessions.register(circuit, session);
        let mut stream = TunnelStream::new(
            circuit,
            session,
            Arc::clone(&self.manager),
            self.transport.clone(),
            Arc::clone(&self.pool),
            Arc::clone(&self.sessions),
            Arc::clone(&self.contribution),
            events,
        );

        let connect = SessionCell::connect(session, dest);
        if let Err(err) = stream.send_cell(&connect).await {
            stream.abort().await;
            return Err(err);
        }

        match stream.await_connect_reply(CONNECT_REPLY_TIMEOUT).await {
            Ok(()) => Ok(stream),
            Err(err) => {
                // A refusal means the circuit worked and the target
                // did not; a retry may route through another exit.
                let circuit_ok =
                    matches!(&err, TunnelError::CircuitEstablishment(msg) if msg.contains("destination"));
                if circuit_ok {
                    stream.close().await;
                } else {
                    stream.abort().await;
                }
                Err(err)
            }
        }
    }

    /// Pick a session id not currently routing on this circuit. Zero
    /// is reserved, and the counter wraps, so a raw increment could
    /// hand out an id whose stream is still live and steal its route.
    fn allocate_session(
        counter: &AtomicU16,
        sessions: &SessionRouter,
        circuit: CircuitId,
    ) -> u16 {
        loop {
            let candidate = counter.fetch_add(1, Ordering::Relaxed);
            if candidate != 0 && !sessions.in_use(circuit, candidate) {
                return candidate;
            }
        }
    }

    fn backoff(attempt: u32) -> Duration {
        use rand::Rng;
        let base = BACKOFF_BASE_MS << attempt;
        let jitter = rand::thread_rng().gen_range(0..BACKOFF_JITTER_MS);
        Duration::from_millis(base + jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_with_jitter() {
        for attempt in 0..3 {
            let backoff = SocketConnector::backoff(attempt);
            let base = Duration::from_millis(BACKOFF_BASE_MS << attempt);
            assert!(backoff >= base);
            assert!(backoff < base + Duration::from_millis(BACKOFF_JITTER_MS));
        }
    }

    #[test]
    fn test_session_allocation_skips_zero_and_live_ids() {
        let counter = AtomicU16::new(u16::MAX);
        let sessions = SessionRouter::new();
        let circuit = CircuitId::generate();

        assert_eq!(
            SocketConnector::allocate_session(&counter, &sessions, circuit),
            u16::MAX
        );

        // The counter has wrapped to zero and session 1 is still
        // routing; the allocator must land on 2.
        let _live = sessions.register(circuit, 1);
        assert_eq!(
            SocketConnector::allocate_session(&counter, &sessions, circuit),
            2
        );
    }

    // Connector behaviour over real circuits is covered by the
    // end-to-end node tests; see node.rs.
}
