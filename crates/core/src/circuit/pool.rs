use super::health::HealthRegistry;
use super::manager::{destroy_reason, CircuitManager};
use super::types::{Circuit, CircuitId};
use crate::transport::{CircuitRouter, Transport};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use swarmveil_common::{Result, TunnelError};
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// How a session ended, from the pool's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Success,
    Failure,
}

/// Request for the node's build worker to construct one circuit
#[derive(Debug)]
pub struct BuildRequest {
    pub hops: usize,
}

/// Keeps a target number of healthy circuits warm and leases them to
/// sessions
///
/// The pool never builds circuits itself; it asks the build worker
/// over a channel and waits. Callers block in `acquire` until a
/// healthy under-capacity circuit exists or the wait budget runs out.
pub struct CircuitPool {
    manager: Arc<RwLock<CircuitManager>>,
    registry: Arc<HealthRegistry>,
    router: Arc<CircuitRouter>,
    transport: Transport,
    build_tx: mpsc::UnboundedSender<BuildRequest>,
    sessions: std::sync::Mutex<HashMap<CircuitId, usize>>,
    pending_builds: AtomicUsize,
    notify: Notify,

    pool_size: usize,
    max_sessions: usize,
    hops: usize,
    acquire_timeout: Duration,
}

impl CircuitPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        manager: Arc<RwLock<CircuitManager>>,
        registry: Arc<HealthRegistry>,
        router: Arc<CircuitRouter>,
        transport: Transport,
        build_tx: mpsc::UnboundedSender<BuildRequest>,
        pool_size: usize,
        max_sessions: usize,
        hops: usize,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            manager,
            registry,
            router,
            transport,
            build_tx,
            sessions: std::sync::Mutex::new(HashMap::new()),
            pending_builds: AtomicUsize::new(0),
            notify: Notify::new(),
            pool_size,
            max_sessions,
            hops,
            acquire_timeout,
        }
    }

    /// Lease a healthy circuit for one session
    ///
    /// Evicts anything flagged unhealthy, reuses an under-capacity
    /// circuit when one exists, and otherwise requests construction
    /// and waits. Gives up with `CircuitUnavailable` after the wait
    /// budget.
    pub async fn acquire(&self) -> Result<CircuitId> {
        let deadline = Instant::now() + self.acquire_timeout;

        loop {
            self.evict_unhealthy().await;

            if let Some(id) = self.try_lease().await {
                return Ok(id);
            }

            self.maybe_request_build().await;

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = sleep_until(deadline) => {
                    return Err(TunnelError::unavailable(format!(
                        "no healthy circuit within {:?}",
                        self.acquire_timeout
                    )));
                }
            }
        }
    }

    /// Return a leased circuit. A failed session evicts the circuit
    /// outright; the next acquire gets a fresh one.
    pub async fn release(&self, id: CircuitId, outcome: SessionOutcome) {
        {
            let mut sessions = self.sessions.lock().expect("session map lock poisoned");
            if let Some(count) = sessions.get_mut(&id) {
                *count = count.saturating_sub(1);
            }
        }

        if outcome == SessionOutcome::Failure {
            warn!(circuit = %id, "session failed, evicting circuit");
            self.manager.write().await.mark_failed(id);
            self.evict(id, destroy_reason::UNHEALTHY).await;
        }

        self.notify.notify_waiters();
    }

    /// Hand a freshly built circuit to the pool
    pub async fn add_circuit(&self, circuit: Circuit) {
        let id = circuit.id;
        self.manager.write().await.insert(circuit);
        self.registry.register(id);
        self.sessions
            .lock()
            .expect("session map lock poisoned")
            .insert(id, 0);
        self.pending_builds.fetch_sub(1, Ordering::SeqCst);
        debug!(circuit = %id, "circuit added to pool");
        self.notify.notify_waiters();
    }

    /// Record a build that ended without a circuit
    pub fn build_failed(&self) {
        self.pending_builds.fetch_sub(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Number of circuits currently leased out or available
    pub async fn established_count(&self) -> usize {
        let manager = self.manager.read().await;
        manager.established_ids().len()
    }

    async fn try_lease(&self) -> Option<CircuitId> {
        let established = self.manager.read().await.established_ids();
        let mut sessions = self.sessions.lock().expect("session map lock poisoned");

        // Least-loaded healthy circuit with session headroom.
        let candidate = established
            .into_iter()
            .filter(|&id| self.registry.is_healthy(id))
            .map(|id| (id, sessions.get(&id).copied().unwrap_or(0)))
            .filter(|&(_, load)| load < self.max_sessions)
            .min_by_key(|&(_, load)| load);

        let (id, load) = candidate?;
        sessions.insert(id, load + 1);
        Some(id)
    }

    async fn maybe_request_build(&self) {
        let live = self.manager.read().await.established_ids().len();
        let pending = self.pending_builds.load(Ordering::SeqCst);
        if live + pending >= self.pool_size {
            return;
        }

        self.pending_builds.fetch_add(1, Ordering::SeqCst);
        if self
            .build_tx
            .send(BuildRequest { hops: self.hops })
            .is_err()
        {
            // Build worker is gone; acquire will time out.
            self.pending_builds.fetch_sub(1, Ordering::SeqCst);
        }
    }

    async fn evict_unhealthy(&self) {
        for id in self.registry.unhealthy_ids() {
            self.evict(id, destroy_reason::UNHEALTHY).await;
        }
    }

    async fn evict(&self, id: CircuitId, reason: u8) {
        let destroy = self.manager.write().await.close(id, reason);
        self.registry.remove(id);
        self.router.unregister(id.as_u32());
        self.sessions
            .lock()
            .expect("session map lock poisoned")
            .remove(&id);

        if let Some((entry, message)) = destroy {
            info!(circuit = %id, reason, "circuit evicted");
            // Best-effort notification; teardown is already done.
            let _ = self
                .transport
                .send_message(SocketAddr::V4(entry), &message)
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::crypto::{EphemeralKeyPair, OnionCrypto};
    use crate::circuit::types::HopNode;
    use crate::identity::{KeyPair, PeerId};
    use crate::transport::MemoryRouter;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn established_circuit() -> Circuit {
        let mut circuit = Circuit::new(CircuitId::generate(), 1);
        let keypair = KeyPair::generate();
        let ours = EphemeralKeyPair::generate();
        let theirs = EphemeralKeyPair::generate();
        let their_public = *theirs.public_key();
        let (forward, backward) = OnionCrypto::derive_layers(&ours.diffie_hellman(&their_public));

        circuit.push_hop(HopNode::new(
            PeerId::from_public_key(&keypair.public_key()),
            keypair.public_key(),
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, 4000),
            forward,
            backward,
        ));
        assert!(circuit.mark_established());
        circuit
    }

    struct PoolHarness {
        pool: Arc<CircuitPool>,
        build_rx: mpsc::UnboundedReceiver<BuildRequest>,
    }

    fn harness(pool_size: usize, max_sessions: usize, acquire_timeout: Duration) -> PoolHarness {
        let net = MemoryRouter::new();
        let (transport, _inbound) =
            net.attach(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1000)));
        let (build_tx, build_rx) = mpsc::unbounded_channel();

        let pool = Arc::new(CircuitPool::new(
            Arc::new(RwLock::new(CircuitManager::new())),
            Arc::new(HealthRegistry::new()),
            Arc::new(CircuitRouter::new()),
            transport,
            build_tx,
            pool_size,
            max_sessions,
            3,
            acquire_timeout,
        ));
        PoolHarness { pool, build_rx }
    }

    #[tokio::test]
    async fn test_acquire_reuses_under_capacity_circuit() {
        let harness = harness(4, 8, Duration::from_secs(1));
        let circuit = established_circuit();
        let id = circuit.id;
        harness.pool.pending_builds.fetch_add(1, Ordering::SeqCst);
        harness.pool.add_circuit(circuit).await;

        let first = harness.pool.acquire().await.unwrap();
        let second = harness.pool.acquire().await.unwrap();
        assert_eq!(first, id);
        assert_eq!(second, id);
    }

    #[tokio::test]
    async fn test_acquire_requests_build_and_waits() {
        let mut harness = harness(4, 8, Duration::from_secs(10));

        let pool = Arc::clone(&harness.pool);
        let acquire = tokio::spawn(async move { pool.acquire().await });

        // The pool asked the worker for a circuit.
        let request = harness.build_rx.recv().await.unwrap();
        assert_eq!(request.hops, 3);

        let circuit = established_circuit();
        let id = circuit.id;
        harness.pool.add_circuit(circuit).await;

        assert_eq!(acquire.await.unwrap().unwrap(), id);
    }

    #[tokio::test]
    async fn test_acquire_times_out_without_circuits() {
        tokio::time::pause();

        // Keep the receiver alive so the pool keeps asking.
        let harness = harness(4, 8, Duration::from_secs(30));
        let result = harness.pool.acquire().await;

        assert!(matches!(result, Err(TunnelError::CircuitUnavailable(_))));
        drop(harness);
    }

    #[tokio::test]
    async fn test_session_cap_spills_to_second_circuit() {
        let harness = harness(4, 2, Duration::from_secs(1));
        let first = established_circuit();
        let second = established_circuit();
        let first_id = first.id;
        let second_id = second.id;
        harness.pool.pending_builds.fetch_add(2, Ordering::SeqCst);
        harness.pool.add_circuit(first).await;
        harness.pool.add_circuit(second).await;

        let mut leases = Vec::new();
        for _ in 0..4 {
            leases.push(harness.pool.acquire().await.unwrap());
        }

        let first_count = leases.iter().filter(|&&id| id == first_id).count();
        let second_count = leases.iter().filter(|&&id| id == second_id).count();
        assert_eq!(first_count, 2);
        assert_eq!(second_count, 2);
    }

    #[tokio::test]
    async fn test_unhealthy_circuit_evicted_on_acquire() {
        let mut harness = harness(4, 8, Duration::from_millis(200));
        let sick = established_circuit();
        let sick_id = sick.id;
        harness.pool.pending_builds.fetch_add(1, Ordering::SeqCst);
        harness.pool.add_circuit(sick).await;

        // Two consecutive probe misses flag it.
        harness.pool.registry.record_failure(sick_id);
        harness.pool.registry.record_failure(sick_id);

        let result = harness.pool.acquire().await;
        assert!(result.is_err());

        // The sick circuit is gone and a replacement was requested.
        assert!(!harness.pool.manager.read().await.contains(sick_id));
        assert!(harness.build_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_failed_session_evicts_circuit() {
        let harness = harness(4, 8, Duration::from_secs(1));
        let circuit = established_circuit();
        let id = circuit.id;
        harness.pool.pending_builds.fetch_add(1, Ordering::SeqCst);
        harness.pool.add_circuit(circuit).await;

        let leased = harness.pool.acquire().await.unwrap();
        harness.pool.release(leased, SessionOutcome::Failure).await;

        assert!(!harness.pool.manager.read().await.contains(id));
    }
}
