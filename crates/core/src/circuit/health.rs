use super::manager::CircuitManager;
use super::types::CircuitId;
use crate::transport::Transport;
use crate::wire::{self, Message};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use swarmveil_common::health;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Rolling health view of one circuit
#[derive(Debug, Clone)]
pub struct HealthRecord {
    latency_ms: VecDeque<u32>,
    consecutive_failures: u32,
    healthy: bool,
}

impl HealthRecord {
    fn new() -> Self {
        Self {
            latency_ms: VecDeque::with_capacity(health::LATENCY_WINDOW),
            consecutive_failures: 0,
            healthy: true,
        }
    }

    fn record_success(&mut self, sample_ms: u32) {
        if self.latency_ms.len() == health::LATENCY_WINDOW {
            self.latency_ms.pop_front();
        }
        self.latency_ms.push_back(sample_ms);
        self.consecutive_failures = 0;
    }

    /// Returns true when this failure tipped the record unhealthy
    fn record_failure(&mut self) -> bool {
        self.consecutive_failures += 1;
        if self.healthy && self.consecutive_failures >= health::MAX_PROBE_FAILURES {
            self.healthy = false;
            return true;
        }
        false
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    pub fn avg_latency_ms(&self) -> Option<u32> {
        if self.latency_ms.is_empty() {
            return None;
        }
        let sum: u64 = self.latency_ms.iter().map(|&ms| ms as u64).sum();
        Some((sum / self.latency_ms.len() as u64) as u32)
    }
}

/// Health records for all live circuits
///
/// The monitor is the only writer. An unhealthy circuit never turns
/// healthy again in place; it is evicted and replaced by a new build.
#[derive(Default)]
pub struct HealthRegistry {
    records: std::sync::RwLock<HashMap<CircuitId, HealthRecord>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: CircuitId) {
        self.records
            .write()
            .expect("health registry lock poisoned")
            .insert(id, HealthRecord::new());
    }

    pub fn remove(&self, id: CircuitId) {
        self.records
            .write()
            .expect("health registry lock poisoned")
            .remove(&id);
    }

    /// Circuits without a record count as healthy; they simply have
    /// not been probed yet.
    pub fn is_healthy(&self, id: CircuitId) -> bool {
        self.records
            .read()
            .expect("health registry lock poisoned")
            .get(&id)
            .map(|record| record.is_healthy())
            .unwrap_or(true)
    }

    pub fn record(&self, id: CircuitId) -> Option<HealthRecord> {
        self.records
            .read()
            .expect("health registry lock poisoned")
            .get(&id)
            .cloned()
    }

    pub fn record_success(&self, id: CircuitId, sample_ms: u32) {
        if let Some(record) = self
            .records
            .write()
            .expect("health registry lock poisoned")
            .get_mut(&id)
        {
            record.record_success(sample_ms);
        }
    }

    pub fn record_failure(&self, id: CircuitId) -> bool {
        self.records
            .write()
            .expect("health registry lock poisoned")
            .get_mut(&id)
            .map(|record| record.record_failure())
            .unwrap_or(false)
    }

    pub fn unhealthy_ids(&self) -> Vec<CircuitId> {
        self.records
            .read()
            .expect("health registry lock poisoned")
            .iter()
            .filter(|(_, record)| !record.is_healthy())
            .map(|(&id, _)| id)
            .collect()
    }
}

/// Periodically probes every established circuit end to end
///
/// A PING is sealed in all layers and answered by the exit with a
/// PONG, so one round trip exercises the full path. Two consecutive
/// misses flag the circuit unhealthy.
pub struct HealthMonitor {
    manager: Arc<RwLock<CircuitManager>>,
    registry: Arc<HealthRegistry>,
    transport: Transport,
    pong_rxs: Mutex<HashMap<CircuitId, mpsc::UnboundedReceiver<u16>>>,
    probe_interval: Duration,
    probe_timeout: Duration,
}

impl HealthMonitor {
    pub fn new(
        manager: Arc<RwLock<CircuitManager>>,
        registry: Arc<HealthRegistry>,
        transport: Transport,
    ) -> Self {
        Self {
            manager,
            registry,
            transport,
            pong_rxs: Mutex::new(HashMap::new()),
            probe_interval: Duration::from_secs(health::PROBE_INTERVAL_SECS),
            probe_timeout: Duration::from_secs(health::PROBE_TIMEOUT_SECS),
        }
    }

    #[cfg(test)]
    fn with_windows(mut self, interval: Duration, timeout: Duration) -> Self {
        self.probe_interval = interval;
        self.probe_timeout = timeout;
        self
    }

    /// Start tracking a circuit. The returned sender is how the
    /// circuit's demux task delivers PONG identifiers.
    pub async fn attach(&self, id: CircuitId) -> mpsc::UnboundedSender<u16> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.registry.register(id);
        self.pong_rxs.lock().await.insert(id, rx);
        tx
    }

    pub async fn detach(&self, id: CircuitId) {
        self.registry.remove(id);
        self.pong_rxs.lock().await.remove(&id);
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.probe_interval);
        // The immediate first tick would probe just-built circuits.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("health monitor stopping");
                    return;
                }
                _ = ticker.tick() => {
                    self.probe_all().await;
                }
            }
        }
    }

    pub async fn probe_all(&self) {
        let (ids, all_ids) = {
            let manager = self.manager.read().await;
            (manager.established_ids(), manager.ids())
        };

        // Drop tracking state for circuits that were closed or swept.
        {
            let mut rxs = self.pong_rxs.lock().await;
            rxs.retain(|id, _| all_ids.contains(id));
        }

        for id in ids {
            if !self.registry.is_healthy(id) {
                continue;
            }
            self.probe(id).await;
        }
    }

    async fn probe(&self, id: CircuitId) {
        let identifier: u16 = rand::random();
        let ping = Message::Ping(wire::Ping {
            circuit_id: id.as_u32(),
            identifier,
        });

        let sealed = {
            let mut manager = self.manager.write().await;
            manager.seal_outbound(id, &ping)
        };
        let (entry, sealed) = match sealed {
            Ok(sealed) => sealed,
            Err(err) => {
                trace!(circuit = %id, error = %err, "skipping probe");
                return;
            }
        };

        let started = Instant::now();
        if let Err(err) = self
            .transport
            .send_message(SocketAddr::V4(entry), &sealed)
            .await
        {
            debug!(circuit = %id, error = %err, "probe send failed");
            self.mark_miss(id);
            return;
        }

        // Take the receiver out of the map for the wait. Holding the
        // map lock across the probe window would block attach and
        // detach for every silent circuit.
        let Some(mut rx) = self.pong_rxs.lock().await.remove(&id) else {
            return;
        };

        // Drain until our identifier comes back or the window closes;
        // stale pongs from earlier probes are ignored.
        let answered = timeout(self.probe_timeout, async {
            while let Some(received) = rx.recv().await {
                if received == identifier {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap_or(false);

        // A detach may have raced the probe; only re-track circuits
        // the registry still knows.
        if self.registry.record(id).is_some() {
            self.pong_rxs.lock().await.insert(id, rx);
        }

        if answered {
            let sample_ms = started.elapsed().as_millis().min(u32::MAX as u128) as u32;
            trace!(circuit = %id, sample_ms, "probe answered");
            self.registry.record_success(id, sample_ms);
        } else {
            self.mark_miss(id);
        }
    }

    fn mark_miss(&self, id: CircuitId) {
        if self.registry.record_failure(id) {
            warn!(circuit = %id, "circuit unhealthy, flagged for eviction");
            // The pool evicts it on the next acquire; traffic is never
            // routed over an unhealthy circuit in the meantime.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::crypto::{EphemeralKeyPair, LayerCrypto, OnionCrypto};
    use crate::circuit::types::{Circuit, HopNode};
    use crate::identity::{KeyPair, PeerId};
    use crate::transport::MemoryRouter;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn establish_with_relay() -> (Circuit, (LayerCrypto, LayerCrypto)) {
        let mut circuit = Circuit::new(CircuitId::generate(), 1);
        let keypair = KeyPair::generate();
        let origin_side = EphemeralKeyPair::generate();
        let relay_side = EphemeralKeyPair::generate();
        let relay_public = *relay_side.public_key();
        let origin_public = *origin_side.public_key();

        let (forward, backward) =
            OnionCrypto::derive_layers(&origin_side.diffie_hellman(&relay_public));
        let relay_layers = OnionCrypto::derive_layers(&relay_side.diffie_hellman(&origin_public));

        circuit.push_hop(HopNode::new(
            PeerId::from_public_key(&keypair.public_key()),
            keypair.public_key(),
            SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 4000),
            forward,
            backward,
        ));
        assert!(circuit.mark_established());
        (circuit, relay_layers)
    }

    #[test]
    fn test_record_goes_unhealthy_after_consecutive_misses() {
        let registry = HealthRegistry::new();
        let id = CircuitId::generate();
        registry.register(id);

        assert!(!registry.record_failure(id));
        assert!(registry.is_healthy(id));
        assert!(registry.record_failure(id));
        assert!(!registry.is_healthy(id));
        assert_eq!(registry.unhealthy_ids(), vec![id]);
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let registry = HealthRegistry::new();
        let id = CircuitId::generate();
        registry.register(id);

        registry.record_failure(id);
        registry.record_success(id, 40);
        assert!(!registry.record_failure(id));
        assert!(registry.is_healthy(id));
    }

    #[test]
    fn test_unhealthy_record_never_revives() {
        let registry = HealthRegistry::new();
        let id = CircuitId::generate();
        registry.register(id);

        registry.record_failure(id);
        registry.record_failure(id);
        registry.record_success(id, 5);
        assert!(!registry.is_healthy(id));
    }

    #[test]
    fn test_latency_window_is_bounded() {
        let mut record = HealthRecord::new();
        for sample in 0..(health::LATENCY_WINDOW as u32 + 5) {
            record.record_success(sample);
        }
        assert_eq!(record.latency_ms.len(), health::LATENCY_WINDOW);
        // Oldest samples fell out of the window.
        assert_eq!(*record.latency_ms.front().unwrap(), 5);
    }

    #[tokio::test]
    async fn test_probe_roundtrip_records_latency() {
        let net = MemoryRouter::new();
        let (origin_transport, mut origin_inbound) =
            net.attach(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1000)));
        let (relay_transport, mut relay_inbound) =
            net.attach(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 4000)));

        let (circuit, (mut relay_forward, mut relay_backward)) = establish_with_relay();
        let id = circuit.id;

        let manager = Arc::new(RwLock::new(CircuitManager::new()));
        manager.write().await.insert(circuit);
        let registry = Arc::new(HealthRegistry::new());
        let monitor = Arc::new(
            HealthMonitor::new(Arc::clone(&manager), Arc::clone(&registry), origin_transport)
                .with_windows(Duration::from_millis(50), Duration::from_secs(2)),
        );
        let pong_tx = monitor.attach(id).await;

        // Exit relay: peel the ping, answer with an encrypted pong.
        tokio::spawn(async move {
            while let Some((from, frame)) = relay_inbound.recv().await {
                let Ok(Message::Data(data)) = Message::decode(&frame) else {
                    continue;
                };
                let peeled = relay_forward.decrypt(&data.payload).unwrap();
                let Ok(Message::Ping(ping)) = Message::decode(&peeled) else {
                    continue;
                };

                let pong = Message::Pong(wire::Pong {
                    circuit_id: ping.circuit_id,
                    identifier: ping.identifier,
                });
                let sealed = relay_backward.encrypt(&pong.encode()).unwrap();
                let reply = Message::Data(wire::Data {
                    circuit_id: ping.circuit_id,
                    payload: sealed,
                });
                relay_transport.send_message(from, &reply).await.unwrap();
            }
        });

        // Origin demux: peel inbound cells and forward pong ids.
        let manager_for_demux = Arc::clone(&manager);
        tokio::spawn(async move {
            while let Some((_, frame)) = origin_inbound.recv().await {
                let Ok(Message::Data(data)) = Message::decode(&frame) else {
                    continue;
                };
                let inner = manager_for_demux
                    .write()
                    .await
                    .peel_inbound(CircuitId(data.circuit_id), &data.payload)
                    .unwrap();
                if let Message::Pong(pong) = inner {
                    pong_tx.send(pong.identifier).unwrap();
                }
            }
        });

        monitor.probe_all().await;

        assert!(registry.is_healthy(id));
        let record = registry.record(id).unwrap();
        assert!(record.avg_latency_ms().is_some());
    }

    #[tokio::test]
    async fn test_attach_not_blocked_by_inflight_probe() {
        let net = MemoryRouter::new();
        let (origin_transport, _inbound) =
            net.attach(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1000)));

        let (circuit, _) = establish_with_relay();
        let id = circuit.id;

        let manager = Arc::new(RwLock::new(CircuitManager::new()));
        manager.write().await.insert(circuit);
        let registry = Arc::new(HealthRegistry::new());
        let monitor = Arc::new(
            HealthMonitor::new(Arc::clone(&manager), Arc::clone(&registry), origin_transport)
                .with_windows(Duration::from_millis(10), Duration::from_millis(500)),
        );
        let _pong_tx = monitor.attach(id).await;

        // The relay never answers, so this probe waits out its full
        // window. New circuits must still be able to attach meanwhile.
        let prober = Arc::clone(&monitor);
        let probing = tokio::spawn(async move { prober.probe_all().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let other = CircuitId::generate();
        timeout(Duration::from_millis(100), monitor.attach(other))
            .await
            .expect("attach stalled behind an in-flight probe");

        probing.await.unwrap();
    }

    #[tokio::test]
    async fn test_silent_circuit_flagged_unhealthy() {
        tokio::time::pause();

        let net = MemoryRouter::new();
        let (origin_transport, _inbound) =
            net.attach(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1000)));

        let (circuit, _) = establish_with_relay();
        let id = circuit.id;

        let manager = Arc::new(RwLock::new(CircuitManager::new()));
        manager.write().await.insert(circuit);
        let registry = Arc::new(HealthRegistry::new());
        let monitor = Arc::new(HealthMonitor::new(
            Arc::clone(&manager),
            Arc::clone(&registry),
            origin_transport,
        ));
        let _pong_tx = monitor.attach(id).await;

        monitor.probe_all().await;
        assert!(registry.is_healthy(id));

        monitor.probe_all().await;
        assert!(!registry.is_healthy(id));
        assert_eq!(registry.unhealthy_ids(), vec![id]);
    }
}
