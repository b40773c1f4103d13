//! Node orchestration
//!
//! [`TunnelNode`] wires the pieces together: one transport, one
//! dispatcher feeding an event loop, a build worker serving the
//! circuit pool, the health monitor, and periodic maintenance. The
//! host keeps an `Arc<TunnelNode>` and talks to it through `connect`,
//! `status` and `shutdown`.

use crate::bandwidth::{ContributionSnapshot, ContributionTracker};
use crate::circuit::{
    destroy_reason, BuildOutcome, BuildRequest, CircuitBuilder, CircuitId, CircuitManager,
    CircuitPool, CircuitStats, HealthMonitor, HealthRegistry, PathSelector, RelayService,
    SessionCell,
};
use crate::connector::{DowngradeNotice, SessionRouter, SocketConnector, TunnelSocket};
use crate::identity::{NetworkIdentity, PeerId};
use crate::peer::{DirectoryStats, HandshakeDriver, PeerDirectory};
use crate::transport::{self, CircuitRouter, Dispatcher, Event, Inbound, Transport};
use crate::wire::{self, Message, MessageKind};
use std::collections::HashSet;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use swarmveil_common::{protocol, Result, TunnelConfig, TunnelError};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Interval for the directory/circuit/relay sweep loop
const MAINTENANCE_INTERVAL_SECS: u64 = 30;

/// Point-in-time view of the node, for status surfaces
#[derive(Debug, Clone, serde::Serialize)]
pub struct TunnelStatus {
    pub peer_id: String,
    pub listen_addr: String,
    pub peers: DirectoryStats,
    pub circuits: CircuitStats,
    pub relayed_circuits: usize,
    pub contribution: ContributionSnapshot,
}

/// A running overlay node
pub struct TunnelNode {
    config: TunnelConfig,
    identity: Arc<NetworkIdentity>,
    transport: Transport,
    dispatcher: Arc<Dispatcher>,
    directory: Arc<RwLock<PeerDirectory>>,
    handshake: HandshakeDriver,
    manager: Arc<RwLock<CircuitManager>>,
    registry: Arc<HealthRegistry>,
    monitor: Arc<HealthMonitor>,
    circuit_router: Arc<CircuitRouter>,
    builder: CircuitBuilder,
    pool: Arc<CircuitPool>,
    sessions: Arc<SessionRouter>,
    relay: Arc<RelayService>,
    contribution: Arc<ContributionTracker>,
    connector: SocketConnector,
    cancel: CancellationToken,
}

impl TunnelNode {
    /// Bind a UDP socket per the config and start the node
    pub async fn bind(config: TunnelConfig, identity: NetworkIdentity) -> Result<Arc<Self>> {
        let addr: SocketAddr = format!("{}:{}", config.listen_addr, config.listen_port)
            .parse()
            .map_err(|err| TunnelError::format(format!("invalid listen address: {err}")))?;
        let (transport, inbound) = transport::bind_udp(addr).await?;
        Ok(Self::start(config, identity, transport, inbound, None))
    }

    /// Start the node on an already-bound transport
    pub fn start(
        config: TunnelConfig,
        identity: NetworkIdentity,
        transport: Transport,
        inbound: Inbound,
        on_downgrade: Option<DowngradeNotice>,
    ) -> Arc<Self> {
        let config = config.sanitize();
        let identity = Arc::new(identity);

        let (dispatcher, event_rx) = Dispatcher::new();
        let dispatcher = Arc::new(dispatcher);
        let directory = Arc::new(RwLock::new(PeerDirectory::new()));
        let manager = Arc::new(RwLock::new(CircuitManager::new()));
        let registry = Arc::new(HealthRegistry::new());
        let circuit_router = Arc::new(CircuitRouter::new());
        let contribution = Arc::new(ContributionTracker::new(config.track_contribution));
        let sessions = Arc::new(SessionRouter::new());
        let (build_tx, build_rx) = mpsc::unbounded_channel();

        let pool = Arc::new(CircuitPool::new(
            Arc::clone(&manager),
            Arc::clone(&registry),
            Arc::clone(&circuit_router),
            transport.clone(),
            build_tx,
            config.pool_size,
            config.max_sessions_per_circuit,
            config.hop_count,
            config.circuit_timeout(),
        ));
        let monitor = Arc::new(HealthMonitor::new(
            Arc::clone(&manager),
            Arc::clone(&registry),
            transport.clone(),
        ));
        let relay = Arc::new(RelayService::new(
            Arc::clone(&identity),
            transport.clone(),
            Arc::clone(&dispatcher),
            Arc::clone(&contribution),
        ));
        let handshake = HandshakeDriver::new(
            Arc::clone(&identity),
            transport.clone(),
            Arc::clone(&dispatcher),
            Arc::clone(&directory),
        );
        let builder = CircuitBuilder::new(
            transport.clone(),
            Arc::clone(&dispatcher),
            Arc::clone(&circuit_router),
        );
        let mut connector = SocketConnector::new(
            Arc::clone(&pool),
            Arc::clone(&manager),
            transport.clone(),
            Arc::clone(&sessions),
            Arc::clone(&contribution),
            config.allow_plain_fallback,
        );
        if let Some(notice) = on_downgrade {
            connector = connector.on_downgrade(notice);
        }

        let node = Arc::new(Self {
            config,
            identity,
            transport,
            dispatcher,
            directory,
            handshake,
            manager,
            registry,
            monitor,
            circuit_router,
            builder,
            pool,
            sessions,
            relay,
            contribution,
            connector,
            cancel: CancellationToken::new(),
        });

        tokio::spawn(Arc::clone(&node).run_inbound(inbound));
        tokio::spawn(Arc::clone(&node).run_events(event_rx));
        tokio::spawn(Arc::clone(&node).run_build_worker(build_rx));
        tokio::spawn(Arc::clone(&node.monitor).run(node.cancel.clone()));
        tokio::spawn(Arc::clone(&node).run_maintenance());

        info!(
            peer = %node.identity.peer_id().short(),
            addr = %node.transport.local_addr(),
            relay = node.config.accept_relay,
            "tunnel node started"
        );
        node
    }

    pub fn peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// Open a connection to `dest` through the overlay
    pub async fn connect(&self, dest: SocketAddrV4) -> Result<TunnelSocket> {
        self.connector.connect(dest).await
    }

    pub async fn status(&self) -> TunnelStatus {
        TunnelStatus {
            peer_id: self.identity.peer_id().to_hex(),
            listen_addr: self.transport.local_addr().to_string(),
            peers: self.directory.read().await.stats(),
            circuits: self.manager.read().await.stats(),
            relayed_circuits: self.relay.circuit_count().await,
            contribution: self.contribution.snapshot(),
        }
    }

    /// Stop all loops and tear down every circuit we originated
    pub async fn shutdown(&self) {
        info!("tunnel node shutting down");
        self.cancel.cancel();

        let ids = self.manager.read().await.ids();
        for id in ids {
            let destroy = self
                .manager
                .write()
                .await
                .close(id, destroy_reason::SHUTDOWN);
            self.registry.remove(id);
            self.circuit_router.unregister(id.as_u32());
            self.sessions.drop_circuit(id);
            if let Some((entry, message)) = destroy {
                let _ = self
                    .transport
                    .send_message(SocketAddr::V4(entry), &message)
                    .await;
            }
        }
    }

    /// Walk every bootstrap address plus anything gossip has handed
    /// us, verifying each in turn. Runs until the target list is
    /// exhausted or the node shuts down.
    pub async fn bootstrap_round(&self) {
        let mut targets: Vec<SocketAddrV4> = Vec::new();
        for peer in &self.config.bootstrap_peers {
            match peer.parse() {
                Ok(addr) => targets.push(addr),
                Err(err) => warn!(peer = %peer, error = %err, "bad bootstrap address"),
            }
        }
        targets.extend(
            self.directory
                .read()
                .await
                .discovered_peers()
                .into_iter()
                .map(|peer| peer.address),
        );

        let local = match self.transport.local_addr() {
            SocketAddr::V4(addr) => Some(addr),
            _ => None,
        };

        let mut seen = HashSet::new();
        for target in targets {
            if self.cancel.is_cancelled() {
                return;
            }
            if Some(target) == local || !seen.insert(target) {
                continue;
            }
            match self.handshake.walk(target, &self.cancel).await {
                Ok(peer) => debug!(peer = %peer.short(), %target, "peer verified"),
                Err(err) => debug!(%target, error = %err, "walk failed"),
            }
        }
    }

    /// One maintenance pass: evict stale peers, sweep dead circuits,
    /// and top discovery back up when the directory runs thin.
    pub async fn maintain(&self) {
        let evicted = self.directory.write().await.evict_stale();
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "evicted stale peers");
        }

        let swept = self.manager.write().await.sweep();
        for (id, entry, destroy) in swept {
            self.registry.remove(id);
            self.circuit_router.unregister(id.as_u32());
            self.sessions.drop_circuit(id);
            let _ = self
                .transport
                .send_message(SocketAddr::V4(entry), &destroy)
                .await;
        }

        self.relay.sweep().await;

        // Path selection needs distinct relays per circuit; keep a
        // little headroom over the hop count.
        let verified = self.directory.read().await.verified_count();
        if verified < self.config.hop_count + 2 {
            self.bootstrap_round().await;
        }
    }

    async fn run_inbound(self: Arc<Self>, mut inbound: Inbound) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                received = inbound.recv() => {
                    let Some((from, frame)) = received else { return };

                    // Fast path: cells for circuits we originated go
                    // straight to their demux channel, still sealed.
                    if frame.first() == Some(&(MessageKind::Data as u8)) && frame.len() > 5 {
                        let circuit_id =
                            u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
                        if self.circuit_router.route(circuit_id, frame[5..].to_vec()) {
                            continue;
                        }
                    }
                    self.dispatcher.handle_frame(from, &frame);
                }
            }
        }
    }

    async fn run_events(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<Event>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                event = events.recv() => {
                    let Some(Event::Message { from, message }) = event else { return };
                    self.handle_message(from, message).await;
                }
            }
        }
    }

    async fn handle_message(&self, from: SocketAddr, message: Message) {
        let SocketAddr::V4(from_v4) = from else {
            trace!(%from, "ignoring non-IPv4 sender");
            return;
        };

        match message {
            Message::IntroductionRequest(request) => {
                if let Err(err) = self.handshake.respond(from_v4, request).await {
                    debug!(%from, error = %err, "introduction response failed");
                }
            }
            Message::PunctureRequest(request) => {
                if let Err(err) = self.handshake.handle_puncture_request(request).await {
                    debug!(%from, error = %err, "puncture failed");
                }
            }
            Message::Create(create) => {
                if self.config.accept_relay {
                    self.relay.handle_create(from_v4, create).await;
                } else {
                    trace!(%from, "relay duty disabled, ignoring create");
                }
            }
            Message::Data(data) => {
                if !self.relay.handle_data(from_v4, data).await {
                    trace!(%from, "data cell for unknown circuit");
                }
            }
            Message::Destroy(destroy) => self.handle_destroy(destroy).await,
            other => {
                trace!(%from, kind = other.kind() as u8, "unhandled message");
            }
        }
    }

    /// A DESTROY can target a circuit we originated or one we relay
    async fn handle_destroy(&self, destroy: wire::Destroy) {
        let id = CircuitId(destroy.circuit_id);
        if self.manager.read().await.contains(id) {
            debug!(circuit = %id, reason = destroy.reason, "circuit destroyed by remote");
            self.manager.write().await.close(id, destroy.reason);
            self.registry.remove(id);
            self.circuit_router.unregister(id.as_u32());
            self.sessions.drop_circuit(id);
        } else {
            self.relay.handle_destroy(destroy).await;
        }
    }

    async fn run_build_worker(self: Arc<Self>, mut requests: mpsc::UnboundedReceiver<BuildRequest>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                request = requests.recv() => {
                    let Some(request) = request else { return };
                    let node = Arc::clone(&self);
                    tokio::spawn(async move { node.build_circuit(request.hops).await });
                }
            }
        }
    }

    async fn build_circuit(self: Arc<Self>, hops: usize) {
        let candidates = self.directory.read().await.verified_peers();
        let path = match PathSelector::select(&candidates, hops, &HashSet::new()) {
            Ok(path) => path,
            Err(err) => {
                debug!(error = %err, "cannot build circuit yet");
                self.pool.build_failed();
                return;
            }
        };
        let peers: Vec<PeerId> = path.iter().map(|hop| hop.peer_id).collect();

        match self
            .builder
            .build(
                path,
                protocol::handshake_step_timeout(),
                self.config.circuit_timeout(),
                &self.cancel,
            )
            .await
        {
            Ok(outcome) => {
                {
                    let mut directory = self.directory.write().await;
                    for peer in &peers {
                        directory.record_success(peer);
                    }
                }
                self.install_circuit(outcome).await;
            }
            Err(failure) => {
                if let Some(peer) = failure.failed_hop {
                    self.directory.write().await.record_failure(&peer);
                }
                self.pool.build_failed();
            }
        }
    }

    /// Hand a fresh circuit to the pool and start its demux task
    async fn install_circuit(self: &Arc<Self>, outcome: BuildOutcome) {
        let id = outcome.circuit.id;
        let pong_tx = self.monitor.attach(id).await;
        self.pool.add_circuit(outcome.circuit).await;

        let mut raw_inbound = outcome.raw_inbound;
        let node = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(raw) = raw_inbound.recv().await {
                let inner = node.manager.write().await.peel_inbound(id, &raw);
                match inner {
                    Ok(Message::Pong(pong)) => {
                        let _ = pong_tx.send(pong.identifier);
                    }
                    Ok(Message::Data(data)) => match SessionCell::decode(&data.payload) {
                        Ok(cell) => node.sessions.deliver(id, cell),
                        Err(err) => debug!(circuit = %id, error = %err, "bad session cell"),
                    },
                    Ok(_) => trace!(circuit = %id, "unexpected inner message"),
                    Err(err) => debug!(circuit = %id, error = %err, "inbound cell unreadable"),
                }
            }
            trace!(circuit = %id, "demux task finished");
        });
    }

    async fn run_maintenance(self: Arc<Self>) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(MAINTENANCE_INTERVAL_SECS));
        // Skip the immediate tick; the host drives the first
        // bootstrap round explicitly.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => self.maintain().await,
            }
        }
    }
}
