use super::crypto::LayerCrypto;
use crate::identity::{PeerId, PublicKey};
use std::net::SocketAddrV4;
use swarmveil_common::{routing, Timestamp};

/// Unique identifier for a circuit. 32 bits wide because that is its
/// width on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CircuitId(pub u32);

impl CircuitId {
    pub fn generate() -> Self {
        use rand::Rng;
        // Zero is reserved for control traffic outside any circuit.
        Self(rand::thread_rng().gen_range(1..=u32::MAX))
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for CircuitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Circuit({})", self.0)
    }
}

/// State of a circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Hop-by-hop construction in progress
    Creating,

    /// All requested hops completed their key exchange
    Established,

    /// Construction or health checking gave up on this circuit
    Failed,

    /// Torn down; hop secrets released
    Closed,
}

/// A single relay hop with its independently negotiated layer keys
///
/// Holds only the peer's ID, not the peer record: the directory owns
/// peers, circuits reference them.
#[derive(Debug, Clone)]
pub struct HopNode {
    pub peer_id: PeerId,
    pub public_key: PublicKey,
    pub address: SocketAddrV4,

    /// Encrypts cells travelling away from us
    pub forward: LayerCrypto,

    /// Decrypts cells travelling towards us
    pub backward: LayerCrypto,

    pub added_at: Timestamp,
}

impl HopNode {
    pub fn new(
        peer_id: PeerId,
        public_key: PublicKey,
        address: SocketAddrV4,
        forward: LayerCrypto,
        backward: LayerCrypto,
    ) -> Self {
        Self {
            peer_id,
            public_key,
            address,
            forward,
            backward,
            added_at: Timestamp::now(),
        }
    }
}

/// A multi-hop onion path from us into the overlay
#[derive(Debug)]
pub struct Circuit {
    pub id: CircuitId,
    pub state: CircuitState,

    /// Hops ordered entry to exit. Immutable once Established.
    hops: Vec<HopNode>,

    /// Number of hops requested at creation
    requested_hops: usize,

    pub created_at: Timestamp,
    pub last_used: Timestamp,
    pub bytes_sent: u64,
    pub bytes_received: u64,

    /// Send or probe failures observed on this circuit
    pub failure_count: u32,
}

impl Circuit {
    pub fn new(id: CircuitId, requested_hops: usize) -> Self {
        Self {
            id,
            state: CircuitState::Creating,
            hops: Vec::with_capacity(requested_hops),
            requested_hops,
            created_at: Timestamp::now(),
            last_used: Timestamp::now(),
            bytes_sent: 0,
            bytes_received: 0,
            failure_count: 0,
        }
    }

    pub fn hop_count(&self) -> usize {
        self.hops.len()
    }

    pub fn requested_hops(&self) -> usize {
        self.requested_hops
    }

    pub fn hops(&self) -> &[HopNode] {
        &self.hops
    }

    pub fn is_established(&self) -> bool {
        self.state == CircuitState::Established
    }

    pub fn entry_hop(&self) -> Option<&HopNode> {
        self.hops.first()
    }

    pub fn exit_hop(&self) -> Option<&HopNode> {
        self.hops.last()
    }

    /// Append a hop during construction. Rejected once Established:
    /// the hop sequence is immutable from then on.
    pub fn push_hop(&mut self, hop: HopNode) {
        if self.state == CircuitState::Creating {
            self.hops.push(hop);
        }
    }

    /// Promote to Established. Only legal when every requested hop
    /// completed its key exchange.
    pub fn mark_established(&mut self) -> bool {
        if self.state == CircuitState::Creating && self.hops.len() == self.requested_hops {
            self.state = CircuitState::Established;
            true
        } else {
            false
        }
    }

    pub fn mark_used(&mut self) {
        self.last_used = Timestamp::now();
    }

    pub fn add_sent(&mut self, bytes: u64) {
        self.bytes_sent += bytes;
        self.mark_used();
    }

    pub fn add_received(&mut self, bytes: u64) {
        self.bytes_received += bytes;
        self.mark_used();
    }

    pub fn record_failure(&mut self) {
        self.failure_count += 1;
    }

    pub fn mark_failed(&mut self) {
        self.state = CircuitState::Failed;
    }

    /// Close the circuit and release every hop's key material.
    pub fn mark_closed(&mut self) {
        self.state = CircuitState::Closed;
        self.hops.clear();
    }

    pub fn is_expired(&self) -> bool {
        self.created_at.elapsed().as_secs() > routing::CIRCUIT_LIFETIME_SECS
    }

    pub fn is_idle(&self) -> bool {
        self.last_used.elapsed().as_secs() > routing::CIRCUIT_IDLE_SECS
    }

    /// Forward layers ordered entry to exit, for onion encryption
    pub fn forward_layers_mut(&mut self) -> Vec<&mut LayerCrypto> {
        self.hops.iter_mut().map(|hop| &mut hop.forward).collect()
    }

    /// Backward layers ordered entry to exit, for peeling replies
    pub fn backward_layers_mut(&mut self) -> Vec<&mut LayerCrypto> {
        self.hops.iter_mut().map(|hop| &mut hop.backward).collect()
    }
}
