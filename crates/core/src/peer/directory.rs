use crate::identity::{PeerId, PublicKey};
use std::collections::HashMap;
use std::net::SocketAddrV4;
use swarmveil_common::{protocol, Reliability, Timestamp};
use tracing::{debug, info};

/// Reliability delta for a successful circuit participation
const SUCCESS_REWARD: u32 = 10;

/// Penalty for a failed handshake step or an aborted circuit build.
/// Steeper than the reward so flaky relays drop out quickly.
const FAILURE_PENALTY: u32 = 25;

/// Progress of a peer through the discovery handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Address and key known, nothing verified yet
    Discovered,

    /// An introduction exchange with this peer is underway
    HandshakeInProgress,

    /// Introduction signature checked out; eligible for circuits
    Verified,

    /// Went silent or failed verification
    Lost,
}

/// A peer of the overlay as we currently know it
#[derive(Debug, Clone)]
pub struct Peer {
    pub peer_id: PeerId,
    pub public_key: PublicKey,
    pub address: SocketAddrV4,
    pub state: HandshakeState,
    pub last_seen: Timestamp,
    pub reliability: Reliability,

    /// Smoothed round-trip estimate from reachability probes
    pub latency_ms: Option<u32>,
}

impl Peer {
    fn new(public_key: PublicKey, address: SocketAddrV4) -> Self {
        Self {
            peer_id: PeerId::from_public_key(&public_key),
            public_key,
            address,
            state: HandshakeState::Discovered,
            last_seen: Timestamp::now(),
            reliability: Reliability::INITIAL,
            latency_ms: None,
        }
    }

    pub fn is_verified(&self) -> bool {
        self.state == HandshakeState::Verified
    }

    pub fn is_stale(&self) -> bool {
        self.last_seen.elapsed().as_secs() > protocol::PEER_STALE_SECS
    }
}

/// Authoritative table of known peers, keyed by peer ID
///
/// The directory is the single writer of peer state; circuits and the
/// path selector only ever read snapshots from it.
#[derive(Default)]
pub struct PeerDirectory {
    peers: HashMap<PeerId, Peer>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a peer we learned about, from gossip or a first inbound
    /// message. A Lost peer re-enters as Discovered; a known peer gets
    /// its address refreshed.
    pub fn upsert_discovered(&mut self, public_key: PublicKey, address: SocketAddrV4) -> PeerId {
        let peer_id = PeerId::from_public_key(&public_key);
        match self.peers.get_mut(&peer_id) {
            Some(peer) => {
                peer.address = address;
                peer.last_seen = Timestamp::now();
                if peer.state == HandshakeState::Lost {
                    peer.state = HandshakeState::Discovered;
                    debug!(peer = %peer_id.short(), "lost peer rediscovered");
                }
            }
            None => {
                debug!(peer = %peer_id.short(), %address, "new peer discovered");
                self.peers.insert(peer_id, Peer::new(public_key, address));
            }
        }
        peer_id
    }

    pub fn mark_handshake_in_progress(&mut self, peer_id: &PeerId) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            if peer.state != HandshakeState::Verified {
                peer.state = HandshakeState::HandshakeInProgress;
            }
        }
    }

    /// Promote to Verified. Only the handshake driver calls this,
    /// after checking the introduction signature.
    pub fn mark_verified(&mut self, peer_id: &PeerId) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            if peer.state != HandshakeState::Verified {
                info!(peer = %peer_id.short(), "peer verified");
            }
            peer.state = HandshakeState::Verified;
            peer.last_seen = Timestamp::now();
        }
    }

    pub fn mark_lost(&mut self, peer_id: &PeerId) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            debug!(peer = %peer_id.short(), "peer lost");
            peer.state = HandshakeState::Lost;
        }
    }

    pub fn touch(&mut self, peer_id: &PeerId) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.last_seen = Timestamp::now();
        }
    }

    /// Fold a new round-trip sample into the peer's latency estimate
    pub fn record_latency(&mut self, peer_id: &PeerId, sample_ms: u32) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.latency_ms = Some(match peer.latency_ms {
                // Exponential moving average, 7/8 old + 1/8 new.
                Some(current) => (current * 7 + sample_ms) / 8,
                None => sample_ms,
            });
            peer.last_seen = Timestamp::now();
        }
    }

    pub fn record_success(&mut self, peer_id: &PeerId) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.reliability.increase(SUCCESS_REWARD);
            peer.last_seen = Timestamp::now();
        }
    }

    pub fn record_failure(&mut self, peer_id: &PeerId) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.reliability.decrease(FAILURE_PENALTY);
        }
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&Peer> {
        self.peers.get(peer_id)
    }

    /// Peer currently listed at an address. Walks start from an
    /// address and may fail before any key material arrives.
    pub fn peer_id_at(&self, address: SocketAddrV4) -> Option<PeerId> {
        self.peers
            .values()
            .find(|peer| peer.address == address)
            .map(|peer| peer.peer_id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Snapshot of every Verified peer, for path selection and gossip
    pub fn verified_peers(&self) -> Vec<Peer> {
        self.peers
            .values()
            .filter(|peer| peer.is_verified())
            .cloned()
            .collect()
    }

    /// Peers we know about but have not yet walked to
    pub fn discovered_peers(&self) -> Vec<Peer> {
        self.peers
            .values()
            .filter(|peer| peer.state == HandshakeState::Discovered)
            .cloned()
            .collect()
    }

    pub fn verified_count(&self) -> usize {
        self.peers.values().filter(|peer| peer.is_verified()).count()
    }

    /// Drop peers that have been silent past the staleness window.
    /// Returns the evicted IDs so callers can tear down anything that
    /// referenced them.
    pub fn evict_stale(&mut self) -> Vec<PeerId> {
        let stale: Vec<PeerId> = self
            .peers
            .values()
            .filter(|peer| peer.is_stale())
            .map(|peer| peer.peer_id)
            .collect();

        for peer_id in &stale {
            debug!(peer = %peer_id.short(), "evicting stale peer");
            self.peers.remove(peer_id);
        }
        stale
    }

    pub fn stats(&self) -> DirectoryStats {
        let mut stats = DirectoryStats::default();
        for peer in self.peers.values() {
            stats.total += 1;
            match peer.state {
                HandshakeState::Discovered => stats.discovered += 1,
                HandshakeState::HandshakeInProgress => stats.in_progress += 1,
                HandshakeState::Verified => stats.verified += 1,
                HandshakeState::Lost => stats.lost += 1,
            }
        }
        stats
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct DirectoryStats {
    pub total: usize,
    pub discovered: usize,
    pub in_progress: usize,
    pub verified: usize,
    pub lost: usize,
}
