use crate::identity::{PeerId, PublicKey};
use crate::peer::Peer;
use rand::Rng;
use std::collections::HashSet;
use std::net::SocketAddrV4;

/// A relay chosen for a circuit, snapshotted from the directory at
/// selection time
#[derive(Debug, Clone)]
pub struct PathHop {
    pub peer_id: PeerId,
    pub public_key: PublicKey,
    pub address: SocketAddrV4,
}

impl From<&Peer> for PathHop {
    fn from(peer: &Peer) -> Self {
        Self {
            peer_id: peer.peer_id,
            public_key: peer.public_key,
            address: peer.address,
        }
    }
}

/// Chooses relays for new circuits
///
/// Selection is weighted random over verified peers: dependable,
/// low-latency relays are favoured, but every eligible peer keeps a
/// nonzero chance so paths stay unpredictable.
pub struct PathSelector;

impl PathSelector {
    /// Select `hops` distinct relays from the candidate set, skipping
    /// anything in `exclude`. Candidates must already be verified;
    /// the caller snapshots them from the directory.
    pub fn select(
        candidates: &[Peer],
        hops: usize,
        exclude: &HashSet<PeerId>,
    ) -> Result<Vec<PathHop>, PathSelectionError> {
        let mut eligible: Vec<&Peer> = candidates
            .iter()
            .filter(|peer| peer.is_verified() && !exclude.contains(&peer.peer_id))
            .collect();

        if eligible.len() < hops {
            return Err(PathSelectionError::InsufficientPeers {
                available: eligible.len(),
                required: hops,
            });
        }

        let mut rng = rand::thread_rng();
        let mut path = Vec::with_capacity(hops);

        // Weighted sampling without replacement; a hop never appears
        // twice in one path.
        for _ in 0..hops {
            let total: u64 = eligible.iter().map(|peer| Self::weight(peer)).sum();
            let mut roll = rng.gen_range(0..total);

            let mut picked = 0;
            for (index, peer) in eligible.iter().enumerate() {
                let weight = Self::weight(peer);
                if roll < weight {
                    picked = index;
                    break;
                }
                roll -= weight;
            }

            path.push(PathHop::from(eligible.swap_remove(picked)));
        }

        Ok(path)
    }

    /// Selection weight: reliability score plus a bonus for measured
    /// low latency. Always at least 1 so no verified peer is starved.
    fn weight(peer: &Peer) -> u64 {
        let reliability = peer.reliability.score() as u64;
        let latency_bonus = match peer.latency_ms {
            Some(ms) => 250u64.saturating_sub(ms as u64),
            // Unmeasured peers get a middling bonus rather than none.
            None => 100,
        };
        (reliability + latency_bonus).max(1)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PathSelectionError {
    #[error("Not enough verified peers for a path: {available} available, {required} required")]
    InsufficientPeers { available: usize, required: usize },
}
