use super::directory::PeerDirectory;
use crate::identity::{NetworkIdentity, PeerId, PublicKey};
use crate::transport::{Dispatcher, PendingKey, Transport};
use crate::wire::{self, Message, SIGNATURE_LEN};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Instant;
use swarmveil_common::{protocol, Result, TunnelError};
use tokio::sync::RwLock;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Verified peers gossiped per introduction response
const MAX_GOSSIP_PEERS: usize = 5;

/// Drives the four-step discovery handshake
///
/// introduction-request -> introduction-response -> puncture-request
/// -> puncture. A peer only reaches Verified after its introduction
/// signature checks out against the public key it presented.
pub struct HandshakeDriver {
    identity: Arc<NetworkIdentity>,
    transport: Transport,
    dispatcher: Arc<Dispatcher>,
    directory: Arc<RwLock<PeerDirectory>>,
}

impl HandshakeDriver {
    pub fn new(
        identity: Arc<NetworkIdentity>,
        transport: Transport,
        dispatcher: Arc<Dispatcher>,
        directory: Arc<RwLock<PeerDirectory>>,
    ) -> Self {
        Self {
            identity,
            transport,
            dispatcher,
            directory,
        }
    }

    fn local_v4(&self) -> SocketAddrV4 {
        match self.transport.local_addr() {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(addr) => SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, addr.port()),
        }
    }

    /// Sign a discovery message in place of its zeroed signature field
    fn sign(&self, message: &Message) -> [u8; SIGNATURE_LEN] {
        self.identity.sign(&message.signing_bytes())
    }

    fn verify_signed(message: &Message, public_key: &[u8], signature: &[u8; SIGNATURE_LEN]) -> bool {
        match PublicKey::from_slice(public_key) {
            Ok(key) => key.verify(&message.signing_bytes(), signature),
            Err(_) => false,
        }
    }

    /// Walk to a peer: run the full handshake against `target` and
    /// return its verified ID.
    ///
    /// Each step has its own timeout; a step that misses its window
    /// fails the whole walk and marks the peer Lost, so later
    /// bootstrap rounds skip it until it is rediscovered. The
    /// reachability probe at the end is best-effort and only feeds
    /// the latency estimate.
    pub async fn walk(&self, target: SocketAddrV4, cancel: &CancellationToken) -> Result<PeerId> {
        let local = self.local_v4();
        let identifier: u16 = rand::random();

        // Bootstrap targets are bare addresses; gossiped peers are
        // already listed and flip to InProgress for the exchange.
        {
            let mut directory = self.directory.write().await;
            if let Some(known) = directory.peer_id_at(target) {
                directory.mark_handshake_in_progress(&known);
            }
        }

        let mut request = wire::IntroductionRequest {
            destination: target,
            source_lan: local,
            source_wan: local,
            identifier,
            public_key: self.identity.public_key().as_bytes().to_vec(),
            signature: [0u8; SIGNATURE_LEN],
        };
        let unsigned = Message::IntroductionRequest(request.clone());
        request.signature = self.sign(&unsigned);

        let key = PendingKey::IntroResponse(identifier);
        let reply_rx = self.dispatcher.expect(key);
        self.transport
            .send_message(
                SocketAddr::V4(target),
                &Message::IntroductionRequest(request),
            )
            .await?;

        let step_window = protocol::handshake_step_timeout();
        let reply = tokio::select! {
            _ = cancel.cancelled() => {
                self.dispatcher.cancel(key);
                return Err(TunnelError::Cancelled);
            }
            result = timeout(step_window, reply_rx) => match result {
                Ok(Ok((_, message))) => message,
                Ok(Err(_)) | Err(_) => {
                    self.dispatcher.cancel(key);
                    self.mark_target_lost(target).await;
                    return Err(TunnelError::HandshakeTimeout {
                        peer: target.to_string(),
                        step: "introduction-response",
                    });
                }
            }
        };

        let Message::IntroductionResponse(response) = reply else {
            return Err(TunnelError::format("unexpected reply to introduction"));
        };

        if !Self::verify_signed(
            &Message::IntroductionResponse(response.clone()),
            &response.public_key,
            &response.signature,
        ) {
            warn!(%target, "introduction response failed signature check");
            self.mark_target_lost(target).await;
            return Err(TunnelError::InvalidSignature);
        }

        let Ok(public_key) = PublicKey::from_slice(&response.public_key) else {
            self.mark_target_lost(target).await;
            return Err(TunnelError::InvalidSignature);
        };

        let peer_id = {
            let mut directory = self.directory.write().await;
            let peer_id = directory.upsert_discovered(public_key, target);
            directory.mark_handshake_in_progress(&peer_id);

            // Fold the gossiped peers in as discovery candidates. We
            // may appear in the sample ourselves; skip that entry.
            let own_key = self.identity.public_key().as_bytes();
            for gossiped in &response.peers {
                if gossiped.public_key.as_slice() == own_key {
                    continue;
                }
                if let Ok(key) = PublicKey::from_slice(&gossiped.public_key) {
                    directory.upsert_discovered(key, gossiped.address);
                }
            }
            peer_id
        };

        self.probe_reachability(target, &peer_id, cancel).await;

        self.directory.write().await.mark_verified(&peer_id);
        debug!(peer = %peer_id.short(), %target, "handshake complete");
        Ok(peer_id)
    }

    /// A peer that missed a step window or failed verification is
    /// Lost; bootstrap rounds stop walking to it until something
    /// rediscovers it.
    async fn mark_target_lost(&self, target: SocketAddrV4) {
        let mut directory = self.directory.write().await;
        if let Some(peer_id) = directory.peer_id_at(target) {
            directory.mark_lost(&peer_id);
        }
    }

    /// Ask the peer to puncture back to us and time the round trip.
    /// A missed probe leaves the latency estimate empty but does not
    /// fail verification.
    async fn probe_reachability(
        &self,
        target: SocketAddrV4,
        peer_id: &PeerId,
        cancel: &CancellationToken,
    ) {
        let local = self.local_v4();
        let identifier: u16 = rand::random();
        let key = PendingKey::Puncture(identifier);
        let reply_rx = self.dispatcher.expect(key);

        let request = Message::PunctureRequest(wire::PunctureRequest {
            walker_lan: local,
            walker_wan: local,
            identifier,
        });
        let started = Instant::now();
        if let Err(err) = self.transport.send_message(SocketAddr::V4(target), &request).await {
            debug!(%target, error = %err, "puncture request send failed");
            self.dispatcher.cancel(key);
            return;
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                self.dispatcher.cancel(key);
            }
            result = timeout(protocol::handshake_step_timeout(), reply_rx) => match result {
                Ok(Ok(_)) => {
                    let sample_ms = started.elapsed().as_millis().min(u32::MAX as u128) as u32;
                    self.directory.write().await.record_latency(peer_id, sample_ms);
                    trace!(peer = %peer_id.short(), sample_ms, "reachability probe returned");
                }
                Ok(Err(_)) | Err(_) => {
                    self.dispatcher.cancel(key);
                    debug!(peer = %peer_id.short(), "reachability probe unanswered");
                }
            }
        }
    }

    /// Answer an inbound introduction-request
    ///
    /// Verifies the walker's signature, records it as a peer, and
    /// replies with a signed response carrying a gossip sample of our
    /// verified peers.
    pub async fn respond(&self, from: SocketAddrV4, request: wire::IntroductionRequest) -> Result<()> {
        if !Self::verify_signed(
            &Message::IntroductionRequest(request.clone()),
            &request.public_key,
            &request.signature,
        ) {
            warn!(%from, "introduction request failed signature check");
            return Err(TunnelError::InvalidSignature);
        }

        let walker_key = PublicKey::from_slice(&request.public_key)
            .map_err(|_| TunnelError::InvalidSignature)?;
        let walker_id = PeerId::from_public_key(&walker_key);

        let (gossip, intro_addr) = {
            let mut directory = self.directory.write().await;
            directory.upsert_discovered(walker_key, from);
            directory.mark_verified(&walker_id);

            let verified = directory.verified_peers();
            let gossip: Vec<wire::GossipPeer> = verified
                .iter()
                .filter(|peer| peer.peer_id != walker_id)
                .take(MAX_GOSSIP_PEERS)
                .map(|peer| wire::GossipPeer {
                    address: peer.address,
                    public_key: peer.public_key.as_bytes().to_vec(),
                })
                .collect();
            let intro_addr = gossip.first().map(|peer| peer.address);
            (gossip, intro_addr)
        };

        let local = self.local_v4();
        let unspecified = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
        let mut response = wire::IntroductionResponse {
            destination: from,
            source_lan: local,
            source_wan: local,
            intro_lan: intro_addr.unwrap_or(unspecified),
            intro_wan: intro_addr.unwrap_or(unspecified),
            identifier: request.identifier,
            peers: gossip,
            public_key: self.identity.public_key().as_bytes().to_vec(),
            signature: [0u8; SIGNATURE_LEN],
        };
        let unsigned = Message::IntroductionResponse(response.clone());
        response.signature = self.sign(&unsigned);

        self.transport
            .send_message(
                SocketAddr::V4(from),
                &Message::IntroductionResponse(response),
            )
            .await?;

        // Ask the introduced peer to open a path towards the walker.
        if let Some(intro) = intro_addr {
            let puncture_request = Message::PunctureRequest(wire::PunctureRequest {
                walker_lan: from,
                walker_wan: from,
                identifier: request.identifier,
            });
            if let Err(err) = self
                .transport
                .send_message(SocketAddr::V4(intro), &puncture_request)
                .await
            {
                debug!(%intro, error = %err, "puncture request relay failed");
            }
        }

        trace!(%from, peer = %walker_id.short(), "answered introduction request");
        Ok(())
    }

    /// Answer a puncture-request by probing the walker directly
    pub async fn handle_puncture_request(&self, request: wire::PunctureRequest) -> Result<()> {
        let local = self.local_v4();
        let puncture = Message::Puncture(wire::Puncture {
            source_lan: local,
            source_wan: local,
            identifier: request.identifier,
        });
        self.transport
            .send_message(SocketAddr::V4(request.walker_wan), &puncture)
            .await?;
        Ok(())
    }
}
