use super::crypto::{EphemeralKeyPair, OnionCrypto};
use super::path::PathHop;
use super::types::{Circuit, CircuitId, HopNode};
use crate::identity::PeerId;
use crate::transport::{CircuitRouter, Dispatcher, PendingKey, Transport};
use crate::wire::{self, Message};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use swarmveil_common::TunnelError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use x25519_dalek::PublicKey as X25519PublicKey;

/// A failed build, naming the hop that broke it so the caller can
/// penalize the right peer
#[derive(Debug)]
pub struct BuildFailure {
    pub failed_hop: Option<PeerId>,
    pub error: TunnelError,
}

impl BuildFailure {
    fn at(hop: &PathHop, error: TunnelError) -> Self {
        Self {
            failed_hop: Some(hop.peer_id),
            error,
        }
    }
}

/// A freshly established circuit plus the inbound cell stream the
/// builder consumed during construction. The caller hands the stream
/// to the circuit's demux task.
#[derive(Debug)]
pub struct BuildOutcome {
    pub circuit: Circuit,
    pub raw_inbound: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// Builds circuits hop by hop
///
/// The first hop is negotiated with a plain CREATE; every further hop
/// with an EXTEND tunnelled through the layers that already exist, so
/// relay N+1 only ever talks to relay N. A failure at any hop aborts
/// the whole build and discards all partial key material.
pub struct CircuitBuilder {
    transport: Transport,
    dispatcher: Arc<Dispatcher>,
    router: Arc<CircuitRouter>,
}

impl CircuitBuilder {
    pub fn new(transport: Transport, dispatcher: Arc<Dispatcher>, router: Arc<CircuitRouter>) -> Self {
        Self {
            transport,
            dispatcher,
            router,
        }
    }

    pub async fn build(
        &self,
        path: Vec<PathHop>,
        step_timeout: Duration,
        overall_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<BuildOutcome, BuildFailure> {
        let circuit_id = CircuitId::generate();
        let mut circuit = Circuit::new(circuit_id, path.len());
        let mut raw_inbound = self.router.register(circuit_id.as_u32());
        let deadline = Instant::now() + overall_timeout;

        debug!(%circuit_id, hops = path.len(), "building circuit");

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(BuildFailure {
                failed_hop: None,
                error: TunnelError::Cancelled,
            }),
            result = self.extend_all(&mut circuit, &path, &mut raw_inbound, step_timeout, deadline) => result,
        };

        match result {
            Ok(()) => {
                if !circuit.mark_established() {
                    self.router.unregister(circuit_id.as_u32());
                    return Err(BuildFailure {
                        failed_hop: None,
                        error: TunnelError::establishment(
                            "circuit incomplete after build",
                        ),
                    });
                }
                info!(%circuit_id, hops = circuit.hop_count(), "circuit established");
                Ok(BuildOutcome {
                    circuit,
                    raw_inbound,
                })
            }
            Err(failure) => {
                // All partial hop state dies with the circuit.
                self.router.unregister(circuit_id.as_u32());
                warn!(%circuit_id, error = %failure.error, "circuit build failed");
                Err(failure)
            }
        }
    }

    async fn extend_all(
        &self,
        circuit: &mut Circuit,
        path: &[PathHop],
        raw_inbound: &mut mpsc::UnboundedReceiver<Vec<u8>>,
        step_timeout: Duration,
        deadline: Instant,
    ) -> Result<(), BuildFailure> {
        for (index, hop) in path.iter().enumerate() {
            let step_deadline = deadline.min(Instant::now() + step_timeout);
            if index == 0 {
                self.create_first_hop(circuit, hop, step_deadline).await?;
            } else {
                self.extend_to_hop(circuit, hop, raw_inbound, step_deadline)
                    .await?;
            }
            debug!(circuit = %circuit.id, hop = index + 1, peer = %hop.peer_id.short(), "hop keyed");
        }
        Ok(())
    }

    async fn create_first_hop(
        &self,
        circuit: &mut Circuit,
        hop: &PathHop,
        step_deadline: Instant,
    ) -> Result<(), BuildFailure> {
        let ephemeral = EphemeralKeyPair::generate();
        let identifier: u16 = rand::random();

        let key = PendingKey::Created(circuit.id.as_u32(), identifier);
        let reply_rx = self.dispatcher.expect(key);

        let create = Message::Create(wire::Create {
            circuit_id: circuit.id.as_u32(),
            identifier,
            node_public_key: hop.public_key.as_bytes().to_vec(),
            ephemeral_key: ephemeral.public_key_bytes().to_vec(),
        });
        if let Err(err) = self
            .transport
            .send_message(SocketAddr::V4(hop.address), &create)
            .await
        {
            self.dispatcher.cancel(key);
            return Err(BuildFailure::at(hop, err.into()));
        }

        let created = match timeout_at(step_deadline, reply_rx).await {
            Ok(Ok((_, Message::Created(created)))) => created,
            Ok(Ok(_)) => {
                return Err(BuildFailure::at(
                    hop,
                    TunnelError::establishment("unexpected reply to create"),
                ));
            }
            Ok(Err(_)) | Err(_) => {
                self.dispatcher.cancel(key);
                return Err(BuildFailure::at(hop, TunnelError::Timeout));
            }
        };

        let hop_node = Self::key_hop(hop, ephemeral, &created.ephemeral_key, &created.auth)?;
        circuit.push_hop(hop_node);
        Ok(())
    }

    async fn extend_to_hop(
        &self,
        circuit: &mut Circuit,
        hop: &PathHop,
        raw_inbound: &mut mpsc::UnboundedReceiver<Vec<u8>>,
        step_deadline: Instant,
    ) -> Result<(), BuildFailure> {
        let ephemeral = EphemeralKeyPair::generate();
        let identifier: u16 = rand::random();

        let extend = Message::Extend(wire::Extend {
            circuit_id: circuit.id.as_u32(),
            identifier,
            node_public_key: hop.public_key.as_bytes().to_vec(),
            ephemeral_key: ephemeral.public_key_bytes().to_vec(),
            node_addr: hop.address,
        });

        let onion = {
            let mut layers = circuit.forward_layers_mut();
            OnionCrypto::encrypt_onion(&mut layers, &extend.encode())
                .map_err(|err| BuildFailure::at(hop, anyhow::Error::from(err).into()))?
        };

        let entry_addr = circuit
            .entry_hop()
            .map(|entry| entry.address)
            .ok_or_else(|| {
                BuildFailure::at(
                    hop,
                    TunnelError::establishment("extend with no entry hop"),
                )
            })?;

        let data = Message::Data(wire::Data {
            circuit_id: circuit.id.as_u32(),
            payload: onion,
        });
        self.transport
            .send_message(SocketAddr::V4(entry_addr), &data)
            .await
            .map_err(|err| BuildFailure::at(hop, err.into()))?;

        let raw = match timeout_at(step_deadline, raw_inbound.recv()).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                return Err(BuildFailure::at(
                    hop,
                    TunnelError::establishment("inbound channel closed"),
                ));
            }
            Err(_) => {
                return Err(BuildFailure::at(hop, TunnelError::Timeout));
            }
        };

        let peeled = {
            let mut layers = circuit.backward_layers_mut();
            OnionCrypto::peel_onion(&mut layers, &raw)
                .map_err(|err| BuildFailure::at(hop, anyhow::Error::from(err).into()))?
        };

        let extended = match Message::decode(&peeled) {
            Ok(Message::Extended(extended)) if extended.identifier == identifier => extended,
            Ok(_) => {
                return Err(BuildFailure::at(
                    hop,
                    TunnelError::establishment("unexpected reply to extend"),
                ));
            }
            Err(err) => {
                return Err(BuildFailure::at(
                    hop,
                    TunnelError::format(err.to_string()),
                ));
            }
        };

        let hop_node = Self::key_hop(hop, ephemeral, &extended.ephemeral_key, &extended.auth)?;
        circuit.push_hop(hop_node);
        Ok(())
    }

    /// Complete the key exchange with a hop and verify its
    /// key-confirmation tag before trusting the layer.
    fn key_hop(
        hop: &PathHop,
        ephemeral: EphemeralKeyPair,
        their_ephemeral: &[u8],
        auth: &[u8],
    ) -> Result<HopNode, BuildFailure> {
        let their_key: [u8; 32] = their_ephemeral.try_into().map_err(|_| {
            BuildFailure::at(
                hop,
                TunnelError::establishment("bad ephemeral key length"),
            )
        })?;

        let shared = ephemeral.diffie_hellman(&X25519PublicKey::from(their_key));
        let expected_auth = OnionCrypto::derive_auth(&shared);
        if auth != expected_auth {
            return Err(BuildFailure::at(
                hop,
                TunnelError::establishment("key confirmation mismatch"),
            ));
        }

        let (forward, backward) = OnionCrypto::derive_layers(&shared);
        Ok(HopNode::new(
            hop.peer_id,
            hop.public_key,
            hop.address,
            forward,
            backward,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::types::CircuitState;
    use crate::identity::KeyPair;
    use crate::transport::MemoryRouter;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn addr(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), port)
    }

    fn hop_for(keypair: &KeyPair, port: u16) -> PathHop {
        PathHop {
            peer_id: crate::identity::PeerId::from_public_key(&keypair.public_key()),
            public_key: keypair.public_key(),
            address: addr(port),
        }
    }

    struct BuilderHarness {
        builder: CircuitBuilder,
        dispatcher: Arc<Dispatcher>,
        router: Arc<CircuitRouter>,
        inbound: crate::transport::Inbound,
        _events: tokio::sync::mpsc::UnboundedReceiver<crate::transport::Event>,
    }

    fn harness(net: &Arc<MemoryRouter>) -> BuilderHarness {
        let (transport, inbound) = net.attach(SocketAddr::V4(addr(1000)));
        let (dispatcher, events) = Dispatcher::new();
        let dispatcher = Arc::new(dispatcher);
        let router = Arc::new(CircuitRouter::new());
        BuilderHarness {
            builder: CircuitBuilder::new(transport, Arc::clone(&dispatcher), Arc::clone(&router)),
            dispatcher,
            router,
            inbound,
            _events: events,
        }
    }

    /// A scripted relay that answers CREATE with a valid CREATED
    fn spawn_honest_relay(
        net: &Arc<MemoryRouter>,
        port: u16,
    ) {
        let (transport, mut inbound) = net.attach(SocketAddr::V4(addr(port)));
        tokio::spawn(async move {
            while let Some((from, frame)) = inbound.recv().await {
                if let Ok(Message::Create(create)) = Message::decode(&frame) {
                    let ephemeral = EphemeralKeyPair::generate();
                    let their_key: [u8; 32] = create.ephemeral_key.as_slice().try_into().unwrap();
                    let our_public = ephemeral.public_key_bytes();
                    let shared = ephemeral.diffie_hellman(&X25519PublicKey::from(their_key));

                    let created = Message::Created(wire::Created {
                        circuit_id: create.circuit_id,
                        identifier: create.identifier,
                        ephemeral_key: our_public.to_vec(),
                        auth: OnionCrypto::derive_auth(&shared).to_vec(),
                        candidates: vec![],
                    });
                    transport.send_message(from, &created).await.unwrap();
                }
            }
        });
    }

    #[tokio::test]
    async fn test_single_hop_build() {
        let net = MemoryRouter::new();
        let harness = harness(&net);
        let relay_key = KeyPair::generate();
        spawn_honest_relay(&net, 2000);

        // Feed received frames to the dispatcher.
        let dispatcher = Arc::clone(&harness.dispatcher);
        let mut inbound = harness.inbound;
        tokio::spawn(async move {
            while let Some((from, frame)) = inbound.recv().await {
                dispatcher.handle_frame(from, &frame);
            }
        });

        let cancel = CancellationToken::new();
        let outcome = harness
            .builder
            .build(
                vec![hop_for(&relay_key, 2000)],
                Duration::from_secs(5),
                Duration::from_secs(30),
                &cancel,
            )
            .await
            .unwrap();

        assert_eq!(outcome.circuit.state, CircuitState::Established);
        assert_eq!(outcome.circuit.hop_count(), 1);
        assert_eq!(outcome.circuit.entry_hop().unwrap().address, addr(2000));
    }

    #[tokio::test]
    async fn test_build_times_out_against_silent_relay() {
        tokio::time::pause();

        let net = MemoryRouter::new();
        let harness = harness(&net);
        let relay_key = KeyPair::generate();

        let cancel = CancellationToken::new();
        let failure = harness
            .builder
            .build(
                vec![hop_for(&relay_key, 9999)],
                Duration::from_secs(5),
                Duration::from_secs(30),
                &cancel,
            )
            .await
            .unwrap_err();

        assert_eq!(
            failure.failed_hop,
            Some(crate::identity::PeerId::from_public_key(&relay_key.public_key()))
        );
        assert!(matches!(
            failure.error,
            TunnelError::Timeout
        ));
    }

    #[tokio::test]
    async fn test_bad_auth_tag_aborts_build() {
        let net = MemoryRouter::new();
        let harness = harness(&net);
        let relay_key = KeyPair::generate();

        // A relay that completes the exchange but lies about the
        // shared secret.
        let (relay_transport, mut relay_inbound) = net.attach(SocketAddr::V4(addr(3000)));
        tokio::spawn(async move {
            while let Some((from, frame)) = relay_inbound.recv().await {
                if let Ok(Message::Create(create)) = Message::decode(&frame) {
                    let created = Message::Created(wire::Created {
                        circuit_id: create.circuit_id,
                        identifier: create.identifier,
                        ephemeral_key: vec![7u8; 32],
                        auth: vec![0u8; 32],
                        candidates: vec![],
                    });
                    relay_transport.send_message(from, &created).await.unwrap();
                }
            }
        });

        let dispatcher = Arc::clone(&harness.dispatcher);
        let mut inbound = harness.inbound;
        tokio::spawn(async move {
            while let Some((from, frame)) = inbound.recv().await {
                dispatcher.handle_frame(from, &frame);
            }
        });

        let cancel = CancellationToken::new();
        let failure = harness
            .builder
            .build(
                vec![hop_for(&relay_key, 3000)],
                Duration::from_secs(5),
                Duration::from_secs(30),
                &cancel,
            )
            .await
            .unwrap_err();

        assert!(failure.error.to_string().contains("key confirmation"));
    }

    #[tokio::test]
    async fn test_cancelled_build() {
        let net = MemoryRouter::new();
        let harness = harness(&net);
        let relay_key = KeyPair::generate();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let failure = harness
            .builder
            .build(
                vec![hop_for(&relay_key, 2000)],
                Duration::from_secs(5),
                Duration::from_secs(30),
                &cancel,
            )
            .await
            .unwrap_err();

        assert!(matches!(
            failure.error,
            TunnelError::Cancelled
        ));
    }
}
