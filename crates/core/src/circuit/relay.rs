use super::cell::{CellCommand, SessionCell, MAX_CELL_PAYLOAD};
use super::crypto::{EphemeralKeyPair, LayerCrypto, OnionCrypto};
use crate::bandwidth::ContributionTracker;
use crate::identity::NetworkIdentity;
use crate::transport::{Dispatcher, PendingKey, Transport};
use crate::wire::{self, Message};
use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use swarmveil_common::{protocol, Timestamp};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tracing::{debug, trace, warn};
use x25519_dalek::PublicKey as X25519PublicKey;

/// Next hop of a relayed circuit
#[derive(Debug, Clone, Copy)]
struct NextHop {
    circuit_id: u32,
    address: SocketAddrV4,
}

/// Per-circuit relay state: the layer keys negotiated with the
/// origin and, once extended, where to forward
struct RelayEntry {
    prev: SocketAddrV4,
    forward: LayerCrypto,
    backward: LayerCrypto,
    next: Option<NextHop>,
    last_activity: Timestamp,
}

#[derive(Default)]
struct RelayTable {
    entries: HashMap<u32, RelayEntry>,
    /// next-leg circuit ID back to the origin-facing circuit ID
    reverse: HashMap<u32, u32>,
}

/// Serves relay duty for circuits other nodes originated
///
/// For each relayed circuit this node knows exactly one layer: it
/// peels outbound cells, adds its layer to inbound ones, and never
/// sees either endpoint's payload. As exit it terminates session
/// cells into plain TCP.
pub struct RelayService {
    identity: Arc<NetworkIdentity>,
    transport: Transport,
    dispatcher: Arc<Dispatcher>,
    table: Mutex<RelayTable>,
    /// Exit-side TCP writers, keyed by (circuit, session)
    exit_sessions: Mutex<HashMap<(u32, u16), mpsc::UnboundedSender<Vec<u8>>>>,
    contribution: Arc<ContributionTracker>,
}

impl RelayService {
    pub fn new(
        identity: Arc<NetworkIdentity>,
        transport: Transport,
        dispatcher: Arc<Dispatcher>,
        contribution: Arc<ContributionTracker>,
    ) -> Self {
        Self {
            identity,
            transport,
            dispatcher,
            table: Mutex::new(RelayTable::default()),
            exit_sessions: Mutex::new(HashMap::new()),
            contribution,
        }
    }

    pub async fn circuit_count(&self) -> usize {
        self.table.lock().await.entries.len()
    }

    /// Answer a CREATE: complete the key exchange and confirm it
    pub async fn handle_create(self: &Arc<Self>, from: SocketAddrV4, create: wire::Create) {
        if create.node_public_key != self.identity.public_key().as_bytes() {
            trace!(%from, "create addressed to another keyset, ignoring");
            return;
        }
        let Ok(their_key) = <[u8; 32]>::try_from(create.ephemeral_key.as_slice()) else {
            debug!(%from, "create with malformed ephemeral key");
            return;
        };

        let ephemeral = EphemeralKeyPair::generate();
        let our_public = ephemeral.public_key_bytes();
        let shared = ephemeral.diffie_hellman(&X25519PublicKey::from(their_key));
        let auth = OnionCrypto::derive_auth(&shared);
        let (forward, backward) = OnionCrypto::derive_layers(&shared);

        {
            let mut table = self.table.lock().await;
            table.entries.insert(
                create.circuit_id,
                RelayEntry {
                    prev: from,
                    forward,
                    backward,
                    next: None,
                    last_activity: Timestamp::now(),
                },
            );
        }
        debug!(circuit = create.circuit_id, %from, "relaying new circuit");

        let created = Message::Created(wire::Created {
            circuit_id: create.circuit_id,
            identifier: create.identifier,
            ephemeral_key: our_public.to_vec(),
            auth: auth.to_vec(),
            candidates: vec![],
        });
        if let Err(err) = self
            .transport
            .send_message(SocketAddr::V4(from), &created)
            .await
        {
            debug!(%from, error = %err, "created send failed");
        }
    }

    /// Process a DATA cell for a relayed circuit. Returns false when
    /// the circuit is not in the relay table.
    pub async fn handle_data(self: &Arc<Self>, from: SocketAddrV4, data: wire::Data) -> bool {
        // Inbound from the next hop: add our layer, pass towards the
        // origin.
        let backward_pass = {
            let mut table = self.table.lock().await;
            match table.reverse.get(&data.circuit_id).copied() {
                Some(origin_cid) => {
                    let entry = table.entries.get_mut(&origin_cid);
                    entry.map(|entry| {
                        entry.last_activity = Timestamp::now();
                        (
                            origin_cid,
                            entry.prev,
                            entry.backward.encrypt(&data.payload),
                        )
                    })
                }
                None => None,
            }
        };
        if let Some((origin_cid, prev, sealed)) = backward_pass {
            let Ok(sealed) = sealed else {
                warn!(circuit = origin_cid, "backward seal failed, dropping cell");
                return true;
            };
            self.contribution.record_relayed(sealed.len() as u64);
            let reply = Message::Data(wire::Data {
                circuit_id: origin_cid,
                payload: sealed,
            });
            let _ = self.transport.send_message(SocketAddr::V4(prev), &reply).await;
            return true;
        }

        // Outbound from the origin side: peel our layer.
        let peeled = {
            let mut table = self.table.lock().await;
            let Some(entry) = table.entries.get_mut(&data.circuit_id) else {
                return false;
            };
            if entry.prev != from {
                debug!(circuit = data.circuit_id, %from, "data cell from unexpected peer");
                return true;
            }
            entry.last_activity = Timestamp::now();
            let peeled = entry.forward.decrypt(&data.payload);
            let next = entry.next;
            (peeled, next)
        };

        let (peeled, next) = peeled;
        let Ok(peeled) = peeled else {
            warn!(circuit = data.circuit_id, "failed to peel relay layer, dropping cell");
            return true;
        };

        if let Some(next) = next {
            // Middle relay: pass it along unexamined.
            self.contribution.record_relayed(peeled.len() as u64);
            let forwarded = Message::Data(wire::Data {
                circuit_id: next.circuit_id,
                payload: peeled,
            });
            let _ = self
                .transport
                .send_message(SocketAddr::V4(next.address), &forwarded)
                .await;
            return true;
        }

        // We are the last hop; the peeled bytes are a message for us.
        match Message::decode(&peeled) {
            Ok(Message::Extend(extend)) => self.handle_extend(data.circuit_id, extend).await,
            Ok(Message::Ping(ping)) => self.answer_ping(data.circuit_id, ping).await,
            Ok(Message::Data(inner)) => self.handle_exit_cell(data.circuit_id, inner).await,
            Ok(other) => {
                debug!(circuit = data.circuit_id, kind = ?other.kind(), "unexpected inner message");
            }
            Err(err) => {
                debug!(circuit = data.circuit_id, error = %err, "undecodable inner cell");
            }
        }
        true
    }

    /// Tear down a relayed circuit on DESTROY from either side
    pub async fn handle_destroy(self: &Arc<Self>, destroy: wire::Destroy) {
        let mut table = self.table.lock().await;
        let origin_cid = table
            .reverse
            .get(&destroy.circuit_id)
            .copied()
            .unwrap_or(destroy.circuit_id);

        if let Some(entry) = table.entries.remove(&origin_cid) {
            if let Some(next) = entry.next {
                table.reverse.remove(&next.circuit_id);
            }
            debug!(circuit = origin_cid, "relayed circuit destroyed");
        }
        drop(table);

        let mut sessions = self.exit_sessions.lock().await;
        sessions.retain(|&(cid, _), _| cid != origin_cid);
    }

    /// Sweep relay entries that have gone quiet
    pub async fn sweep(&self) {
        let mut table = self.table.lock().await;
        let doomed: Vec<u32> = table
            .entries
            .iter()
            .filter(|(_, entry)| {
                entry.last_activity.elapsed().as_secs() > protocol::PEER_STALE_SECS
            })
            .map(|(&cid, _)| cid)
            .collect();

        for cid in doomed {
            if let Some(entry) = table.entries.remove(&cid) {
                if let Some(next) = entry.next {
                    table.reverse.remove(&next.circuit_id);
                }
                debug!(circuit = cid, "idle relay entry swept");
            }
        }
    }

    /// Extend the circuit: open the next leg with a CREATE carrying
    /// the origin's ephemeral key, then relay the confirmation back.
    async fn handle_extend(self: &Arc<Self>, circuit_id: u32, extend: wire::Extend) {
        let next_cid: u32 = {
            use rand::Rng;
            rand::thread_rng().gen_range(1..=u32::MAX)
        };

        let key = PendingKey::Created(next_cid, extend.identifier);
        let reply_rx = self.dispatcher.expect(key);

        let create = Message::Create(wire::Create {
            circuit_id: next_cid,
            identifier: extend.identifier,
            node_public_key: extend.node_public_key,
            ephemeral_key: extend.ephemeral_key,
        });
        if let Err(err) = self
            .transport
            .send_message(SocketAddr::V4(extend.node_addr), &create)
            .await
        {
            debug!(circuit = circuit_id, error = %err, "extend create send failed");
            self.dispatcher.cancel(key);
            return;
        }

        let service = Arc::clone(self);
        let next_addr = extend.node_addr;
        let identifier = extend.identifier;
        tokio::spawn(async move {
            let created = match timeout(protocol::handshake_step_timeout(), reply_rx).await {
                Ok(Ok((_, Message::Created(created)))) => created,
                _ => {
                    service.dispatcher.cancel(key);
                    debug!(circuit = circuit_id, "extension target never answered");
                    return;
                }
            };

            let extended = Message::Extended(wire::Extended {
                circuit_id,
                identifier,
                ephemeral_key: created.ephemeral_key,
                auth: created.auth,
                candidates: created.candidates,
            });

            let reply = {
                let mut table = service.table.lock().await;
                let Some(entry) = table.entries.get_mut(&circuit_id) else {
                    return;
                };
                entry.next = Some(NextHop {
                    circuit_id: next_cid,
                    address: next_addr,
                });
                let prev = entry.prev;
                let sealed = entry.backward.encrypt(&extended.encode());
                table.reverse.insert(next_cid, circuit_id);
                (prev, sealed)
            };

            let (prev, sealed) = reply;
            let Ok(sealed) = sealed else {
                return;
            };
            debug!(circuit = circuit_id, next = next_cid, "circuit extended");
            let message = Message::Data(wire::Data {
                circuit_id,
                payload: sealed,
            });
            let _ = service
                .transport
                .send_message(SocketAddr::V4(prev), &message)
                .await;
        });
    }

    async fn answer_ping(self: &Arc<Self>, circuit_id: u32, ping: wire::Ping) {
        let pong = Message::Pong(wire::Pong {
            circuit_id,
            identifier: ping.identifier,
        });
        self.reply_backward(circuit_id, &pong.encode()).await;
    }

    /// Exit duty: terminate session cells into TCP connections
    async fn handle_exit_cell(self: &Arc<Self>, circuit_id: u32, inner: wire::Data) {
        let cell = match SessionCell::decode(&inner.payload) {
            Ok(cell) => cell,
            Err(err) => {
                debug!(circuit = circuit_id, error = %err, "bad session cell");
                return;
            }
        };

        match cell.command {
            CellCommand::Connect => self.open_exit_session(circuit_id, cell).await,
            CellCommand::Data => {
                self.contribution.record_relayed(cell.payload.len() as u64);
                let sessions = self.exit_sessions.lock().await;
                if let Some(tx) = sessions.get(&(circuit_id, cell.session)) {
                    let _ = tx.send(cell.payload);
                }
            }
            CellCommand::End => {
                let mut sessions = self.exit_sessions.lock().await;
                sessions.remove(&(circuit_id, cell.session));
            }
            CellCommand::ConnectOk | CellCommand::ConnectFail => {
                debug!(circuit = circuit_id, "origin-bound command at exit, dropping");
            }
        }
    }

    async fn open_exit_session(self: &Arc<Self>, circuit_id: u32, cell: SessionCell) {
        let session = cell.session;
        let Ok(dest) = cell.connect_destination() else {
            self.send_session_reply(circuit_id, session, CellCommand::ConnectFail)
                .await;
            return;
        };

        let service = Arc::clone(self);
        tokio::spawn(async move {
            let connected = timeout(
                protocol::handshake_step_timeout(),
                TcpStream::connect(SocketAddr::V4(dest)),
            )
            .await;

            let stream = match connected {
                Ok(Ok(stream)) => stream,
                _ => {
                    debug!(circuit = circuit_id, session, "exit connect failed");
                    service
                        .send_session_reply(circuit_id, session, CellCommand::ConnectFail)
                        .await;
                    return;
                }
            };

            let (mut read_half, mut write_half) = stream.into_split();
            let (write_tx, mut write_rx) = mpsc::unbounded_channel::<Vec<u8>>();
            service
                .exit_sessions
                .lock()
                .await
                .insert((circuit_id, session), write_tx);
            service
                .send_session_reply(circuit_id, session, CellCommand::ConnectOk)
                .await;

            // Writer: origin cells into the TCP stream.
            tokio::spawn(async move {
                use tokio::io::AsyncWriteExt;
                while let Some(chunk) = write_rx.recv().await {
                    if write_half.write_all(&chunk).await.is_err() {
                        break;
                    }
                }
                let _ = write_half.shutdown().await;
            });

            // Reader: TCP stream back to the origin as session cells.
            let reader_service = Arc::clone(&service);
            tokio::spawn(async move {
                use tokio::io::AsyncReadExt;
                let mut buf = vec![0u8; MAX_CELL_PAYLOAD];
                loop {
                    match read_half.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(len) => {
                            reader_service.contribution.record_relayed(len as u64);
                            let cell =
                                SessionCell::new(session, CellCommand::Data, buf[..len].to_vec());
                            reader_service
                                .send_session_cell(circuit_id, &cell)
                                .await;
                        }
                    }
                }
                let end = SessionCell::new(session, CellCommand::End, vec![]);
                reader_service.send_session_cell(circuit_id, &end).await;
                reader_service
                    .exit_sessions
                    .lock()
                    .await
                    .remove(&(circuit_id, session));
            });
        });
    }

    async fn send_session_reply(&self, circuit_id: u32, session: u16, command: CellCommand) {
        let cell = SessionCell::new(session, command, vec![]);
        self.send_session_cell(circuit_id, &cell).await;
    }

    async fn send_session_cell(&self, circuit_id: u32, cell: &SessionCell) {
        let inner = Message::Data(wire::Data {
            circuit_id,
            payload: cell.encode(),
        });
        self.reply_backward(circuit_id, &inner.encode()).await;
    }

    /// Seal bytes with our backward layer and send towards the origin
    async fn reply_backward(&self, circuit_id: u32, plaintext: &[u8]) {
        let reply = {
            let mut table = self.table.lock().await;
            let Some(entry) = table.entries.get_mut(&circuit_id) else {
                return;
            };
            (entry.prev, entry.backward.encrypt(plaintext))
        };

        let (prev, sealed) = reply;
        let Ok(sealed) = sealed else {
            warn!(circuit = circuit_id, "backward seal failed");
            return;
        };
        let message = Message::Data(wire::Data {
            circuit_id,
            payload: sealed,
        });
        let _ = self
            .transport
            .send_message(SocketAddr::V4(prev), &message)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::types::{Circuit, HopNode};
    use crate::identity::PeerId;
    use crate::transport::{CircuitRouter, MemoryRouter};
    use std::net::Ipv4Addr;

    fn addr(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), port)
    }

    /// Spin up a full relay node on the in-memory network: frames in,
    /// relay logic, frames out.
    fn spawn_relay(net: &Arc<MemoryRouter>, port: u16, seed: u8) -> Arc<RelayService> {
        let (transport, mut inbound) = net.attach(SocketAddr::V4(addr(port)));
        let identity = Arc::new(NetworkIdentity::from_seed(&[seed; 32]));
        let (dispatcher, mut events) = Dispatcher::new();
        let dispatcher = Arc::new(dispatcher);
        let service = Arc::new(RelayService::new(
            identity,
            transport,
            Arc::clone(&dispatcher),
            Arc::new(ContributionTracker::new(true)),
        ));

        tokio::spawn(async move {
            while let Some((from, frame)) = inbound.recv().await {
                dispatcher.handle_frame(from, &frame);
            }
        });

        let event_service = Arc::clone(&service);
        tokio::spawn(async move {
            use crate::transport::Event;
            while let Some(Event::Message { from, message }) = events.recv().await {
                let SocketAddr::V4(from) = from else { continue };
                match message {
                    Message::Create(create) => event_service.handle_create(from, create).await,
                    Message::Data(data) => {
                        event_service.handle_data(from, data).await;
                    }
                    Message::Destroy(destroy) => event_service.handle_destroy(destroy).await,
                    _ => {}
                }
            }
        });

        service
    }

    /// Origin helper: run the builder against scripted relays
    async fn build_circuit(
        net: &Arc<MemoryRouter>,
        relay_identities: &[(u16, Arc<NetworkIdentity>)],
    ) -> (
        Circuit,
        tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>,
        Transport,
    ) {
        use crate::circuit::build::CircuitBuilder;
        use crate::circuit::path::PathHop;
        use tokio_util::sync::CancellationToken;

        let (transport, mut inbound) = net.attach(SocketAddr::V4(addr(1000)));
        let (dispatcher, _events) = Dispatcher::new();
        let dispatcher = Arc::new(dispatcher);
        let router = Arc::new(CircuitRouter::new());

        // Pump: replies to pending keys, onion cells to the router.
        let pump_dispatcher = Arc::clone(&dispatcher);
        let pump_router = Arc::clone(&router);
        tokio::spawn(async move {
            let _events = _events;
            while let Some((from, frame)) = inbound.recv().await {
                if let Ok(Message::Data(data)) = Message::decode(&frame) {
                    if pump_router.route(data.circuit_id, data.payload) {
                        continue;
                    }
                }
                pump_dispatcher.handle_frame(from, &frame);
            }
        });

        let path: Vec<PathHop> = relay_identities
            .iter()
            .map(|(port, identity)| PathHop {
                peer_id: identity.peer_id(),
                public_key: identity.public_key(),
                address: addr(*port),
            })
            .collect();

        let builder = CircuitBuilder::new(transport.clone(), dispatcher, router);
        let outcome = builder
            .build(
                path,
                std::time::Duration::from_secs(5),
                std::time::Duration::from_secs(30),
                &CancellationToken::new(),
            )
            .await
            .expect("circuit build against live relays");

        (outcome.circuit, outcome.raw_inbound, transport)
    }

    fn relay_identity(seed: u8) -> Arc<NetworkIdentity> {
        Arc::new(NetworkIdentity::from_seed(&[seed; 32]))
    }

    #[tokio::test]
    async fn test_create_registers_relay_circuit() {
        let net = MemoryRouter::new();
        let relay = spawn_relay(&net, 2000, 2);
        let identity = relay_identity(2);

        let (_, _, _transport) = build_circuit(&net, &[(2000, identity)]).await;
        assert_eq!(relay.circuit_count().await, 1);
    }

    #[tokio::test]
    async fn test_three_hop_build_through_live_relays() {
        let net = MemoryRouter::new();
        let _relay_a = spawn_relay(&net, 2000, 2);
        let _relay_b = spawn_relay(&net, 3000, 3);
        let _relay_c = spawn_relay(&net, 4000, 4);

        let (circuit, _, _) = build_circuit(
            &net,
            &[
                (2000, relay_identity(2)),
                (3000, relay_identity(3)),
                (4000, relay_identity(4)),
            ],
        )
        .await;

        assert_eq!(circuit.hop_count(), 3);
        assert!(circuit.is_established());
    }

    #[tokio::test]
    async fn test_end_to_end_ping_through_three_hops() {
        let net = MemoryRouter::new();
        spawn_relay(&net, 2000, 2);
        spawn_relay(&net, 3000, 3);
        spawn_relay(&net, 4000, 4);

        let (mut circuit, mut raw_inbound, transport) = build_circuit(
            &net,
            &[
                (2000, relay_identity(2)),
                (3000, relay_identity(3)),
                (4000, relay_identity(4)),
            ],
        )
        .await;

        let ping = Message::Ping(wire::Ping {
            circuit_id: circuit.id.as_u32(),
            identifier: 99,
        });
        let onion = {
            let mut layers = circuit.forward_layers_mut();
            OnionCrypto::encrypt_onion(&mut layers, &ping.encode()).unwrap()
        };
        transport
            .send_message(
                SocketAddr::V4(circuit.entry_hop().unwrap().address),
                &Message::Data(wire::Data {
                    circuit_id: circuit.id.as_u32(),
                    payload: onion,
                }),
            )
            .await
            .unwrap();

        let raw = tokio::time::timeout(std::time::Duration::from_secs(5), raw_inbound.recv())
            .await
            .unwrap()
            .unwrap();
        let peeled = {
            let mut layers = circuit.backward_layers_mut();
            OnionCrypto::peel_onion(&mut layers, &raw).unwrap()
        };
        let Message::Pong(pong) = Message::decode(&peeled).unwrap() else {
            panic!("expected pong");
        };
        assert_eq!(pong.identifier, 99);
    }

    #[tokio::test]
    async fn test_destroy_clears_relay_state() {
        let net = MemoryRouter::new();
        let relay = spawn_relay(&net, 2000, 2);

        let (circuit, _raw, transport) = build_circuit(&net, &[(2000, relay_identity(2))]).await;
        assert_eq!(relay.circuit_count().await, 1);

        transport
            .send_message(
                SocketAddr::V4(addr(2000)),
                &Message::Destroy(wire::Destroy {
                    circuit_id: circuit.id.as_u32(),
                    reason: 0,
                }),
            )
            .await
            .unwrap();

        // Let the relay's event loop run.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(relay.circuit_count().await, 0);
    }

    #[tokio::test]
    async fn test_create_for_foreign_keyset_ignored() {
        let net = MemoryRouter::new();
        let relay = spawn_relay(&net, 2000, 2);
        let (transport, _inbound) = net.attach(SocketAddr::V4(addr(1000)));

        let create = Message::Create(wire::Create {
            circuit_id: 77,
            identifier: 1,
            node_public_key: vec![9u8; 32],
            ephemeral_key: vec![8u8; 32],
        });
        transport
            .send_message(SocketAddr::V4(addr(2000)), &create)
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(relay.circuit_count().await, 0);
    }

    #[test]
    fn test_hop_node_debug_hides_nothing_sensitive() {
        // HopNode's Debug goes through LayerCrypto's manual impl; the
        // key material never appears.
        let keypair = crate::identity::KeyPair::generate();
        let ours = EphemeralKeyPair::generate();
        let theirs = EphemeralKeyPair::generate();
        let their_public = *theirs.public_key();
        let (forward, backward) = OnionCrypto::derive_layers(&ours.diffie_hellman(&their_public));

        let hop = HopNode::new(
            PeerId::from_public_key(&keypair.public_key()),
            keypair.public_key(),
            addr(2000),
            forward,
            backward,
        );
        let output = format!("{:?}", hop);
        assert!(output.contains("<ChaCha20Poly1305>"));
    }
}
