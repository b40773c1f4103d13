use super::crypto::OnionCrypto;
use super::types::{Circuit, CircuitId, CircuitState};
use crate::wire::{self, Message};
use std::collections::HashMap;
use std::net::SocketAddrV4;
use swarmveil_common::{Result, TunnelError};
use tracing::{debug, info};

/// Teardown reason carried in DESTROY
pub mod destroy_reason {
    pub const FINISHED: u8 = 0;
    pub const UNHEALTHY: u8 = 1;
    pub const EXPIRED: u8 = 2;
    pub const SHUTDOWN: u8 = 3;
}

/// Owns every circuit this node originated
///
/// The manager is the single place circuit state is mutated; callers
/// reach it behind a lock. Layer counters live inside the circuits,
/// so all onion sealing and peeling funnels through here too.
pub struct CircuitManager {
    circuits: HashMap<CircuitId, Circuit>,
}

impl CircuitManager {
    pub fn new() -> Self {
        Self {
            circuits: HashMap::new(),
        }
    }

    pub fn insert(&mut self, circuit: Circuit) {
        debug!(circuit = %circuit.id, "circuit registered");
        self.circuits.insert(circuit.id, circuit);
    }

    pub fn get(&self, id: CircuitId) -> Option<&Circuit> {
        self.circuits.get(&id)
    }

    pub fn get_mut(&mut self, id: CircuitId) -> Option<&mut Circuit> {
        self.circuits.get_mut(&id)
    }

    pub fn contains(&self, id: CircuitId) -> bool {
        self.circuits.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.circuits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.circuits.is_empty()
    }

    pub fn ids(&self) -> Vec<CircuitId> {
        self.circuits.keys().copied().collect()
    }

    pub fn established_ids(&self) -> Vec<CircuitId> {
        self.circuits
            .values()
            .filter(|circuit| circuit.is_established())
            .map(|circuit| circuit.id)
            .collect()
    }

    /// Seal an inner message in every layer of the circuit and wrap
    /// it as a DATA cell addressed to the entry hop.
    pub fn seal_outbound(
        &mut self,
        id: CircuitId,
        inner: &Message,
    ) -> Result<(SocketAddrV4, Message)> {
        let circuit = self
            .circuits
            .get_mut(&id)
            .ok_or_else(|| TunnelError::unavailable(format!("unknown circuit {id}")))?;
        if !circuit.is_established() {
            return Err(TunnelError::unavailable(format!("{id} not established")));
        }

        let entry = circuit
            .entry_hop()
            .map(|hop| hop.address)
            .ok_or_else(|| TunnelError::unavailable(format!("{id} has no entry hop")))?;

        let plaintext = inner.encode();
        let onion = {
            let mut layers = circuit.forward_layers_mut();
            OnionCrypto::encrypt_onion(&mut layers, &plaintext)
                .map_err(|err| TunnelError::Other(err.into()))?
        };
        circuit.add_sent(onion.len() as u64);

        Ok((
            entry,
            Message::Data(wire::Data {
                circuit_id: id.as_u32(),
                payload: onion,
            }),
        ))
    }

    /// Peel every backward layer off an inbound cell and decode the
    /// inner message.
    pub fn peel_inbound(&mut self, id: CircuitId, raw: &[u8]) -> Result<Message> {
        let circuit = self
            .circuits
            .get_mut(&id)
            .ok_or_else(|| TunnelError::unavailable(format!("unknown circuit {id}")))?;

        let peeled = {
            let mut layers = circuit.backward_layers_mut();
            OnionCrypto::peel_onion(&mut layers, raw)
                .map_err(|err| TunnelError::Other(err.into()))?
        };
        circuit.add_received(raw.len() as u64);

        Message::decode(&peeled).map_err(|err| TunnelError::format(err.to_string()))
    }

    pub fn mark_failed(&mut self, id: CircuitId) {
        if let Some(circuit) = self.circuits.get_mut(&id) {
            circuit.mark_failed();
        }
    }

    /// Close and remove a circuit. Returns the entry address and a
    /// DESTROY notification for the caller to send best-effort; the
    /// local teardown never depends on that send.
    pub fn close(&mut self, id: CircuitId, reason: u8) -> Option<(SocketAddrV4, Message)> {
        let mut circuit = self.circuits.remove(&id)?;
        let entry = circuit.entry_hop().map(|hop| hop.address);
        circuit.mark_closed();
        info!(circuit = %id, reason, "circuit closed");

        entry.map(|entry| {
            (
                entry,
                Message::Destroy(wire::Destroy {
                    circuit_id: id.as_u32(),
                    reason,
                }),
            )
        })
    }

    /// Sweep expired and idle circuits. Returns the swept IDs with
    /// their DESTROY notifications so the caller can finish cleanup.
    pub fn sweep(&mut self) -> Vec<(CircuitId, SocketAddrV4, Message)> {
        let doomed: Vec<CircuitId> = self
            .circuits
            .values()
            .filter(|circuit| {
                circuit.is_established() && (circuit.is_expired() || circuit.is_idle())
            })
            .map(|circuit| circuit.id)
            .collect();

        doomed
            .into_iter()
            .filter_map(|id| {
                self.close(id, destroy_reason::EXPIRED)
                    .map(|(entry, message)| (id, entry, message))
            })
            .collect()
    }

    pub fn stats(&self) -> CircuitStats {
        let mut stats = CircuitStats::default();
        for circuit in self.circuits.values() {
            stats.total += 1;
            match circuit.state {
                CircuitState::Creating => stats.creating += 1,
                CircuitState::Established => stats.established += 1,
                CircuitState::Failed => stats.failed += 1,
                CircuitState::Closed => {}
            }
            stats.bytes_sent += circuit.bytes_sent;
            stats.bytes_received += circuit.bytes_received;
        }
        stats
    }
}

impl Default for CircuitManager {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CircuitStats {
    pub total: usize,
    pub creating: usize,
    pub established: usize,
    pub failed: usize,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}
