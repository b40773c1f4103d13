//! Onion circuits: construction, health, pooling, and relay duty
//!
//! A circuit is 1-3 relays with independently negotiated layer keys.
//! The [`CircuitBuilder`] grows them hop by hop, the
//! [`CircuitManager`] owns them, the [`HealthMonitor`] probes them,
//! and the [`CircuitPool`] leases them to sessions. [`RelayService`]
//! is the other side of the contract: carrying circuits other nodes
//! originated.

mod build;
mod cell;
mod crypto;
mod health;
mod manager;
mod path;
mod pool;
mod relay;
mod types;

pub use build::{BuildFailure, BuildOutcome, CircuitBuilder};
pub use cell::{CellCommand, SessionCell, MAX_CELL_PAYLOAD};
pub use crypto::{CryptoError, EphemeralKeyPair, LayerCrypto, NonceCounter, OnionCrypto};
pub use health::{HealthMonitor, HealthRecord, HealthRegistry};
pub use manager::{destroy_reason, CircuitManager, CircuitStats};
pub use path::{PathHop, PathSelectionError, PathSelector};
pub use pool::{BuildRequest, CircuitPool, SessionOutcome};
pub use relay::RelayService;
pub use types::{Circuit, CircuitId, CircuitState, HopNode};
