//! Anonymous tunnel engine
//!
//! An onion-routing overlay for peer-to-peer traffic: peers are
//! discovered and verified over a signed introduction handshake,
//! circuits of 1-3 relays are built with per-hop key exchanges, and
//! application connections ride those circuits as multiplexed
//! sessions. The wire format is byte-compatible with the reference
//! network, so nodes running this engine interoperate with existing
//! deployments.
//!
//! [`TunnelNode`] is the entry point; everything else is plumbing it
//! wires together.

pub mod bandwidth;
pub mod circuit;
pub mod connector;
pub mod identity;
pub mod node;
pub mod peer;
pub mod transport;
pub mod wire;

pub use bandwidth::{ContributionSnapshot, ContributionTracker};
pub use circuit::{
    Circuit, CircuitBuilder, CircuitId, CircuitManager, CircuitPool, CircuitState, CircuitStats,
    HealthMonitor, HealthRegistry, PathSelectionError, PathSelector, RelayService,
};
pub use connector::{DowngradeNotice, SocketConnector, TunnelSocket, TunnelStream};
pub use identity::{
    EncryptedIdentity, IdentityStoreError, KeyPair, NetworkIdentity, PeerId, PublicKey,
};
pub use node::{TunnelNode, TunnelStatus};
pub use peer::{HandshakeState, Peer, PeerDirectory};
pub use transport::{bind_udp, MemoryRouter, Transport};
pub use wire::{Message, MessageKind, WireError};
