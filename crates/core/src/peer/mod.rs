//! Peer discovery and verification
//!
//! The [`PeerDirectory`] is the authoritative table of known peers;
//! the [`HandshakeDriver`] moves them through the four-step discovery
//! handshake that gates circuit eligibility.

mod directory;
mod handshake;

pub use directory::{DirectoryStats, HandshakeState, Peer, PeerDirectory};
pub use handshake::HandshakeDriver;
