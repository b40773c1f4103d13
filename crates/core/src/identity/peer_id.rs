use super::PublicKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const PEER_ID_LEN: usize = 32;

/// Identifier for a peer, derived from its public key
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId([u8; PEER_ID_LEN]);

impl PeerId {
    /// Derive a peer ID by hashing the public key bytes
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        let hash = blake3::hash(&public_key.as_bytes());
        Self(*hash.as_bytes())
    }

    pub fn from_bytes(bytes: [u8; PEER_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, PeerIdError> {
        if bytes.len() != PEER_ID_LEN {
            return Err(PeerIdError::InvalidLength {
                expected: PEER_ID_LEN,
                actual: bytes.len(),
            });
        }

        let mut array = [0u8; PEER_ID_LEN];
        array.copy_from_slice(bytes);
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, PeerIdError> {
        let decoded =
            hex::decode(hex_str).map_err(|err| PeerIdError::InvalidHex(err.to_string()))?;
        Self::from_slice(&decoded)
    }

    /// Short form for logging
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for PeerId {
    type Err = PeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PeerIdError {
    #[error("invalid peer id length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("invalid peer id hex: {0}")]
    InvalidHex(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::KeyPair;

    #[test]
    fn peer_id_is_stable_per_key() {
        let keypair = KeyPair::from_seed(&[7u8; 32]);
        let id1 = PeerId::from_public_key(&keypair.public_key());
        let id2 = PeerId::from_public_key(&keypair.public_key());
        assert_eq!(id1, id2);
    }

    #[test]
    fn distinct_keys_get_distinct_ids() {
        let id1 = PeerId::from_public_key(&KeyPair::generate().public_key());
        let id2 = PeerId::from_public_key(&KeyPair::generate().public_key());
        assert_ne!(id1, id2);
    }

    #[test]
    fn peer_id_rejects_wrong_length() {
        let err = PeerId::from_slice(&[1u8; 16]).unwrap_err();
        assert!(matches!(err, PeerIdError::InvalidLength { .. }));
    }

    #[test]
    fn peer_id_parses_hex_roundtrip() {
        let hex_id = "ab".repeat(PEER_ID_LEN);
        let parsed = PeerId::from_hex(&hex_id).expect("should parse valid hex");
        assert_eq!(parsed.to_string(), hex_id);
    }
}
