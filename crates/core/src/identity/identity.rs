use super::{KeyPair, KeyPairError, PeerId, PublicKey};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Complete network identity: signing keypair plus the derived peer ID
///
/// Created once and immutable afterwards; rotation is out of scope.
#[derive(Clone)]
pub struct NetworkIdentity {
    keypair: KeyPair,
    peer_id: PeerId,
}

impl NetworkIdentity {
    /// Generate a new random identity
    pub fn generate() -> Self {
        Self::from_keypair(KeyPair::generate())
    }

    /// Derive an identity from a 32-byte seed
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self::from_keypair(KeyPair::from_seed(seed))
    }

    fn from_keypair(keypair: KeyPair) -> Self {
        let peer_id = PeerId::from_public_key(&keypair.public_key());
        Self { keypair, peer_id }
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.keypair.sign(message)
    }

    pub fn verify(&self, message: &[u8], signature: &[u8; 64]) -> bool {
        self.keypair.verify(message, signature)
    }

    /// Seal the identity for storage. The seed never touches disk in
    /// the clear.
    pub fn seal(&self, passphrase: &str) -> Result<EncryptedIdentity, IdentityStoreError> {
        EncryptedIdentity::seal(&self.keypair.seed(), passphrase)
    }

    /// Load a sealed identity from disk
    pub fn load(path: &Path, passphrase: &str) -> Result<Self, IdentityStoreError> {
        let sealed = EncryptedIdentity::from_file(path)?;
        let seed = sealed.open(passphrase)?;
        Ok(Self::from_seed(&seed))
    }

    /// Seal and persist the identity
    pub fn save(&self, path: &Path, passphrase: &str) -> Result<(), IdentityStoreError> {
        self.seal(passphrase)?.to_file(path)
    }
}

impl fmt::Debug for NetworkIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkIdentity")
            .field("peer_id", &self.peer_id)
            .field("public_key", &self.public_key())
            .finish()
    }
}

/// At-rest format: the seed sealed with ChaCha20-Poly1305 under a
/// key derived from the passphrase.
#[derive(Serialize, Deserialize)]
pub struct EncryptedIdentity {
    nonce: String,
    ciphertext: String,
}

const KDF_CONTEXT: &str = "swarmveil identity seal v1";

impl EncryptedIdentity {
    fn cipher(passphrase: &str) -> ChaCha20Poly1305 {
        let key = blake3::derive_key(KDF_CONTEXT, passphrase.as_bytes());
        ChaCha20Poly1305::new(&key.into())
    }

    pub fn seal(seed: &[u8; 32], passphrase: &str) -> Result<Self, IdentityStoreError> {
        use rand::RngCore;
        let mut nonce_bytes = [0u8; 12];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = Self::cipher(passphrase)
            .encrypt(nonce, seed.as_slice())
            .map_err(|_| IdentityStoreError::SealFailed)?;

        Ok(Self {
            nonce: hex::encode(nonce_bytes),
            ciphertext: hex::encode(ciphertext),
        })
    }

    pub fn open(&self, passphrase: &str) -> Result<[u8; 32], IdentityStoreError> {
        let nonce_bytes =
            hex::decode(&self.nonce).map_err(|_| IdentityStoreError::Corrupt("nonce hex"))?;
        if nonce_bytes.len() != 12 {
            return Err(IdentityStoreError::Corrupt("nonce length"));
        }
        let ciphertext = hex::decode(&self.ciphertext)
            .map_err(|_| IdentityStoreError::Corrupt("ciphertext hex"))?;

        let plaintext = Self::cipher(passphrase)
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_slice())
            .map_err(|_| IdentityStoreError::WrongPassphrase)?;

        plaintext
            .try_into()
            .map_err(|_| IdentityStoreError::Corrupt("seed length"))
    }

    pub fn to_file(&self, path: &Path) -> Result<(), IdentityStoreError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn from_file(path: &Path) -> Result<Self, IdentityStoreError> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

/// Errors when persisting or restoring an identity
#[derive(Debug, thiserror::Error)]
pub enum IdentityStoreError {
    #[error("Failed to seal identity")]
    SealFailed,

    #[error("Wrong passphrase or tampered identity file")]
    WrongPassphrase,

    #[error("Corrupt identity file: {0}")]
    Corrupt(&'static str),

    #[error(transparent)]
    Key(#[from] KeyPairError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_generation() {
        let identity = NetworkIdentity::generate();
        let message = b"tunnel identity test";

        let signature = identity.sign(message);
        assert!(identity.verify(message, &signature));
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let identity = NetworkIdentity::from_seed(&[9u8; 32]);
        let sealed = identity.seal("hunter2").unwrap();

        let seed = sealed.open("hunter2").unwrap();
        assert_eq!(seed, [9u8; 32]);
    }

    #[test]
    fn test_wrong_passphrase_rejected() {
        let identity = NetworkIdentity::generate();
        let sealed = identity.seal("correct").unwrap();

        assert!(matches!(
            sealed.open("incorrect"),
            Err(IdentityStoreError::WrongPassphrase)
        ));
    }

    #[test]
    fn test_sealed_file_does_not_contain_seed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");

        let identity = NetworkIdentity::from_seed(&[0xAB; 32]);
        identity.save(&path, "passphrase").unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(!contents.contains(&hex::encode([0xAB; 32])));

        let restored = NetworkIdentity::load(&path, "passphrase").unwrap();
        assert_eq!(restored.peer_id(), identity.peer_id());
    }
}
