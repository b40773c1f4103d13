use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::{CryptoRng, RngCore};
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey, SharedSecret};

/// Onion crypto for layered encryption/decryption with forward secrecy
pub struct OnionCrypto;

/// Per-layer nonce counter for ChaCha20-Poly1305
///
/// Each layer MUST have its own counter: nonce reuse with the same key
/// destroys confidentiality. The base comes out of the same key
/// derivation as the layer key, so both ends of a hop start from the
/// same point. Calls must be ordered; the owning circuit serializes
/// access.
#[derive(Debug, Clone)]
pub struct NonceCounter {
    base: [u8; 12],
    counter: u64,
}

impl NonceCounter {
    pub fn from_base(base: [u8; 12]) -> Self {
        Self { base, counter: 0 }
    }

    /// Get next nonce and increment the counter
    pub fn next_nonce(&mut self) -> Result<[u8; 12], CryptoError> {
        let mut nonce = self.base;
        // XOR the counter into the last 8 bytes
        let counter_bytes = self.counter.to_le_bytes();
        for (i, byte) in counter_bytes.iter().enumerate() {
            nonce[4 + i] ^= byte;
        }

        self.counter = self
            .counter
            .checked_add(1)
            .ok_or(CryptoError::NonceExhausted)?;

        Ok(nonce)
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }
}

/// Ephemeral key pair for the per-hop X25519 exchange
///
/// Not Clone: the secret is consumed by the exchange, which is what
/// gives each hop forward secrecy.
pub struct EphemeralKeyPair {
    secret: EphemeralSecret,
    public: X25519PublicKey,
}

impl EphemeralKeyPair {
    /// Generate a fresh ephemeral key pair. Each hop of each circuit
    /// gets its own; none is ever reused.
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(&mut rand::thread_rng());
        let public = X25519PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Generate with custom RNG (for testing)
    pub fn generate_with_rng<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let secret = EphemeralSecret::random_from_rng(rng);
        let public = X25519PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key(&self) -> &X25519PublicKey {
        &self.public
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    /// Perform the exchange. Consumes the secret; it cannot be reused.
    pub fn diffie_hellman(self, their_public: &X25519PublicKey) -> SharedSecret {
        self.secret.diffie_hellman(their_public)
    }
}

/// Encryption state for a single hop layer
#[derive(Clone)]
pub struct LayerCrypto {
    cipher: ChaCha20Poly1305,
    nonce_counter: NonceCounter,
}

// Manual Debug because ChaCha20Poly1305 doesn't implement it
impl std::fmt::Debug for LayerCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerCrypto")
            .field("nonce_counter", &self.nonce_counter)
            .field("cipher", &"<ChaCha20Poly1305>")
            .finish()
    }
}

impl LayerCrypto {
    fn from_key(key: [u8; 32], nonce_base: [u8; 12]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(&key.into()),
            nonce_counter: NonceCounter::from_base(nonce_base),
        }
    }

    /// Encrypt data with this layer. Increments the nonce counter.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce_bytes = self.nonce_counter.next_nonce()?;
        let nonce = Nonce::from_slice(&nonce_bytes);

        self.cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    /// Decrypt data with this layer. Increments the nonce counter.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce_bytes = self.nonce_counter.next_nonce()?;
        let nonce = Nonce::from_slice(&nonce_bytes);

        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }

    pub fn counter(&self) -> u64 {
        self.nonce_counter.counter()
    }
}

impl OnionCrypto {
    /// Derive forward and backward layers from a hop's shared secret.
    /// BLAKE3 keyed hashing with fixed domain strings keeps the two
    /// directions independent. Each direction's XOF output yields the
    /// cipher key and the nonce base, so both ends of the hop derive
    /// an identical nonce sequence from the same secret.
    pub fn derive_layers(shared_secret: &SharedSecret) -> (LayerCrypto, LayerCrypto) {
        (
            Self::derive_layer(shared_secret, b"SWARMVEIL-HOP-FORWARD-V1"),
            Self::derive_layer(shared_secret, b"SWARMVEIL-HOP-BACKWARD-V1"),
        )
    }

    fn derive_layer(shared_secret: &SharedSecret, domain: &[u8]) -> LayerCrypto {
        let mut hasher = blake3::Hasher::new_keyed(shared_secret.as_bytes());
        hasher.update(domain);

        let mut okm = [0u8; 44];
        hasher.finalize_xof().fill(&mut okm);

        let mut key = [0u8; 32];
        key.copy_from_slice(&okm[..32]);
        let mut nonce_base = [0u8; 12];
        nonce_base.copy_from_slice(&okm[32..]);

        LayerCrypto::from_key(key, nonce_base)
    }

    /// Key-confirmation tag sent back in CREATED/EXTENDED so the
    /// origin can check both sides derived the same secret.
    pub fn derive_auth(shared_secret: &SharedSecret) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new_keyed(shared_secret.as_bytes());
        hasher.update(b"SWARMVEIL-HOP-CONFIRM-V1");
        *hasher.finalize().as_bytes()
    }

    /// Encrypt an outbound cell with every layer, exit-first, so that
    /// the entry hop peels the outermost layer. No relay sees more
    /// than its own layer.
    pub fn encrypt_onion(
        layers: &mut [&mut LayerCrypto],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let mut data = plaintext.to_vec();

        for layer in layers.iter_mut().rev() {
            data = layer.encrypt(&data)?;
        }

        Ok(data)
    }

    /// Remove all backward layers from an inbound cell, entry-first:
    /// each hop towards us added its own layer on the way back.
    pub fn peel_onion(
        layers: &mut [&mut LayerCrypto],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let mut data = ciphertext.to_vec();

        for layer in layers.iter_mut() {
            data = layer.decrypt(&data)?;
        }

        Ok(data)
    }
}

/// Cryptographic errors
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("Nonce counter exhausted; circuit must be rebuilt")]
    NonceExhausted,

    #[error("Invalid public key")]
    InvalidPublicKey,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nonce_counter_uniqueness() {
        let mut counter = NonceCounter::from_base([9u8; 12]);
        let nonce1 = counter.next_nonce().unwrap();
        let nonce2 = counter.next_nonce().unwrap();
        let nonce3 = counter.next_nonce().unwrap();

        assert_ne!(nonce1, nonce2);
        assert_ne!(nonce2, nonce3);
        assert_ne!(nonce1, nonce3);
        assert_eq!(counter.counter(), 3);
    }

    #[test]
    fn test_x25519_exchange_agrees() {
        let alice = EphemeralKeyPair::generate();
        let alice_public = *alice.public_key();

        let bob = EphemeralKeyPair::generate();
        let bob_public = *bob.public_key();

        let alice_shared = alice.diffie_hellman(&bob_public);
        let bob_shared = bob.diffie_hellman(&alice_public);

        assert_eq!(alice_shared.as_bytes(), bob_shared.as_bytes());
    }

    #[test]
    fn test_auth_tag_matches_on_both_sides() {
        let alice = EphemeralKeyPair::generate();
        let bob = EphemeralKeyPair::generate();
        let bob_public = *bob.public_key();
        let alice_public = *alice.public_key();

        let a = OnionCrypto::derive_auth(&alice.diffie_hellman(&bob_public));
        let b = OnionCrypto::derive_auth(&bob.diffie_hellman(&alice_public));
        assert_eq!(a, b);
    }

    #[test]
    fn test_layer_roundtrip() {
        let alice = EphemeralKeyPair::generate();
        let bob = EphemeralKeyPair::generate();
        let bob_public = *bob.public_key();
        let alice_public = *alice.public_key();

        let (mut alice_forward, _) = OnionCrypto::derive_layers(&alice.diffie_hellman(&bob_public));
        let (mut bob_forward, _) = OnionCrypto::derive_layers(&bob.diffie_hellman(&alice_public));

        // Both sides derive key and nonce base from the shared secret,
        // so independently constructed layers stay in step across a
        // sequence of cells.
        for cell in [&b"cell payload"[..], b"second cell", b"third cell"] {
            let ciphertext = alice_forward.encrypt(cell).unwrap();
            let decrypted = bob_forward.decrypt(&ciphertext).unwrap();
            assert_eq!(cell, decrypted.as_slice());
        }
        assert_eq!(alice_forward.counter(), bob_forward.counter());
    }

    #[test]
    fn test_onion_encrypt_and_peel_per_hop() {
        // Origin encrypts with all forward layers; each relay in path
        // order peels exactly one.
        let mut origin_layers = Vec::new();
        let mut relay_layers = Vec::new();

        for _ in 0..3 {
            let origin_side = EphemeralKeyPair::generate();
            let relay_side = EphemeralKeyPair::generate();
            let relay_public = *relay_side.public_key();
            let origin_public = *origin_side.public_key();

            let (origin_forward, _) =
                OnionCrypto::derive_layers(&origin_side.diffie_hellman(&relay_public));
            let (relay_forward, _) =
                OnionCrypto::derive_layers(&relay_side.diffie_hellman(&origin_public));

            origin_layers.push(origin_forward);
            relay_layers.push(relay_forward);
        }

        let plaintext = b"through three hops";
        let mut layer_refs: Vec<&mut LayerCrypto> = origin_layers.iter_mut().collect();
        let onion = OnionCrypto::encrypt_onion(&mut layer_refs, plaintext).unwrap();

        let mut data = onion;
        for relay in relay_layers.iter_mut() {
            data = relay.decrypt(&data).unwrap();
        }

        assert_eq!(plaintext.as_slice(), data.as_slice());
    }

    #[test]
    fn test_backward_onion_peel() {
        // Relays encrypt towards the origin entry-last; the origin
        // peels entry-first.
        let mut origin_backward = Vec::new();
        let mut relay_backward = Vec::new();

        for _ in 0..3 {
            let origin_side = EphemeralKeyPair::generate();
            let relay_side = EphemeralKeyPair::generate();
            let relay_public = *relay_side.public_key();
            let origin_public = *origin_side.public_key();

            let (_, origin_b) =
                OnionCrypto::derive_layers(&origin_side.diffie_hellman(&relay_public));
            let (_, relay_b) =
                OnionCrypto::derive_layers(&relay_side.diffie_hellman(&origin_public));

            origin_backward.push(origin_b);
            relay_backward.push(relay_b);
        }

        let plaintext = b"reply payload";
        // Exit (index 2) encrypts first, then each hop towards us.
        let mut data = plaintext.to_vec();
        for relay in relay_backward.iter_mut().rev() {
            data = relay.encrypt(&data).unwrap();
        }

        let mut layer_refs: Vec<&mut LayerCrypto> = origin_backward.iter_mut().collect();
        let peeled = OnionCrypto::peel_onion(&mut layer_refs, &data).unwrap();

        assert_eq!(plaintext.as_slice(), peeled.as_slice());
    }

    #[test]
    fn test_ciphertexts_differ_across_calls() {
        let alice = EphemeralKeyPair::generate();
        let bob = EphemeralKeyPair::generate();
        let bob_public = *bob.public_key();

        let (mut layer, _) = OnionCrypto::derive_layers(&alice.diffie_hellman(&bob_public));
        let ct1 = layer.encrypt(b"same").unwrap();
        let ct2 = layer.encrypt(b"same").unwrap();

        assert_ne!(ct1, ct2);
    }

    #[test]
    fn test_forward_backward_keys_are_independent() {
        let alice = EphemeralKeyPair::generate();
        let bob = EphemeralKeyPair::generate();
        let bob_public = *bob.public_key();
        let alice_public = *alice.public_key();

        let (mut forward, _) = OnionCrypto::derive_layers(&alice.diffie_hellman(&bob_public));
        let (_, mut backward) = OnionCrypto::derive_layers(&bob.diffie_hellman(&alice_public));

        let ciphertext = forward.encrypt(b"direction test").unwrap();
        assert!(backward.decrypt(&ciphertext).is_err());
    }
}
