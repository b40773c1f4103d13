mod identity;
mod keypair;
mod peer_id;

pub use identity::{EncryptedIdentity, IdentityStoreError, NetworkIdentity};
pub use keypair::{KeyPair, KeyPairError, PublicKey};
pub use peer_id::{PeerId, PeerIdError, PEER_ID_LEN};
