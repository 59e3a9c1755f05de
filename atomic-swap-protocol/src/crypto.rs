// atomic-swap-protocol/src/crypto.rs
// Key handling for claim/refund signatures.

use crate::data_structures::{KeyHash, KeyId};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use std::collections::HashMap;
use std::sync::RwLock;

// Re-export key types for convenience
pub use ed25519_dalek::{SigningKey as SecretKey, VerifyingKey as PublicKey};

/// Generates a new Ed25519 keypair.
pub fn generate_keypair() -> SigningKey {
    let mut csprng = OsRng;
    SigningKey::generate(&mut csprng)
}

pub fn sign(message: &[u8], secret_key: &SigningKey) -> Signature {
    secret_key.sign(message)
}

pub fn verify(message: &[u8], signature: &Signature, public_key: &VerifyingKey) -> bool {
    public_key.verify(message, signature).is_ok()
}

/// Derives the 20-byte key hash that locks commit to (blake3, truncated).
pub fn key_hash(public_key: &VerifyingKey) -> KeyHash {
    let digest = blake3::hash(public_key.as_bytes());
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest.as_bytes()[..20]);
    KeyHash(out)
}

// Wallet-side key material, addressed by KeyId
#[derive(Debug, Default)]
pub struct Keystore {
    keys: RwLock<HashMap<KeyId, SigningKey>>,
}

impl Keystore {
    pub fn new() -> Self {
        Default::default()
    }

    /// Generates and stores a fresh key under `id`, returning its key hash.
    pub fn generate(&self, id: KeyId) -> KeyHash {
        let key = generate_keypair();
        let hash = key_hash(&key.verifying_key());
        self.insert(id, key);
        hash
    }

    pub fn insert(&self, id: KeyId, key: SigningKey) {
        if let Ok(mut keys) = self.keys.write() {
            keys.insert(id, key);
        }
    }

    pub fn signing_key(&self, id: &KeyId) -> Option<SigningKey> {
        self.keys.read().ok().and_then(|keys| keys.get(id).cloned())
    }

    pub fn key_hash(&self, id: &KeyId) -> Option<KeyHash> {
        self.signing_key(id).map(|key| key_hash(&key.verifying_key()))
    }
}
