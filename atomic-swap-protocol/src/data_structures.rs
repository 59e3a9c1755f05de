// Value types shared by the swap state machine, the chain ports and storage.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::Duration;

// Identifier of a single swap negotiation/execution (hex string)
pub type SwapId = String;

// Chain-specific transaction identifier (e.g. a hex encoded hash)
pub type TransactionId = String;

/// The preimage revealed on-chain when the initiator claims the responder's lock.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Secret(pub [u8; 32]);

impl Secret {
    pub fn random() -> Self {
        Secret(rand::random::<[u8; 32]>())
    }

    pub fn hash(&self) -> SecretHash {
        SecretHash::of(&self.0)
    }
}

// Never print the preimage itself
impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret(<redacted>)")
    }
}

/// SHA-256 commitment to a [`Secret`], shared with the counterparty during negotiation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct SecretHash(pub [u8; 32]);

impl SecretHash {
    pub fn of(preimage: &[u8]) -> Self {
        let digest: [u8; 32] = Sha256::digest(preimage).into();
        SecretHash(digest)
    }

    pub fn matches(&self, secret: &Secret) -> bool {
        secret.hash() == *self
    }
}

impl fmt::Debug for SecretHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretHash({})", hex::encode(self.0))
    }
}

impl fmt::Display for SecretHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// 20-byte hash committing to a public key that controls a locked output.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct KeyHash(pub [u8; 20]);

impl fmt::Debug for KeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyHash({})", hex::encode(self.0))
    }
}

impl fmt::Display for KeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

// Identifier of key material held by a wallet/keystore (never the key itself)
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyId(pub String);

impl KeyId {
    pub fn new(id: impl Into<String>) -> Self {
        KeyId(id.into())
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Absolute timelock in unix seconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn now() -> Self {
        Timestamp(chrono::Utc::now().timestamp())
    }

    /// Timelock expiring `period` from now.
    pub fn after(period: Duration) -> Self {
        let secs = i64::try_from(period.as_secs()).unwrap_or(i64::MAX);
        Timestamp(Self::now().0.saturating_add(secs))
    }

    pub fn has_passed(&self, now: Timestamp) -> bool {
        now.0 >= self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match chrono::DateTime::from_timestamp(self.0, 0) {
            Some(dt) => write!(f, "{}", dt.to_rfc3339()),
            None => write!(f, "{}", self.0),
        }
    }
}

// Random hex id used for new swaps
pub fn new_swap_id() -> SwapId {
    hex::encode(rand::random::<[u8; 16]>())
}
