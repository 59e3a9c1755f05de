// Hash/time-locked contract rules enforced by the chain simulator

use crate::crypto::{self, key_hash, PublicKey};
use crate::data_structures::{KeyHash, Secret, SecretHash, Timestamp, TransactionId};
use crate::onchain::interface::LockParams;
use bincode::config::standard;
use ed25519_dalek::Signature;
use std::collections::HashMap;
use thiserror::Error;

// Calls that can be made to the simulated HTLC contract
#[derive(Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub enum HtlcCall {
    // Locks `amount` spendable by redeem_pkh with the preimage, or by refund_pkh after `timelock`
    Lock {
        redeem_pkh: KeyHash,
        refund_pkh: KeyHash,
        secret_hash: SecretHash,
        timelock: Timestamp,
        amount: u64,
    },
    // Spends a lock through the redeem path, revealing the secret
    Claim {
        lock_tx: TransactionId,
        secret: Secret,
        public_key: [u8; 32],
        signature: Vec<u8>,
    },
    // Spends a lock through the refund path once the timelock passed
    Refund {
        lock_tx: TransactionId,
        public_key: [u8; 32],
        signature: Vec<u8>,
    },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HtlcError {
    #[error("lock {0} does not exist")]
    UnknownLock(TransactionId),
    #[error("lock {0} is already spent")]
    AlreadySpent(TransactionId),
    #[error("secret does not match the lock's secret hash")]
    SecretMismatch,
    #[error("public key does not hash to the lock's key hash")]
    KeyHashMismatch,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("timelock {0} has not expired")]
    TimelockNotExpired(Timestamp),
    #[error("zero amount lock")]
    ZeroAmount,
    #[error("call encoding failed: {0}")]
    Encoding(String),
}

impl HtlcCall {
    pub fn lock(params: &LockParams) -> Self {
        HtlcCall::Lock {
            redeem_pkh: params.redeem_pkh,
            refund_pkh: params.refund_pkh,
            secret_hash: params.secret_hash,
            timelock: params.timelock,
            amount: params.amount,
        }
    }

    pub fn lock_params(&self) -> Option<LockParams> {
        match self {
            HtlcCall::Lock { redeem_pkh, refund_pkh, secret_hash, timelock, amount } => Some(LockParams {
                redeem_pkh: *redeem_pkh,
                refund_pkh: *refund_pkh,
                secret_hash: *secret_hash,
                timelock: *timelock,
                amount: *amount,
            }),
            _ => None,
        }
    }

    // Lock being spent by this call, if any
    pub fn spends(&self) -> Option<&TransactionId> {
        match self {
            HtlcCall::Lock { .. } => None,
            HtlcCall::Claim { lock_tx, .. } | HtlcCall::Refund { lock_tx, .. } => Some(lock_tx),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, HtlcError> {
        bincode::encode_to_vec(self, standard()).map_err(|e| HtlcError::Encoding(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, HtlcError> {
        let (call, read) = bincode::decode_from_slice::<HtlcCall, _>(bytes, standard())
            .map_err(|e| HtlcError::Encoding(e.to_string()))?;
        if read != bytes.len() {
            return Err(HtlcError::Encoding(format!("{} trailing bytes", bytes.len() - read)));
        }
        Ok(call)
    }
}

/// Message signed by the redeem key to claim `lock_tx`.
pub fn claim_message(lock_tx: &str, secret: &Secret) -> Vec<u8> {
    let mut message = b"htlc-claim".to_vec();
    message.extend_from_slice(lock_tx.as_bytes());
    message.extend_from_slice(&secret.0);
    message
}

/// Message signed by the refund key to refund `lock_tx`.
pub fn refund_message(lock_tx: &str) -> Vec<u8> {
    let mut message = b"htlc-refund".to_vec();
    message.extend_from_slice(lock_tx.as_bytes());
    message
}

#[derive(Clone, Debug)]
struct LockEntry {
    params: LockParams,
    spent_by: Option<TransactionId>,
}

// Contract state: every lock ever mined and how it was spent
#[derive(Debug, Default)]
pub struct HtlcContract {
    locks: HashMap<TransactionId, LockEntry>,
}

impl HtlcContract {
    pub fn new() -> Self {
        Default::default()
    }

    /// Checks whether `call` may be accepted at block time `now`.
    pub fn validate(&self, call: &HtlcCall, now: Timestamp) -> Result<(), HtlcError> {
        match call {
            HtlcCall::Lock { amount, .. } => {
                if *amount == 0 {
                    return Err(HtlcError::ZeroAmount);
                }
                Ok(())
            }
            HtlcCall::Claim { lock_tx, secret, public_key, signature } => {
                let entry = self.unspent(lock_tx)?;
                if !entry.params.secret_hash.matches(secret) {
                    return Err(HtlcError::SecretMismatch);
                }
                let key = Self::authorize(public_key, &entry.params.redeem_pkh)?;
                Self::check_signature(&key, &claim_message(lock_tx, secret), signature)
            }
            HtlcCall::Refund { lock_tx, public_key, signature } => {
                let entry = self.unspent(lock_tx)?;
                if !entry.params.timelock.has_passed(now) {
                    return Err(HtlcError::TimelockNotExpired(entry.params.timelock));
                }
                let key = Self::authorize(public_key, &entry.params.refund_pkh)?;
                Self::check_signature(&key, &refund_message(lock_tx), signature)
            }
        }
    }

    /// Applies an already validated call mined as `tx_id`.
    pub fn apply(&mut self, tx_id: &TransactionId, call: &HtlcCall) {
        if let Some(params) = call.lock_params() {
            self.locks.insert(tx_id.clone(), LockEntry { params, spent_by: None });
        } else if let Some(lock_tx) = call.spends() {
            if let Some(entry) = self.locks.get_mut(lock_tx) {
                entry.spent_by = Some(tx_id.clone());
            }
        }
    }

    pub fn spent_by(&self, lock_tx: &str) -> Option<&TransactionId> {
        self.locks.get(lock_tx).and_then(|entry| entry.spent_by.as_ref())
    }

    fn unspent(&self, lock_tx: &TransactionId) -> Result<&LockEntry, HtlcError> {
        let entry = self.locks.get(lock_tx).ok_or_else(|| HtlcError::UnknownLock(lock_tx.clone()))?;
        if entry.spent_by.is_some() {
            return Err(HtlcError::AlreadySpent(lock_tx.clone()));
        }
        Ok(entry)
    }

    fn authorize(public_key: &[u8; 32], expected: &KeyHash) -> Result<PublicKey, HtlcError> {
        let key = PublicKey::from_bytes(public_key).map_err(|_| HtlcError::KeyHashMismatch)?;
        if key_hash(&key) != *expected {
            return Err(HtlcError::KeyHashMismatch);
        }
        Ok(key)
    }

    fn check_signature(key: &PublicKey, message: &[u8], signature: &[u8]) -> Result<(), HtlcError> {
        let bytes: [u8; 64] = signature.try_into().map_err(|_| HtlcError::InvalidSignature)?;
        if crypto::verify(message, &Signature::from_bytes(&bytes), key) {
            Ok(())
        } else {
            Err(HtlcError::InvalidSignature)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{generate_keypair, sign, SecretKey};

    struct Fixture {
        redeem_key: SecretKey,
        refund_key: SecretKey,
        secret: Secret,
        lock: HtlcCall,
    }

    fn fixture(timelock: Timestamp) -> Fixture {
        let redeem_key = generate_keypair();
        let refund_key = generate_keypair();
        let secret = Secret([42; 32]);
        let lock = HtlcCall::Lock {
            redeem_pkh: key_hash(&redeem_key.verifying_key()),
            refund_pkh: key_hash(&refund_key.verifying_key()),
            secret_hash: secret.hash(),
            timelock,
            amount: 100,
        };
        Fixture { redeem_key, refund_key, secret, lock }
    }

    fn claim(lock_tx: &str, secret: Secret, key: &SecretKey) -> HtlcCall {
        HtlcCall::Claim {
            lock_tx: lock_tx.to_string(),
            secret,
            public_key: key.verifying_key().to_bytes(),
            signature: sign(&claim_message(lock_tx, &secret), key).to_bytes().to_vec(),
        }
    }

    #[test]
    fn claim_with_secret_and_redeem_key() {
        let f = fixture(Timestamp(i64::MAX));
        let mut contract = HtlcContract::new();
        let now = Timestamp(0);
        contract.validate(&f.lock, now).unwrap();
        contract.apply(&"lock1".to_string(), &f.lock);

        let good = claim("lock1", f.secret, &f.redeem_key);
        assert_eq!(contract.validate(&good, now), Ok(()));

        let wrong_secret = claim("lock1", Secret([1; 32]), &f.redeem_key);
        assert_eq!(contract.validate(&wrong_secret, now), Err(HtlcError::SecretMismatch));

        let wrong_key = claim("lock1", f.secret, &f.refund_key);
        assert_eq!(contract.validate(&wrong_key, now), Err(HtlcError::KeyHashMismatch));

        contract.apply(&"claim1".to_string(), &good);
        assert_eq!(contract.spent_by("lock1"), Some(&"claim1".to_string()));
        assert_eq!(contract.validate(&good, now), Err(HtlcError::AlreadySpent("lock1".to_string())));
    }

    #[test]
    fn refund_only_after_timelock() {
        let f = fixture(Timestamp(1_000));
        let mut contract = HtlcContract::new();
        contract.apply(&"lock1".to_string(), &f.lock);

        let refund = HtlcCall::Refund {
            lock_tx: "lock1".to_string(),
            public_key: f.refund_key.verifying_key().to_bytes(),
            signature: sign(&refund_message("lock1"), &f.refund_key).to_bytes().to_vec(),
        };
        assert_eq!(
            contract.validate(&refund, Timestamp(999)),
            Err(HtlcError::TimelockNotExpired(Timestamp(1_000)))
        );
        assert_eq!(contract.validate(&refund, Timestamp(1_000)), Ok(()));
    }

    #[test]
    fn unknown_lock_and_zero_amount_rejected() {
        let f = fixture(Timestamp(0));
        let contract = HtlcContract::new();
        let orphan = claim("nope", f.secret, &f.redeem_key);
        assert_eq!(contract.validate(&orphan, Timestamp(0)), Err(HtlcError::UnknownLock("nope".to_string())));

        let mut zero = f.lock.clone();
        if let HtlcCall::Lock { amount, .. } = &mut zero {
            *amount = 0;
        }
        assert_eq!(contract.validate(&zero, Timestamp(0)), Err(HtlcError::ZeroAmount));
    }

    #[test]
    fn encoding_rejects_garbage() {
        let f = fixture(Timestamp(5));
        let bytes = f.lock.encode().unwrap();
        assert_eq!(HtlcCall::decode(&bytes).unwrap(), f.lock);
        assert!(HtlcCall::decode(&[0xff, 0xff, 0xff]).is_err());
    }
}
