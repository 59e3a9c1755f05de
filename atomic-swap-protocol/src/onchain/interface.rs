use crate::cross_chain::listener::BlockchainEventListener;
use crate::data_structures::{KeyHash, KeyId, Secret, SecretHash, Timestamp, TransactionId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

// Errors reported by a chain port. All of them are treated as chain-side failures
// by the swap initiator, except where it maps them to a data-recovery failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BlockchainError {
    #[error("transaction submission rejected: {0}")]
    Submission(String),
    #[error("chain unavailable: {0}")]
    Unavailable(String),
    #[error("malformed transaction: {0}")]
    MalformedTransaction(String),
    #[error("transaction {tx_id} has {confirmations} confirmations, {required} required")]
    NotConfirmed {
        tx_id: TransactionId,
        confirmations: u64,
        required: u64,
    },
    #[error("unknown transaction {0}")]
    UnknownTransaction(TransactionId),
    #[error("no key material for key id {0}")]
    UnknownKey(KeyId),
}

/// A chain-native transaction as seen by a port: sent, restored or observed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionHandle {
    pub chain_id: u64,
    pub tx_id: TransactionId,
    // Chain-native encoding of the transaction
    pub payload: Vec<u8>,
    pub confirmations: u64,
}

/// Details of a counterparty locking transaction cached on the swap, enough for the
/// port to rebuild a [`TransactionHandle`] after a restart.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedTransaction {
    pub chain_id: u64,
    pub tx_id: TransactionId,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

// Parameters of a hash/time-locked output
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockParams {
    pub redeem_pkh: KeyHash,
    pub refund_pkh: KeyHash,
    pub secret_hash: SecretHash,
    pub timelock: Timestamp,
    pub amount: u64,
}

// Criteria a watched locking transaction must match (amount is not part of it)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockWatch {
    pub redeem_pkh: KeyHash,
    pub refund_pkh: KeyHash,
    pub secret_hash: SecretHash,
    pub timelock: Timestamp,
}

impl LockWatch {
    pub fn matches(&self, lock: &LockParams) -> bool {
        self.redeem_pkh == lock.redeem_pkh
            && self.refund_pkh == lock.refund_pkh
            && self.secret_hash == lock.secret_hash
            && self.timelock == lock.timelock
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClaimParams {
    pub redeem_pkh: KeyHash,
    pub redeem_key_id: KeyId,
    pub refund_pkh: KeyHash,
    pub secret: Secret,
    pub secret_hash: SecretHash,
    pub timelock: Timestamp,
}

/// Trait defining the interactions the swap initiator needs with one chain.
/// One instance exists per side of the swap.
#[async_trait]
pub trait SwapBlockchain: Send + Sync {
    /// Sends a locking ("bail") transaction.
    async fn send_lock_transaction(&self, params: LockParams) -> Result<TransactionHandle, BlockchainError>;

    /// Registers interest in a locking transaction matching `watch`. Matches are
    /// delivered to `listener`, never from within this call.
    fn watch_lock_transaction(&self, watch: LockWatch, listener: Arc<dyn BlockchainEventListener>);

    /// Rebuilds a locking transaction handle from cached details.
    async fn restore_lock_transaction(&self, cached: &CachedTransaction) -> Result<TransactionHandle, BlockchainError>;

    /// Spends `lock` through its redeem path, revealing the secret.
    async fn send_claim_transaction(
        &self,
        lock: &TransactionHandle,
        params: ClaimParams,
    ) -> Result<TransactionHandle, BlockchainError>;

    /// Extracts cacheable details from an observed locking transaction. Fails if the
    /// transaction is not confirmed or not a well-formed lock.
    fn cacheable_details(&self, tx: &TransactionHandle) -> Result<CachedTransaction, BlockchainError>;
}
