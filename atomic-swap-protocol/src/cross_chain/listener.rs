// Notifications a chain watcher delivers for a registered watch

use crate::onchain::interface::TransactionHandle;
use async_trait::async_trait;
use std::sync::Weak;

/// Receiver of counterparty-chain observations.
///
/// Implementations must tolerate being called zero, one or many times for the same
/// on-chain event, and must never report failures back to the watcher.
#[async_trait]
pub trait BlockchainEventListener: Send + Sync {
    /// A locking transaction matching the watch criteria appeared on-chain.
    async fn on_lock_observed(&self, tx: TransactionHandle);

    /// A claim spending a watched lock appeared on-chain.
    async fn on_claim_observed(&self, tx: TransactionHandle);
}

/// Forwards notifications to a listener without keeping it alive. Once the target
/// is dropped, notifications are discarded.
pub struct WeakListener<T: BlockchainEventListener> {
    target: Weak<T>,
}

impl<T: BlockchainEventListener> WeakListener<T> {
    pub fn new(target: Weak<T>) -> Self {
        WeakListener { target }
    }
}

#[async_trait]
impl<T: BlockchainEventListener> BlockchainEventListener for WeakListener<T> {
    async fn on_lock_observed(&self, tx: TransactionHandle) {
        match self.target.upgrade() {
            Some(target) => target.on_lock_observed(tx).await,
            None => log::debug!("Dropping lock notification {}: listener is gone", tx.tx_id),
        }
    }

    async fn on_claim_observed(&self, tx: TransactionHandle) {
        if let Some(target) = self.target.upgrade() {
            target.on_claim_observed(tx).await;
        }
    }
}
