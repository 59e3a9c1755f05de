use crate::onchain::interface::BlockchainError;
use crate::storage::StoreError;
use thiserror::Error;

/// Failures surfaced by the swap initiator's synchronous entry points.
#[derive(Debug, Error)]
pub enum SwapInitiatorError {
    // Negotiated fields are missing; nothing to do until negotiation completes
    #[error("swap is not agreed")]
    SwapNotAgreed,
    #[error("bail transaction already sent")]
    BailTransactionAlreadySent,
    #[error("redeem transaction already sent")]
    RedeemTransactionAlreadySent,
    #[error("responder bail transaction could not be restored")]
    BailTransactionCouldNotBeRestored(#[source] Option<BlockchainError>),
    #[error("blockchain error: {0}")]
    Blockchain(#[from] BlockchainError),
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

impl SwapInitiatorError {
    /// Chain and storage failures are transient; the driver may retry `proceed_next`.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SwapInitiatorError::Blockchain(_) | SwapInitiatorError::Storage(_))
    }

    pub fn is_duplicate_action(&self) -> bool {
        matches!(
            self,
            SwapInitiatorError::BailTransactionAlreadySent | SwapInitiatorError::RedeemTransactionAlreadySent
        )
    }
}
