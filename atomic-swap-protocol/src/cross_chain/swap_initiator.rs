// Initiator side of a hashed-secret/time-locked cross-chain swap

use crate::cross_chain::errors::SwapInitiatorError;
use crate::cross_chain::listener::BlockchainEventListener;
use crate::cross_chain::types::{Swap, SwapState};
use crate::onchain::interface::{
    BlockchainError, ClaimParams, LockParams, LockWatch, SwapBlockchain, TransactionHandle,
};
use crate::storage::SwapStore;
use log::{debug, error, info, warn};
use std::sync::Arc;

/// Drives one [`Swap`] through the initiator protocol, one step at a time.
///
/// The swap state is the single source of truth for which irreversible actions
/// already happened: every send is guarded by it, and the state only advances after
/// the corresponding chain call returned successfully.
///
/// `SwapInitiator` does no locking of its own. Callers must serialize access per
/// swap, which [`SwapSession`](crate::cross_chain::session::SwapSession) does.
pub struct SwapInitiator {
    initiator_chain: Arc<dyn SwapBlockchain>,
    responder_chain: Arc<dyn SwapBlockchain>,
    store: Arc<dyn SwapStore>,
    // Sink handed to the responder-chain watcher
    events: Arc<dyn BlockchainEventListener>,
    swap: Swap,
    // Set when the in-memory swap is ahead of the store
    unflushed: bool,
}

impl SwapInitiator {
    pub fn new(
        initiator_chain: Arc<dyn SwapBlockchain>,
        responder_chain: Arc<dyn SwapBlockchain>,
        store: Arc<dyn SwapStore>,
        events: Arc<dyn BlockchainEventListener>,
        swap: Swap,
    ) -> Self {
        SwapInitiator { initiator_chain, responder_chain, store, events, swap, unflushed: false }
    }

    pub fn swap(&self) -> &Swap {
        &self.swap
    }

    pub fn state(&self) -> SwapState {
        self.swap.state
    }

    /// Locks our funds and arms the watch for the counterparty lock.
    ///
    /// Does nothing unless the swap is `Responded`, so it is safe to call repeatedly.
    pub async fn start(&mut self) -> Result<(), SwapInitiatorError> {
        self.flush_pending()?;
        if self.swap.state != SwapState::Responded {
            debug!("Swap {}: start ignored in state {}", self.swap.id, self.swap.state);
            return Ok(());
        }

        self.bail().await?;
        self.watch_responder_bail()
    }

    /// Performs the single legal next action for the current state. States without
    /// one (including the terminal state) are a successful no-op; this is the entry
    /// point for resuming after a restart.
    pub async fn proceed_next(&mut self) -> Result<(), SwapInitiatorError> {
        self.flush_pending()?;
        match self.swap.state {
            SwapState::Responded => self.start().await,
            SwapState::InitiatorBailed => self.watch_responder_bail(),
            SwapState::ResponderBailed => self.redeem().await,
            SwapState::Requested | SwapState::InitiatorRedeemed => Ok(()),
        }
    }

    /// Handles a counterparty lock reported by the responder-chain watcher.
    ///
    /// Never fails: stale or duplicate notifications and unparsable transactions are
    /// ignored. A failed redeem attempt, or a failure to persist the observed lock,
    /// is left for `proceed_next` to retry.
    pub async fn on_lock_observed(&mut self, tx: TransactionHandle) {
        if self.swap.state != SwapState::InitiatorBailed {
            debug!(
                "Swap {}: ignoring responder bail {} in state {}",
                self.swap.id, tx.tx_id, self.swap.state
            );
            return;
        }

        let details = match self.responder_chain.cacheable_details(&tx) {
            Ok(details) => details,
            Err(e) => {
                debug!("Swap {}: responder bail {} not usable yet: {}", self.swap.id, tx.tx_id, e);
                return;
            }
        };

        info!("Swap {}: responder bail {} observed", self.swap.id, tx.tx_id);
        self.swap.responder_bail_transaction = Some(details);
        // No claim until the cached lock is durable; proceed_next flushes and redeems
        if let Err(e) = self.commit(SwapState::ResponderBailed) {
            warn!("Swap {}: responder bail recorded in memory only: {}", self.swap.id, e);
            return;
        }

        // Best effort, see proceed_next for the retry path
        if let Err(e) = self.redeem().await {
            warn!("Swap {}: redeem after responder bail failed, will retry: {}", self.swap.id, e);
        }
    }

    /// Claim-completion bookkeeping is not handled here.
    pub async fn on_claim_observed(&mut self, tx: TransactionHandle) {
        debug!("Swap {}: claim {} observed on responder chain", self.swap.id, tx.tx_id);
    }

    async fn bail(&mut self) -> Result<(), SwapInitiatorError> {
        if self.swap.state != SwapState::Responded {
            return Err(SwapInitiatorError::BailTransactionAlreadySent);
        }
        let terms = self.swap.terms().ok_or(SwapInitiatorError::SwapNotAgreed)?;

        let params = LockParams {
            redeem_pkh: terms.responder_redeem_pkh,
            refund_pkh: self.swap.initiator_refund_pkh,
            secret_hash: self.swap.secret_hash,
            timelock: terms.initiator_timestamp,
            amount: self.swap.amount,
        };
        let tx = self.initiator_chain.send_lock_transaction(params).await?;

        info!("Swap {}: bail transaction {} sent ({} locked)", self.swap.id, tx.tx_id, self.swap.amount);
        self.swap.initiator_bail_tx_id = Some(tx.tx_id);
        self.commit(SwapState::InitiatorBailed)
    }

    fn watch_responder_bail(&self) -> Result<(), SwapInitiatorError> {
        let terms = self.swap.terms().ok_or(SwapInitiatorError::SwapNotAgreed)?;

        let watch = LockWatch {
            redeem_pkh: self.swap.initiator_redeem_pkh,
            refund_pkh: terms.responder_refund_pkh,
            secret_hash: self.swap.secret_hash,
            timelock: terms.responder_timestamp,
        };
        debug!("Swap {}: watching for responder bail {:?}", self.swap.id, watch);
        self.responder_chain.watch_lock_transaction(watch, self.events.clone());
        Ok(())
    }

    async fn redeem(&mut self) -> Result<(), SwapInitiatorError> {
        if self.swap.state != SwapState::ResponderBailed {
            return Err(SwapInitiatorError::RedeemTransactionAlreadySent);
        }
        let (Some(secret), Some(redeem_key_id), Some(terms)) =
            (self.swap.secret, self.swap.redeem_pk_id.clone(), self.swap.terms())
        else {
            return Err(SwapInitiatorError::SwapNotAgreed);
        };
        let cached = self
            .swap
            .responder_bail_transaction
            .as_ref()
            .ok_or(SwapInitiatorError::BailTransactionCouldNotBeRestored(None))?;

        let params = ClaimParams {
            redeem_pkh: self.swap.initiator_redeem_pkh,
            redeem_key_id,
            refund_pkh: terms.responder_refund_pkh,
            secret,
            secret_hash: self.swap.secret_hash,
            timelock: terms.responder_timestamp,
        };

        let bail = self
            .responder_chain
            .restore_lock_transaction(cached)
            .await
            .map_err(|e| match e {
                BlockchainError::MalformedTransaction(_) | BlockchainError::UnknownTransaction(_) => {
                    SwapInitiatorError::BailTransactionCouldNotBeRestored(Some(e))
                }
                other => SwapInitiatorError::Blockchain(other),
            })?;
        let tx = self.responder_chain.send_claim_transaction(&bail, params).await?;

        info!("Swap {}: redeem transaction {} sent", self.swap.id, tx.tx_id);
        self.swap.initiator_redeem_tx_id = Some(tx.tx_id);
        self.commit(SwapState::InitiatorRedeemed)
    }

    fn commit(&mut self, state: SwapState) -> Result<(), SwapInitiatorError> {
        debug!("Swap {}: {} -> {}", self.swap.id, self.swap.state, state);
        self.swap.state = state;
        self.persist()
    }

    fn persist(&mut self) -> Result<(), SwapInitiatorError> {
        match self.store.update(&self.swap) {
            Ok(()) => {
                self.unflushed = false;
                Ok(())
            }
            Err(e) => {
                self.unflushed = true;
                error!("Swap {}: failed to persist state {}: {}", self.swap.id, self.swap.state, e);
                Err(e.into())
            }
        }
    }

    fn flush_pending(&mut self) -> Result<(), SwapInitiatorError> {
        if self.unflushed {
            self.persist()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cross_chain::types::Negotiation;
    use crate::data_structures::Secret;
    use crate::test_utils::{
        agreed_swap, swap_in_state, ChainCall, FlakyStore, MockSwapBlockchain, NullListener,
    };

    struct Harness {
        own: Arc<MockSwapBlockchain>,
        other: Arc<MockSwapBlockchain>,
        store: Arc<FlakyStore>,
        initiator: SwapInitiator,
    }

    fn harness(swap: Swap) -> Harness {
        let own = Arc::new(MockSwapBlockchain::new(1));
        let other = Arc::new(MockSwapBlockchain::new(2));
        let store = Arc::new(FlakyStore::new());
        let initiator = SwapInitiator::new(
            own.clone(),
            other.clone(),
            store.clone(),
            Arc::new(NullListener),
            swap,
        );
        Harness { own, other, store, initiator }
    }

    fn observed_lock(h: &Harness) -> TransactionHandle {
        let swap = h.initiator.swap();
        let terms = swap.terms().unwrap();
        MockSwapBlockchain::lock_handle(
            2,
            &LockParams {
                redeem_pkh: swap.initiator_redeem_pkh,
                refund_pkh: terms.responder_refund_pkh,
                secret_hash: swap.secret_hash,
                timelock: terms.responder_timestamp,
                amount: 70,
            },
        )
    }

    #[tokio::test]
    async fn start_is_noop_outside_responded() {
        for state in [
            SwapState::Requested,
            SwapState::InitiatorBailed,
            SwapState::ResponderBailed,
            SwapState::InitiatorRedeemed,
        ] {
            let mut h = harness(swap_in_state(state));
            h.initiator.start().await.unwrap();
            assert_eq!(h.initiator.state(), state);
            assert!(h.own.calls().is_empty());
            assert!(h.other.calls().is_empty());
            assert_eq!(h.store.update_count(), 0);
        }
    }

    #[tokio::test]
    async fn start_bails_then_watches() {
        let swap = agreed_swap(100);
        let terms = swap.terms().unwrap().clone();
        let mut h = harness(swap.clone());

        h.initiator.start().await.unwrap();

        assert_eq!(
            h.own.calls(),
            vec![ChainCall::Lock(LockParams {
                redeem_pkh: terms.responder_redeem_pkh,
                refund_pkh: swap.initiator_refund_pkh,
                secret_hash: swap.secret_hash,
                timelock: terms.initiator_timestamp,
                amount: 100,
            })]
        );
        assert_eq!(
            h.other.calls(),
            vec![ChainCall::Watch(LockWatch {
                redeem_pkh: swap.initiator_redeem_pkh,
                refund_pkh: terms.responder_refund_pkh,
                secret_hash: swap.secret_hash,
                timelock: terms.responder_timestamp,
            })]
        );
        assert_eq!(h.initiator.state(), SwapState::InitiatorBailed);
        let stored = h.store.load(&swap.id).unwrap().unwrap();
        assert_eq!(stored.state, SwapState::InitiatorBailed);
        assert!(stored.initiator_bail_tx_id.is_some());
    }

    #[tokio::test]
    async fn proceed_next_twice_sends_one_lock() {
        let mut h = harness(agreed_swap(100));
        h.initiator.proceed_next().await.unwrap();
        h.initiator.proceed_next().await.unwrap();

        assert_eq!(h.own.lock_count(), 1);
        // Second call only re-arms the watch
        assert_eq!(h.other.watch_count(), 2);
        assert_eq!(h.initiator.state(), SwapState::InitiatorBailed);
    }

    #[tokio::test]
    async fn bail_guards() {
        let mut h = harness(swap_in_state(SwapState::InitiatorBailed));
        assert!(matches!(h.initiator.bail().await, Err(SwapInitiatorError::BailTransactionAlreadySent)));

        let mut pending = agreed_swap(100);
        pending.negotiation = Negotiation::Pending;
        let mut h = harness(pending);
        assert!(matches!(h.initiator.start().await, Err(SwapInitiatorError::SwapNotAgreed)));
        assert!(matches!(h.initiator.proceed_next().await, Err(SwapInitiatorError::SwapNotAgreed)));
        assert_eq!(h.own.lock_count(), 0);
        assert_eq!(h.initiator.state(), SwapState::Responded);
    }

    #[tokio::test]
    async fn failed_bail_leaves_state_untouched() {
        let mut h = harness(agreed_swap(100));
        h.own.set_fail_sends(true);

        let err = h.initiator.start().await.unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, SwapInitiatorError::Blockchain(BlockchainError::Unavailable(_))));
        assert_eq!(h.initiator.state(), SwapState::Responded);
        assert_eq!(h.store.update_count(), 0);
        assert_eq!(h.other.watch_count(), 0);

        h.own.set_fail_sends(false);
        h.initiator.proceed_next().await.unwrap();
        assert_eq!(h.initiator.state(), SwapState::InitiatorBailed);
    }

    #[tokio::test]
    async fn watch_requires_agreement() {
        let mut swap = swap_in_state(SwapState::InitiatorBailed);
        swap.negotiation = Negotiation::Pending;
        let mut h = harness(swap);
        assert!(matches!(h.initiator.proceed_next().await, Err(SwapInitiatorError::SwapNotAgreed)));
        assert_eq!(h.other.watch_count(), 0);
    }

    #[tokio::test]
    async fn redeem_requires_every_negotiated_field() {
        let mut no_secret = swap_in_state(SwapState::ResponderBailed);
        no_secret.secret = None;
        let mut no_key = swap_in_state(SwapState::ResponderBailed);
        no_key.redeem_pk_id = None;
        let mut pending = swap_in_state(SwapState::ResponderBailed);
        pending.negotiation = Negotiation::Pending;

        for swap in [no_secret, no_key, pending] {
            let mut h = harness(swap);
            assert!(matches!(h.initiator.proceed_next().await, Err(SwapInitiatorError::SwapNotAgreed)));
            assert_eq!(h.other.claim_count(), 0);
            assert_eq!(h.initiator.state(), SwapState::ResponderBailed);
        }

        let mut h = harness(swap_in_state(SwapState::ResponderBailed));
        h.initiator.proceed_next().await.unwrap();
        assert_eq!(h.initiator.state(), SwapState::InitiatorRedeemed);
    }

    #[tokio::test]
    async fn redeem_guards_duplicate_and_missing_cache() {
        let mut h = harness(swap_in_state(SwapState::InitiatorRedeemed));
        assert!(matches!(h.initiator.redeem().await, Err(SwapInitiatorError::RedeemTransactionAlreadySent)));

        let mut uncached = swap_in_state(SwapState::ResponderBailed);
        uncached.responder_bail_transaction = None;
        let mut h = harness(uncached);
        assert!(matches!(
            h.initiator.proceed_next().await,
            Err(SwapInitiatorError::BailTransactionCouldNotBeRestored(None))
        ));

        let mut h = harness(swap_in_state(SwapState::ResponderBailed));
        h.other.set_restore_error(Some(BlockchainError::UnknownTransaction("gone".to_string())));
        let err = h.initiator.proceed_next().await.unwrap_err();
        assert!(matches!(err, SwapInitiatorError::BailTransactionCouldNotBeRestored(Some(_))));
        assert!(!err.is_retryable());
        assert_eq!(h.other.claim_count(), 0);
    }

    #[tokio::test]
    async fn restore_outage_is_retryable() {
        let mut h = harness(swap_in_state(SwapState::ResponderBailed));
        h.other.set_restore_error(Some(BlockchainError::Unavailable("chain 2 is offline".to_string())));

        let err = h.initiator.proceed_next().await.unwrap_err();
        assert!(matches!(err, SwapInitiatorError::Blockchain(BlockchainError::Unavailable(_))));
        assert!(err.is_retryable());
        assert_eq!(h.other.claim_count(), 0);
        assert_eq!(h.initiator.state(), SwapState::ResponderBailed);

        h.other.set_restore_error(None);
        h.initiator.proceed_next().await.unwrap();
        assert_eq!(h.initiator.state(), SwapState::InitiatorRedeemed);
        assert_eq!(h.other.claim_count(), 1);
    }

    #[tokio::test]
    async fn redeem_reveals_secret_on_responder_chain() {
        let swap = swap_in_state(SwapState::ResponderBailed);
        let terms = swap.terms().unwrap().clone();
        let cached = swap.responder_bail_transaction.clone().unwrap();
        let mut h = harness(swap.clone());

        h.initiator.proceed_next().await.unwrap();

        let calls = h.other.calls();
        assert_eq!(calls[0], ChainCall::Restore(cached.clone()));
        assert_eq!(
            calls[1],
            ChainCall::Claim {
                lock: cached.tx_id.clone(),
                params: ClaimParams {
                    redeem_pkh: swap.initiator_redeem_pkh,
                    redeem_key_id: swap.redeem_pk_id.clone().unwrap(),
                    refund_pkh: terms.responder_refund_pkh,
                    secret: swap.secret.unwrap(),
                    secret_hash: swap.secret_hash,
                    timelock: terms.responder_timestamp,
                },
            }
        );
        assert!(h.own.calls().is_empty());
        let stored = h.store.load(&swap.id).unwrap().unwrap();
        assert_eq!(stored.state, SwapState::InitiatorRedeemed);
        assert!(stored.initiator_redeem_tx_id.is_some());
    }

    #[tokio::test]
    async fn lock_observation_ignored_before_bail() {
        let mut h = harness(agreed_swap(100));
        let tx = observed_lock(&h);
        h.initiator.on_lock_observed(tx).await;

        assert_eq!(h.initiator.state(), SwapState::Responded);
        assert!(h.initiator.swap().responder_bail_transaction.is_none());
        assert!(h.other.calls().is_empty());
        assert_eq!(h.store.update_count(), 0);
    }

    #[tokio::test]
    async fn unparsable_lock_observation_changes_nothing() {
        let swap = swap_in_state(SwapState::InitiatorBailed);
        let mut h = harness(swap.clone());

        h.initiator.on_lock_observed(MockSwapBlockchain::malformed_handle(2)).await;

        let mut unconfirmed = observed_lock(&h);
        unconfirmed.confirmations = 0;
        h.initiator.on_lock_observed(unconfirmed).await;

        assert_eq!(h.initiator.swap(), &swap);
        assert_eq!(h.store.update_count(), 0);
        assert_eq!(h.other.claim_count(), 0);
    }

    #[tokio::test]
    async fn lock_observation_redeems_immediately() {
        let mut h = harness(swap_in_state(SwapState::InitiatorBailed));
        let tx = observed_lock(&h);

        h.initiator.on_lock_observed(tx.clone()).await;
        assert_eq!(h.initiator.state(), SwapState::InitiatorRedeemed);
        assert_eq!(h.other.claim_count(), 1);
        assert_eq!(h.initiator.swap().responder_bail_transaction.as_ref().unwrap().tx_id, tx.tx_id);
        // ResponderBailed, then InitiatorRedeemed
        assert_eq!(h.store.update_count(), 2);

        // Duplicate delivery is a no-op
        h.initiator.on_lock_observed(tx).await;
        assert_eq!(h.other.claim_count(), 1);
    }

    #[tokio::test]
    async fn failed_redeem_is_swallowed_and_retried() {
        let mut h = harness(swap_in_state(SwapState::InitiatorBailed));
        let tx = observed_lock(&h);
        h.other.set_fail_sends(true);

        h.initiator.on_lock_observed(tx).await;
        assert_eq!(h.initiator.state(), SwapState::ResponderBailed);
        let stored = h.store.load(&h.initiator.swap().id).unwrap().unwrap();
        assert_eq!(stored.state, SwapState::ResponderBailed);
        assert!(stored.responder_bail_transaction.is_some());

        h.other.set_fail_sends(false);
        h.initiator.proceed_next().await.unwrap();
        assert_eq!(h.initiator.state(), SwapState::InitiatorRedeemed);
        assert_eq!(h.other.claim_count(), 1);
    }

    #[tokio::test]
    async fn store_outage_during_lock_observation_defers_claim() {
        let mut h = harness(swap_in_state(SwapState::InitiatorBailed));
        let tx = observed_lock(&h);
        h.store.set_failing(true);

        h.initiator.on_lock_observed(tx.clone()).await;
        assert_eq!(h.initiator.state(), SwapState::ResponderBailed);
        assert!(h.initiator.unflushed);
        assert_eq!(h.other.claim_count(), 0);
        assert_eq!(h.store.update_count(), 0);

        // Store still down: nothing is sent
        assert!(matches!(h.initiator.proceed_next().await, Err(SwapInitiatorError::Storage(_))));
        assert_eq!(h.other.claim_count(), 0);

        h.store.set_failing(false);
        h.initiator.proceed_next().await.unwrap();
        assert!(!h.initiator.unflushed);
        assert_eq!(h.other.claim_count(), 1);
        let stored = h.store.load(&h.initiator.swap().id).unwrap().unwrap();
        assert_eq!(stored.state, SwapState::InitiatorRedeemed);
        assert_eq!(stored.responder_bail_transaction.unwrap().tx_id, tx.tx_id);
        // Flush of ResponderBailed, then InitiatorRedeemed
        assert_eq!(h.store.update_count(), 2);
    }

    #[tokio::test]
    async fn restart_in_bailed_rearms_watch() {
        let mut swap = swap_in_state(SwapState::InitiatorBailed);
        swap.responder_bail_transaction = None;
        let mut h = harness(swap.clone());

        h.initiator.proceed_next().await.unwrap();
        assert_eq!(h.other.watch_count(), 1);
        assert_eq!(h.initiator.swap(), &swap);
        assert!(h.own.calls().is_empty());
    }

    #[tokio::test]
    async fn terminal_state_is_idempotent() {
        let swap = swap_in_state(SwapState::InitiatorRedeemed);
        let mut h = harness(swap.clone());
        for _ in 0..5 {
            h.initiator.proceed_next().await.unwrap();
        }
        assert!(h.own.calls().is_empty());
        assert!(h.other.calls().is_empty());
        assert_eq!(h.store.update_count(), 0);
        assert_eq!(h.initiator.swap(), &swap);
    }

    #[tokio::test]
    async fn persist_failure_never_causes_a_second_lock() {
        let mut h = harness(agreed_swap(100));
        h.store.set_failing(true);

        let err = h.initiator.start().await.unwrap_err();
        assert!(matches!(err, SwapInitiatorError::Storage(_)));
        assert_eq!(h.initiator.state(), SwapState::InitiatorBailed);
        assert_eq!(h.own.lock_count(), 1);

        // Store still down: the flush fails first, nothing else runs
        assert!(h.initiator.proceed_next().await.is_err());
        assert_eq!(h.other.watch_count(), 0);

        h.store.set_failing(false);
        h.initiator.proceed_next().await.unwrap();
        assert_eq!(h.own.lock_count(), 1);
        assert_eq!(h.other.watch_count(), 1);
        let stored = h.store.load(&h.initiator.swap().id).unwrap().unwrap();
        assert_eq!(stored.state, SwapState::InitiatorBailed);
    }

    #[tokio::test]
    async fn claim_observation_is_ignored() {
        let swap = swap_in_state(SwapState::InitiatorRedeemed);
        let mut h = harness(swap.clone());
        h.initiator.on_claim_observed(MockSwapBlockchain::malformed_handle(2)).await;
        assert_eq!(h.initiator.swap(), &swap);
        assert_eq!(h.store.update_count(), 0);
    }

    #[test]
    fn secret_in_fixture_matches_hash() {
        let swap = agreed_swap(1);
        let secret: Secret = swap.secret.unwrap();
        assert!(swap.secret_hash.matches(&secret));
    }
}
