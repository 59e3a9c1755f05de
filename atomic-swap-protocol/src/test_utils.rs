// atomic-swap-protocol/src/test_utils.rs
// Fixtures and mocks shared by unit and integration tests.

use crate::cross_chain::listener::BlockchainEventListener;
use crate::cross_chain::types::{AgreedTerms, Negotiation, Swap, SwapState};
use crate::data_structures::{KeyHash, KeyId, Timestamp, TransactionId};
use crate::onchain::htlc_contract::HtlcCall;
use crate::onchain::interface::{
    BlockchainError, CachedTransaction, ClaimParams, LockParams, LockWatch, SwapBlockchain, TransactionHandle,
};
use crate::storage::{InMemorySwapStore, StoreError, SwapStore};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn agreed_terms() -> AgreedTerms {
    AgreedTerms {
        responder_redeem_pkh: KeyHash([0xB1; 20]),
        responder_refund_pkh: KeyHash([0xB2; 20]),
        initiator_timestamp: Timestamp::after(Duration::from_secs(48 * 3600)),
        responder_timestamp: Timestamp::after(Duration::from_secs(24 * 3600)),
    }
}

/// A swap whose negotiation completed (`Responded`), with every field present.
pub fn agreed_swap(amount: u64) -> Swap {
    let mut swap = Swap::new(amount, KeyHash([0xA1; 20]), KeyHash([0xA2; 20]), KeyId::new("initiator-redeem"));
    swap.record_response(agreed_terms());
    swap
}

/// An agreed swap forced into `state`, with the data that state implies
/// (a cached counterparty lock from `ResponderBailed` on).
pub fn swap_in_state(state: SwapState) -> Swap {
    let mut swap = agreed_swap(100);
    if state == SwapState::Requested {
        swap.negotiation = Negotiation::Pending;
    }
    if matches!(state, SwapState::InitiatorBailed | SwapState::ResponderBailed | SwapState::InitiatorRedeemed) {
        swap.initiator_bail_tx_id = Some("initiator-bail".to_string());
    }
    if matches!(state, SwapState::ResponderBailed | SwapState::InitiatorRedeemed) {
        let terms = swap.terms().cloned().unwrap_or_else(agreed_terms);
        let lock = MockSwapBlockchain::lock_handle(
            2,
            &LockParams {
                redeem_pkh: swap.initiator_redeem_pkh,
                refund_pkh: terms.responder_refund_pkh,
                secret_hash: swap.secret_hash,
                timelock: terms.responder_timestamp,
                amount: 70,
            },
        );
        swap.responder_bail_transaction =
            Some(CachedTransaction { chain_id: lock.chain_id, tx_id: lock.tx_id, payload: lock.payload });
    }
    if state == SwapState::InitiatorRedeemed {
        swap.initiator_redeem_tx_id = Some("initiator-redeem".to_string());
    }
    swap.state = state;
    swap
}

/// Fresh, not yet existing directory under the system temp dir.
pub fn temp_store_dir() -> PathBuf {
    std::env::temp_dir().join(format!("swap-store-{}", hex::encode(rand::random::<[u8; 8]>())))
}

// Calls recorded by MockSwapBlockchain, in order
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChainCall {
    Lock(LockParams),
    Watch(LockWatch),
    Restore(CachedTransaction),
    Claim { lock: TransactionId, params: ClaimParams },
}

/// Chain port that records every call and hands out deterministic handles.
pub struct MockSwapBlockchain {
    chain_id: u64,
    calls: Mutex<Vec<ChainCall>>,
    listeners: Mutex<Vec<Arc<dyn BlockchainEventListener>>>,
    fail_sends: AtomicBool,
    restore_error: Mutex<Option<BlockchainError>>,
    sent: AtomicUsize,
}

impl MockSwapBlockchain {
    pub fn new(chain_id: u64) -> Self {
        MockSwapBlockchain {
            chain_id,
            calls: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
            restore_error: Mutex::new(None),
            sent: AtomicUsize::new(0),
        }
    }

    /// A confirmed, well-formed lock as a watcher would report it.
    pub fn lock_handle(chain_id: u64, params: &LockParams) -> TransactionHandle {
        let payload = HtlcCall::lock(params).encode().unwrap_or_default();
        TransactionHandle {
            chain_id,
            tx_id: format!("lock-{}", hex::encode(&params.secret_hash.0[..8])),
            payload,
            confirmations: 1,
        }
    }

    pub fn malformed_handle(chain_id: u64) -> TransactionHandle {
        TransactionHandle { chain_id, tx_id: "garbage".to_string(), payload: vec![0xff; 3], confirmations: 6 }
    }

    pub fn calls(&self) -> Vec<ChainCall> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, pred: impl Fn(&ChainCall) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    pub fn lock_count(&self) -> usize {
        self.count(|c| matches!(c, ChainCall::Lock(_)))
    }

    pub fn watch_count(&self) -> usize {
        self.count(|c| matches!(c, ChainCall::Watch(_)))
    }

    pub fn claim_count(&self) -> usize {
        self.count(|c| matches!(c, ChainCall::Claim { .. }))
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Makes every following restore fail with `error`, or succeed again on `None`.
    pub fn set_restore_error(&self, error: Option<BlockchainError>) {
        *self.restore_error.lock().unwrap() = error;
    }

    /// Delivers `tx` to every registered watcher, outside the mock's locks.
    pub async fn notify_lock(&self, tx: TransactionHandle) {
        let listeners = self.listeners.lock().unwrap().clone();
        for listener in listeners {
            listener.on_lock_observed(tx.clone()).await;
        }
    }

    fn record(&self, call: ChainCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn next_tx_id(&self, kind: &str) -> TransactionId {
        let n = self.sent.fetch_add(1, Ordering::SeqCst);
        format!("mock-{}-{}-{}", self.chain_id, kind, n)
    }

    fn check_online(&self) -> Result<(), BlockchainError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(BlockchainError::Unavailable(format!("mock chain {} offline", self.chain_id)));
        }
        Ok(())
    }
}

#[async_trait]
impl SwapBlockchain for MockSwapBlockchain {
    async fn send_lock_transaction(&self, params: LockParams) -> Result<TransactionHandle, BlockchainError> {
        self.check_online()?;
        self.record(ChainCall::Lock(params.clone()));
        let mut handle = Self::lock_handle(self.chain_id, &params);
        handle.tx_id = self.next_tx_id("lock");
        handle.confirmations = 0;
        Ok(handle)
    }

    fn watch_lock_transaction(&self, watch: LockWatch, listener: Arc<dyn BlockchainEventListener>) {
        self.record(ChainCall::Watch(watch));
        self.listeners.lock().unwrap().push(listener);
    }

    async fn restore_lock_transaction(&self, cached: &CachedTransaction) -> Result<TransactionHandle, BlockchainError> {
        self.record(ChainCall::Restore(cached.clone()));
        if let Some(e) = self.restore_error.lock().unwrap().clone() {
            return Err(e);
        }
        Ok(TransactionHandle {
            chain_id: cached.chain_id,
            tx_id: cached.tx_id.clone(),
            payload: cached.payload.clone(),
            confirmations: 1,
        })
    }

    async fn send_claim_transaction(
        &self,
        lock: &TransactionHandle,
        params: ClaimParams,
    ) -> Result<TransactionHandle, BlockchainError> {
        self.check_online()?;
        self.record(ChainCall::Claim { lock: lock.tx_id.clone(), params });
        Ok(TransactionHandle {
            chain_id: self.chain_id,
            tx_id: self.next_tx_id("claim"),
            payload: Vec::new(),
            confirmations: 0,
        })
    }

    fn cacheable_details(&self, tx: &TransactionHandle) -> Result<CachedTransaction, BlockchainError> {
        if tx.confirmations == 0 {
            return Err(BlockchainError::NotConfirmed { tx_id: tx.tx_id.clone(), confirmations: 0, required: 1 });
        }
        match HtlcCall::decode(&tx.payload) {
            Ok(HtlcCall::Lock { .. }) => Ok(CachedTransaction {
                chain_id: tx.chain_id,
                tx_id: tx.tx_id.clone(),
                payload: tx.payload.clone(),
            }),
            Ok(_) => Err(BlockchainError::MalformedTransaction(format!("{} is not a lock", tx.tx_id))),
            Err(e) => Err(BlockchainError::MalformedTransaction(e.to_string())),
        }
    }
}

// Listener for initiators built without a session
pub struct NullListener;

#[async_trait]
impl BlockchainEventListener for NullListener {
    async fn on_lock_observed(&self, _tx: TransactionHandle) {}
    async fn on_claim_observed(&self, _tx: TransactionHandle) {}
}

/// In-memory store that can be switched to fail, counting successful updates.
#[derive(Default)]
pub struct FlakyStore {
    inner: InMemorySwapStore,
    failing: AtomicBool,
    updates: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }
}

impl SwapStore for FlakyStore {
    fn update(&self, swap: &Swap) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Storage("store offline".to_string()));
        }
        self.inner.update(swap)?;
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn load(&self, id: &str) -> Result<Option<Swap>, StoreError> {
        self.inner.load(id)
    }

    fn load_all(&self) -> Result<Vec<Swap>, StoreError> {
        self.inner.load_all()
    }
}
