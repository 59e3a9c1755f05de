// Simulated chain hosting the HTLC contract, and a SwapBlockchain port on top of it

use crate::crypto::{self, key_hash, Keystore};
use crate::cross_chain::listener::BlockchainEventListener;
use crate::data_structures::{KeyId, Secret, Timestamp, TransactionId};
use crate::onchain::htlc_contract::{claim_message, refund_message, HtlcCall, HtlcContract, HtlcError};
use crate::onchain::interface::{
    BlockchainError, CachedTransaction, ClaimParams, LockParams, LockWatch, SwapBlockchain, TransactionHandle,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

// A mined block
#[derive(Clone, Debug)]
pub struct Block {
    pub block_number: u64,
    pub timestamp: Timestamp,
    pub transactions: Vec<TransactionId>,
}

#[derive(Clone, Debug)]
struct MinedTransaction {
    call: HtlcCall,
    payload: Vec<u8>,
    block_number: u64,
}

/// Single chain state: mempool, blocks and the HTLC contract.
///
/// Calls are validated against the contract when submitted and again when mined,
/// so a call that became invalid in between (e.g. a second spend of the same lock)
/// is dropped from the mempool without being included.
#[derive(Debug)]
pub struct ChainSimulator {
    pub chain_id: u64,
    pub current_block_number: u64,
    pub blocks: Vec<Block>,
    mempool: Vec<(TransactionId, HtlcCall, Vec<u8>)>,
    mined: HashMap<TransactionId, MinedTransaction>,
    // Mined locks in inclusion order
    lock_order: Vec<TransactionId>,
    contract: HtlcContract,
    nonce: u64,
    // Seconds added to wall-clock time, lets tests expire timelocks
    time_offset: i64,
}

impl ChainSimulator {
    pub fn new(chain_id: u64) -> Self {
        ChainSimulator {
            chain_id,
            current_block_number: 0,
            blocks: Vec::new(),
            mempool: Vec::new(),
            mined: HashMap::new(),
            lock_order: Vec::new(),
            contract: HtlcContract::new(),
            nonce: 0,
            time_offset: 0,
        }
    }

    pub fn now(&self) -> Timestamp {
        Timestamp(Timestamp::now().0.saturating_add(self.time_offset))
    }

    pub fn advance_time(&mut self, by: Duration) {
        let secs = i64::try_from(by.as_secs()).unwrap_or(i64::MAX);
        self.time_offset = self.time_offset.saturating_add(secs);
    }

    /// Validates `call` and puts it in the mempool, returning its id and encoding.
    pub fn submit(&mut self, call: HtlcCall) -> Result<(TransactionId, Vec<u8>), HtlcError> {
        self.contract.validate(&call, self.now())?;
        if let Some(lock_tx) = call.spends() {
            let pending_spend = self.mempool.iter().any(|(_, pending, _)| pending.spends() == Some(lock_tx));
            if pending_spend {
                return Err(HtlcError::AlreadySpent(lock_tx.clone()));
            }
        }

        let payload = call.encode()?;
        self.nonce += 1;
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.chain_id.to_le_bytes());
        hasher.update(&self.nonce.to_le_bytes());
        hasher.update(&payload);
        let tx_id = hasher.finalize().to_hex().to_string();

        log::debug!("Chain {}: accepted {} into mempool", self.chain_id, tx_id);
        self.mempool.push((tx_id.clone(), call, payload.clone()));
        Ok((tx_id, payload))
    }

    /// Mines every mempool call that is still valid at the new block's timestamp.
    pub fn mine_block(&mut self) -> &Block {
        self.current_block_number += 1;
        let timestamp = self.now();
        let mut transactions = Vec::new();

        for (tx_id, call, payload) in std::mem::take(&mut self.mempool) {
            if let Err(e) = self.contract.validate(&call, timestamp) {
                log::warn!("Chain {}: dropping {} at block {}: {}", self.chain_id, tx_id, self.current_block_number, e);
                continue;
            }
            self.contract.apply(&tx_id, &call);
            if call.lock_params().is_some() {
                self.lock_order.push(tx_id.clone());
            }
            self.mined.insert(
                tx_id.clone(),
                MinedTransaction { call, payload, block_number: self.current_block_number },
            );
            transactions.push(tx_id);
        }

        log::debug!("Chain {}: mined block {} with {} txs", self.chain_id, self.current_block_number, transactions.len());
        self.blocks.push(Block { block_number: self.current_block_number, timestamp, transactions });
        &self.blocks[self.blocks.len() - 1]
    }

    /// `None` for unknown transactions, 0 while still in the mempool.
    pub fn confirmations(&self, tx_id: &str) -> Option<u64> {
        if let Some(mined) = self.mined.get(tx_id) {
            return Some(self.current_block_number - mined.block_number + 1);
        }
        self.mempool.iter().any(|(id, _, _)| id == tx_id).then_some(0)
    }

    pub fn handle(&self, tx_id: &str) -> Option<TransactionHandle> {
        let payload = match self.mined.get(tx_id) {
            Some(mined) => mined.payload.clone(),
            None => self.mempool.iter().find(|(id, _, _)| id == tx_id).map(|(_, _, p)| p.clone())?,
        };
        Some(TransactionHandle {
            chain_id: self.chain_id,
            tx_id: tx_id.to_string(),
            payload,
            confirmations: self.confirmations(tx_id).unwrap_or(0),
        })
    }

    // First mined lock matching `watch`
    fn find_lock(&self, watch: &LockWatch) -> Option<&TransactionId> {
        self.lock_order.iter().find(|tx_id| {
            self.mined
                .get(tx_id.as_str())
                .and_then(|mined| mined.call.lock_params())
                .map_or(false, |params| watch.matches(&params))
        })
    }

    // Mined claim spending `lock_tx`, if any
    fn claim_of(&self, lock_tx: &str) -> Option<(&TransactionId, &MinedTransaction)> {
        let spender = self.contract.spent_by(lock_tx)?;
        let mined = self.mined.get(spender)?;
        matches!(mined.call, HtlcCall::Claim { .. }).then_some((spender, mined))
    }

    pub fn revealed_secret(&self, lock_tx: &str) -> Option<Secret> {
        match self.claim_of(lock_tx)?.1.call {
            HtlcCall::Claim { secret, .. } => Some(secret),
            _ => None,
        }
    }
}

struct Watch {
    criteria: LockWatch,
    listener: Arc<dyn BlockchainEventListener>,
    lock_tx: Option<TransactionId>,
    claim_delivered: bool,
}

enum Notification {
    Lock(TransactionHandle),
    Claim(TransactionHandle),
}

/// [`SwapBlockchain`] port backed by a [`ChainSimulator`]. Keys for claims and
/// refunds come from the chain's [`Keystore`].
///
/// Watches are matched after every mined block. Each registration gets at most
/// one lock and one claim notification, delivered after all internal locks are
/// released. Registering the same criteria for the same listener again is a
/// no-op, and a watch is dropped once its claim was delivered.
pub struct SimulatedChain {
    chain_id: u64,
    required_confirmations: u64,
    sim: Mutex<ChainSimulator>,
    keystore: Arc<Keystore>,
    watches: Mutex<Vec<Watch>>,
    offline: AtomicBool,
}

impl SimulatedChain {
    pub fn new(chain_id: u64, required_confirmations: u64, keystore: Arc<Keystore>) -> Self {
        SimulatedChain {
            chain_id,
            required_confirmations,
            sim: Mutex::new(ChainSimulator::new(chain_id)),
            keystore,
            watches: Mutex::new(Vec::new()),
            offline: AtomicBool::new(false),
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn keystore(&self) -> &Arc<Keystore> {
        &self.keystore
    }

    /// While offline every submission and restore fails with `Unavailable`.
    pub fn set_offline(&self, offline: bool) {
        log::info!("Chain {}: {}", self.chain_id, if offline { "going offline" } else { "back online" });
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn block_height(&self) -> Result<u64, BlockchainError> {
        Ok(self.sim()?.current_block_number)
    }

    pub fn confirmations(&self, tx_id: &str) -> Result<Option<u64>, BlockchainError> {
        Ok(self.sim()?.confirmations(tx_id))
    }

    // Looks up a pending or mined transaction
    pub fn transaction(&self, tx_id: &str) -> Result<Option<TransactionHandle>, BlockchainError> {
        Ok(self.sim()?.handle(tx_id))
    }

    pub fn advance_time(&self, by: Duration) -> Result<(), BlockchainError> {
        self.sim()?.advance_time(by);
        Ok(())
    }

    /// Secret published by the claim of `lock_tx`, once that claim is mined.
    pub fn revealed_secret(&self, lock_tx: &str) -> Result<Option<Secret>, BlockchainError> {
        Ok(self.sim()?.revealed_secret(lock_tx))
    }

    /// Refunds `lock_tx` to the holder of `refund_key_id` once its timelock expired.
    pub async fn send_refund_transaction(
        &self,
        lock_tx: &str,
        refund_key_id: &KeyId,
    ) -> Result<TransactionHandle, BlockchainError> {
        self.ensure_online()?;
        let key = self
            .keystore
            .signing_key(refund_key_id)
            .ok_or_else(|| BlockchainError::UnknownKey(refund_key_id.clone()))?;
        let call = HtlcCall::Refund {
            lock_tx: lock_tx.to_string(),
            public_key: key.verifying_key().to_bytes(),
            signature: crypto::sign(&refund_message(lock_tx), &key).to_bytes().to_vec(),
        };
        self.submit(call)
    }

    /// Mines a block, then delivers any watch notifications it produced.
    pub async fn mine_block(&self) -> Result<u64, BlockchainError> {
        let height = {
            let mut sim = self.sim()?;
            sim.mine_block().block_number
        };
        self.poll_watches().await?;
        Ok(height)
    }

    /// Matches registered watches against the chain and notifies their listeners.
    pub async fn poll_watches(&self) -> Result<(), BlockchainError> {
        let pending = self.collect_notifications()?;
        for (listener, notification) in pending {
            match notification {
                Notification::Lock(tx) => listener.on_lock_observed(tx).await,
                Notification::Claim(tx) => listener.on_claim_observed(tx).await,
            }
        }
        Ok(())
    }

    fn collect_notifications(&self) -> Result<Vec<(Arc<dyn BlockchainEventListener>, Notification)>, BlockchainError> {
        let sim = self.sim()?;
        let mut watches = self.watches.lock().map_err(|_| Self::poisoned())?;
        let mut pending = Vec::new();

        for watch in watches.iter_mut() {
            if watch.lock_tx.is_none() {
                let confirmed = sim
                    .find_lock(&watch.criteria)
                    .and_then(|tx_id| sim.handle(tx_id))
                    .filter(|handle| handle.confirmations >= self.required_confirmations);
                if let Some(handle) = confirmed {
                    watch.lock_tx = Some(handle.tx_id.clone());
                    pending.push((watch.listener.clone(), Notification::Lock(handle)));
                }
            }

            if let (Some(lock_tx), false) = (&watch.lock_tx, watch.claim_delivered) {
                if let Some(claim) = sim.claim_of(lock_tx).and_then(|(tx_id, _)| sim.handle(tx_id)) {
                    watch.claim_delivered = true;
                    pending.push((watch.listener.clone(), Notification::Claim(claim)));
                }
            }
        }
        watches.retain(|watch| !watch.claim_delivered);
        Ok(pending)
    }

    fn submit(&self, call: HtlcCall) -> Result<TransactionHandle, BlockchainError> {
        let mut sim = self.sim()?;
        let (tx_id, payload) = sim.submit(call).map_err(|e| match e {
            HtlcError::Encoding(msg) => BlockchainError::MalformedTransaction(msg),
            other => BlockchainError::Submission(other.to_string()),
        })?;
        Ok(TransactionHandle { chain_id: self.chain_id, tx_id, payload, confirmations: 0 })
    }

    fn ensure_online(&self) -> Result<(), BlockchainError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(BlockchainError::Unavailable(format!("chain {} is offline", self.chain_id)));
        }
        Ok(())
    }

    fn sim(&self) -> Result<MutexGuard<'_, ChainSimulator>, BlockchainError> {
        self.sim.lock().map_err(|_| Self::poisoned())
    }

    fn poisoned() -> BlockchainError {
        BlockchainError::Unavailable("simulator state poisoned".to_string())
    }
}

#[async_trait]
impl SwapBlockchain for SimulatedChain {
    async fn send_lock_transaction(&self, params: LockParams) -> Result<TransactionHandle, BlockchainError> {
        self.ensure_online()?;
        let handle = self.submit(HtlcCall::lock(&params))?;
        log::info!("Chain {}: lock {} submitted ({} units until {})", self.chain_id, handle.tx_id, params.amount, params.timelock);
        Ok(handle)
    }

    fn watch_lock_transaction(&self, watch: LockWatch, listener: Arc<dyn BlockchainEventListener>) {
        let mut watches = match self.watches.lock() {
            Ok(watches) => watches,
            Err(_) => {
                log::error!("Chain {}: watch registry poisoned, watch dropped", self.chain_id);
                return;
            }
        };
        let registered = watches
            .iter()
            .any(|w| w.criteria == watch && std::ptr::addr_eq(Arc::as_ptr(&w.listener), Arc::as_ptr(&listener)));
        if registered {
            log::debug!("Chain {}: watch {:?} already registered", self.chain_id, watch);
            return;
        }
        watches.push(Watch { criteria: watch, listener, lock_tx: None, claim_delivered: false });
    }

    async fn restore_lock_transaction(&self, cached: &CachedTransaction) -> Result<TransactionHandle, BlockchainError> {
        self.ensure_online()?;
        if cached.chain_id != self.chain_id {
            return Err(BlockchainError::MalformedTransaction(format!(
                "transaction {} belongs to chain {}",
                cached.tx_id, cached.chain_id
            )));
        }
        let handle = self
            .sim()?
            .handle(&cached.tx_id)
            .ok_or_else(|| BlockchainError::UnknownTransaction(cached.tx_id.clone()))?;
        if handle.payload != cached.payload {
            return Err(BlockchainError::MalformedTransaction(format!("cached payload of {} differs", cached.tx_id)));
        }
        Ok(handle)
    }

    async fn send_claim_transaction(
        &self,
        lock: &TransactionHandle,
        params: ClaimParams,
    ) -> Result<TransactionHandle, BlockchainError> {
        self.ensure_online()?;
        let key = self
            .keystore
            .signing_key(&params.redeem_key_id)
            .ok_or_else(|| BlockchainError::UnknownKey(params.redeem_key_id.clone()))?;
        if key_hash(&key.verifying_key()) != params.redeem_pkh {
            return Err(BlockchainError::Submission(format!(
                "key {} does not match redeem key hash {}",
                params.redeem_key_id, params.redeem_pkh
            )));
        }

        let call = HtlcCall::Claim {
            lock_tx: lock.tx_id.clone(),
            secret: params.secret,
            public_key: key.verifying_key().to_bytes(),
            signature: crypto::sign(&claim_message(&lock.tx_id, &params.secret), &key).to_bytes().to_vec(),
        };
        let handle = self.submit(call)?;
        log::info!("Chain {}: claim {} of lock {} submitted", self.chain_id, handle.tx_id, lock.tx_id);
        Ok(handle)
    }

    fn cacheable_details(&self, tx: &TransactionHandle) -> Result<CachedTransaction, BlockchainError> {
        let call = HtlcCall::decode(&tx.payload).map_err(|e| BlockchainError::MalformedTransaction(e.to_string()))?;
        if call.lock_params().is_none() {
            return Err(BlockchainError::MalformedTransaction(format!("{} is not a lock", tx.tx_id)));
        }
        if tx.confirmations < self.required_confirmations {
            return Err(BlockchainError::NotConfirmed {
                tx_id: tx.tx_id.clone(),
                confirmations: tx.confirmations,
                required: self.required_confirmations,
            });
        }
        Ok(CachedTransaction { chain_id: tx.chain_id, tx_id: tx.tx_id.clone(), payload: tx.payload.clone() })
    }
}
