// Per-swap serialization of initiator entry points, and the registry that owns sessions

use crate::cross_chain::errors::SwapInitiatorError;
use crate::cross_chain::listener::{BlockchainEventListener, WeakListener};
use crate::cross_chain::swap_initiator::SwapInitiator;
use crate::cross_chain::types::{Swap, SwapState};
use crate::data_structures::SwapId;
use crate::onchain::interface::{SwapBlockchain, TransactionHandle};
use crate::storage::{StoreError, SwapStore};
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// A [`SwapInitiator`] behind a per-swap lock. Explicit calls (`start`,
/// `proceed_next`) and watcher callbacks all go through the same mutex, so at most
/// one transition is in flight per swap.
pub struct SwapSession {
    swap_id: SwapId,
    initiator: Mutex<SwapInitiator>,
}

impl SwapSession {
    pub fn new(
        initiator_chain: Arc<dyn SwapBlockchain>,
        responder_chain: Arc<dyn SwapBlockchain>,
        store: Arc<dyn SwapStore>,
        swap: Swap,
    ) -> Arc<Self> {
        Arc::new_cyclic(|session| {
            // The watcher only holds a weak reference back to us
            let events: Arc<dyn BlockchainEventListener> = Arc::new(WeakListener::new(session.clone()));
            SwapSession {
                swap_id: swap.id.clone(),
                initiator: Mutex::new(SwapInitiator::new(initiator_chain, responder_chain, store, events, swap)),
            }
        })
    }

    pub fn swap_id(&self) -> &SwapId {
        &self.swap_id
    }

    pub async fn start(&self) -> Result<(), SwapInitiatorError> {
        self.initiator.lock().await.start().await
    }

    pub async fn proceed_next(&self) -> Result<(), SwapInitiatorError> {
        self.initiator.lock().await.proceed_next().await
    }

    pub async fn state(&self) -> SwapState {
        self.initiator.lock().await.state()
    }

    // Copy of the current in-memory swap
    pub async fn snapshot(&self) -> Swap {
        self.initiator.lock().await.swap().clone()
    }
}

#[async_trait]
impl BlockchainEventListener for SwapSession {
    async fn on_lock_observed(&self, tx: TransactionHandle) {
        self.initiator.lock().await.on_lock_observed(tx).await;
    }

    async fn on_claim_observed(&self, tx: TransactionHandle) {
        self.initiator.lock().await.on_claim_observed(tx).await;
    }
}

/// Owns one [`SwapSession`] per swap id for a pair of chains.
pub struct SwapRegistry {
    initiator_chain: Arc<dyn SwapBlockchain>,
    responder_chain: Arc<dyn SwapBlockchain>,
    store: Arc<dyn SwapStore>,
    sessions: Mutex<HashMap<SwapId, Arc<SwapSession>>>,
}

impl SwapRegistry {
    pub fn new(
        initiator_chain: Arc<dyn SwapBlockchain>,
        responder_chain: Arc<dyn SwapBlockchain>,
        store: Arc<dyn SwapStore>,
    ) -> Self {
        SwapRegistry { initiator_chain, responder_chain, store, sessions: Mutex::new(HashMap::new()) }
    }

    /// Returns the session for `swap.id`, creating it from `swap` if none exists.
    /// An existing session keeps its own (newer) state.
    pub async fn open(&self, swap: Swap) -> Arc<SwapSession> {
        let mut sessions = self.sessions.lock().await;
        sessions
            .entry(swap.id.clone())
            .or_insert_with(|| {
                SwapSession::new(
                    self.initiator_chain.clone(),
                    self.responder_chain.clone(),
                    self.store.clone(),
                    swap,
                )
            })
            .clone()
    }

    pub async fn session(&self, id: &str) -> Option<Arc<SwapSession>> {
        self.sessions.lock().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Reloads every persisted swap and advances each one step. Used after a restart:
    /// swaps waiting for the counterparty get their watch re-armed, swaps with a cached
    /// counterparty lock retry the claim.
    pub async fn resume_all(&self) -> Result<Vec<(SwapId, Result<(), SwapInitiatorError>)>, StoreError> {
        let swaps = self.store.load_all()?;
        log::info!("Resuming {} persisted swaps", swaps.len());

        let mut sessions = Vec::with_capacity(swaps.len());
        for swap in swaps {
            sessions.push(self.open(swap).await);
        }

        let results = join_all(sessions.iter().map(|session| async move {
            let result = session.proceed_next().await;
            if let Err(e) = &result {
                log::warn!("Swap {}: resume failed: {}", session.swap_id(), e);
            }
            (session.swap_id().clone(), result)
        }))
        .await;
        Ok(results)
    }
}
