// Runs a batch of simulated swaps: the initiator is driven through SwapSession,
// the counterparty is scripted against the same two simulated chains.

use atomic_swap_protocol::config::SwapConfig;
use atomic_swap_protocol::cross_chain::{AgreedTerms, Swap, SwapRegistry, SwapSession, SwapState};
use atomic_swap_protocol::crypto::Keystore;
use atomic_swap_protocol::data_structures::{KeyHash, KeyId, Timestamp};
use atomic_swap_protocol::onchain::{ClaimParams, LockParams, SimulatedChain, SwapBlockchain};
use atomic_swap_protocol::storage::FileSwapStore;
use futures::future::join_all;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

const INITIATOR_CHAIN: u64 = 1;
const RESPONDER_CHAIN: u64 = 2;

struct Chains {
    initiator: Arc<SimulatedChain>,
    responder: Arc<SimulatedChain>,
}

// Key hashes of one swap's two parties
struct Wallets {
    initiator_redeem: KeyHash,
    initiator_refund: KeyHash,
    responder_redeem: KeyHash,
    responder_refund: KeyHash,
    responder_redeem_id: KeyId,
}

struct SwapOutcome {
    swap_id: String,
    result: Result<Duration, String>,
}

fn init_logging(config: &SwapConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config() -> Result<SwapConfig, String> {
    match std::env::args().nth(1) {
        Some(path) => SwapConfig::from_json_file(&path).map_err(|e| format!("{}: {}", path, e)),
        None => Ok(SwapConfig::default()),
    }
}

fn new_wallets(keystore: &Keystore, index: usize) -> (Wallets, KeyId) {
    let initiator_redeem_id = KeyId::new(format!("initiator-redeem-{}", index));
    let responder_redeem_id = KeyId::new(format!("responder-redeem-{}", index));
    let wallets = Wallets {
        initiator_redeem: keystore.generate(initiator_redeem_id.clone()),
        initiator_refund: keystore.generate(KeyId::new(format!("initiator-refund-{}", index))),
        responder_redeem: keystore.generate(responder_redeem_id.clone()),
        responder_refund: keystore.generate(KeyId::new(format!("responder-refund-{}", index))),
        responder_redeem_id,
    };
    (wallets, initiator_redeem_id)
}

// Negotiation is out of band: both sides simply agree on the configured periods
fn negotiate(config: &SwapConfig, wallets: &Wallets, redeem_key: KeyId) -> Swap {
    let mut swap = Swap::new(config.default_amount, wallets.initiator_redeem, wallets.initiator_refund, redeem_key);
    swap.record_response(AgreedTerms {
        responder_redeem_pkh: wallets.responder_redeem,
        responder_refund_pkh: wallets.responder_refund,
        initiator_timestamp: Timestamp::after(config.initiator_lock_period),
        responder_timestamp: Timestamp::after(config.responder_lock_period),
    });
    swap
}

/// Advances the initiator until it redeemed. Retryable failures are retried up to
/// `max_proceed_attempts` times; while waiting for the counterparty nothing is sent.
async fn drive_initiator(session: &SwapSession, config: &SwapConfig) -> Result<(), String> {
    let mut failures = 0;
    loop {
        let state = session.state().await;
        if state.is_terminal() {
            return Ok(());
        }
        if state != SwapState::InitiatorBailed {
            match session.proceed_next().await {
                Ok(()) => {}
                // Another caller got there first
                Err(e) if e.is_duplicate_action() => debug!("Swap {}: {}", session.swap_id(), e),
                Err(e) if !e.is_retryable() => return Err(e.to_string()),
                Err(e) => {
                    failures += 1;
                    if failures >= config.max_proceed_attempts {
                        return Err(format!("giving up after {} attempts: {}", failures, e));
                    }
                    warn!("Swap {}: attempt {} failed: {}", session.swap_id(), failures, e);
                }
            }
        }
        tokio::time::sleep(config.retry_interval).await;
    }
}

/// Counterparty side: lock once the initiator's lock is confirmed, then claim it
/// with the secret the initiator reveals.
async fn run_counterparty(
    chains: &Chains,
    config: &SwapConfig,
    session: &SwapSession,
    wallets: &Wallets,
) -> Result<(), String> {
    let swap = session.snapshot().await;
    let terms = swap.terms().cloned().ok_or("swap is not agreed")?;

    let initiator_lock = loop {
        if let Some(tx_id) = session.snapshot().await.initiator_bail_tx_id {
            let confirmations = chains.initiator.confirmations(&tx_id).map_err(|e| e.to_string())?;
            if confirmations.unwrap_or(0) >= config.required_confirmations {
                break tx_id;
            }
        }
        tokio::time::sleep(config.retry_interval).await;
    };

    let own_lock = chains
        .responder
        .send_lock_transaction(LockParams {
            redeem_pkh: swap.initiator_redeem_pkh,
            refund_pkh: wallets.responder_refund,
            secret_hash: swap.secret_hash,
            timelock: terms.responder_timestamp,
            amount: config.default_amount,
        })
        .await
        .map_err(|e| e.to_string())?;

    let secret = loop {
        if let Some(secret) = chains.responder.revealed_secret(&own_lock.tx_id).map_err(|e| e.to_string())? {
            break secret;
        }
        tokio::time::sleep(config.retry_interval).await;
    };

    let lock = chains
        .initiator
        .transaction(&initiator_lock)
        .map_err(|e| e.to_string())?
        .ok_or("initiator lock disappeared")?;
    chains
        .initiator
        .send_claim_transaction(
            &lock,
            ClaimParams {
                redeem_pkh: wallets.responder_redeem,
                redeem_key_id: wallets.responder_redeem_id.clone(),
                refund_pkh: swap.initiator_refund_pkh,
                secret,
                secret_hash: swap.secret_hash,
                timelock: terms.initiator_timestamp,
            },
        )
        .await
        .map_err(|e| e.to_string())?;
    Ok(())
}

async fn run_swap(chains: &Chains, config: &SwapConfig, session: Arc<SwapSession>, wallets: Wallets) -> SwapOutcome {
    let started = Instant::now();
    let both = async {
        let (initiator, counterparty) =
            futures::join!(drive_initiator(&session, config), run_counterparty(chains, config, &session, &wallets));
        initiator.and(counterparty)
    };
    let result = match tokio::time::timeout(config.swap_timeout, both).await {
        Ok(Ok(())) => Ok(started.elapsed()),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(format!("timed out in state {}", session.state().await)),
    };
    SwapOutcome { swap_id: session.swap_id().clone(), result }
}

#[tokio::main]
async fn main() {
    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };
    init_logging(&config);

    let store = match FileSwapStore::open(&config.store_dir) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("Cannot open swap store {}: {}", config.store_dir.display(), e);
            std::process::exit(1);
        }
    };

    let keystore = Arc::new(Keystore::new());
    let chains = Chains {
        initiator: Arc::new(SimulatedChain::new(INITIATOR_CHAIN, config.required_confirmations, keystore.clone())),
        responder: Arc::new(SimulatedChain::new(RESPONDER_CHAIN, config.required_confirmations, keystore.clone())),
    };
    let registry = SwapRegistry::new(chains.initiator.clone(), chains.responder.clone(), store);

    // Swaps left over from an earlier run
    match registry.resume_all().await {
        Ok(resumed) if !resumed.is_empty() => info!("Resumed {} persisted swaps", resumed.len()),
        Ok(_) => {}
        Err(e) => warn!("Could not resume persisted swaps: {}", e),
    }

    let miner = {
        let (initiator, responder) = (chains.initiator.clone(), chains.responder.clone());
        let interval = config.retry_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                for chain in [&initiator, &responder] {
                    if let Err(e) = chain.mine_block().await {
                        warn!("Chain {}: mining failed: {}", chain.chain_id(), e);
                    }
                }
            }
        })
    };

    info!("Running {} simulated swaps of {} units", config.simulated_swaps, config.default_amount);
    let mut runs = Vec::with_capacity(config.simulated_swaps);
    for index in 0..config.simulated_swaps {
        let (wallets, redeem_key) = new_wallets(&keystore, index);
        let session = registry.open(negotiate(&config, &wallets, redeem_key)).await;
        runs.push(run_swap(&chains, &config, session, wallets));
    }
    let outcomes = join_all(runs).await;
    miner.abort();

    let completed: Vec<Duration> = outcomes.iter().filter_map(|o| o.result.as_ref().ok().copied()).collect();
    for outcome in &outcomes {
        match &outcome.result {
            Ok(elapsed) => println!("  {} redeemed in {:?}", outcome.swap_id, elapsed),
            Err(e) => println!("  {} FAILED: {}", outcome.swap_id, e),
        }
    }
    println!("Completed {}/{} swaps", completed.len(), outcomes.len());
    if !completed.is_empty() {
        let total: Duration = completed.iter().sum();
        println!("Average time to redeem: {:?}", total / completed.len() as u32);
    }
}
