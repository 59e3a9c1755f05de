// On-chain side of a swap: the chain port, the HTLC contract rules and a simulator

pub mod chain_simulator;
pub mod htlc_contract;
pub mod interface;

// Re-export relevant types for easier use
pub use chain_simulator::{ChainSimulator, SimulatedChain};
pub use interface::{
    BlockchainError, CachedTransaction, ClaimParams, LockParams, LockWatch, SwapBlockchain, TransactionHandle,
};
