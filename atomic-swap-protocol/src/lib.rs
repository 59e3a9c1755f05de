pub mod config;
pub mod cross_chain;
pub mod crypto;
pub mod data_structures;
pub mod onchain;
pub mod storage;

pub mod test_utils; // Shared fixtures for unit and integration tests
