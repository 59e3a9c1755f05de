// Cross-chain swap module entry point

pub mod errors;
pub mod listener;
pub mod session;
pub mod swap_initiator;
pub mod types;

// Re-export key types
pub use errors::SwapInitiatorError;
pub use listener::{BlockchainEventListener, WeakListener};
pub use session::{SwapRegistry, SwapSession};
pub use swap_initiator::SwapInitiator;
pub use types::{AgreedTerms, Negotiation, Swap, SwapState};
