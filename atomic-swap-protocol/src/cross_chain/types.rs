// Persisted state of a swap, driven by the initiator state machine

use crate::data_structures::{new_swap_id, KeyHash, KeyId, Secret, SecretHash, SwapId, Timestamp, TransactionId};
use crate::onchain::interface::CachedTransaction;
use serde::{Deserialize, Serialize};
use std::fmt;

// Protocol stage of a swap, initiator side
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapState {
    // Negotiation has not completed yet
    Requested,
    // Both parties' key hashes and timelocks are agreed
    Responded,
    // Our lock is on-chain
    InitiatorBailed,
    // Counterparty lock observed and cached
    ResponderBailed,
    // Our claim of the counterparty lock was sent
    InitiatorRedeemed,
}

impl SwapState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SwapState::InitiatorRedeemed)
    }
}

impl fmt::Display for SwapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SwapState::Requested => "requested",
            SwapState::Responded => "responded",
            SwapState::InitiatorBailed => "initiator_bailed",
            SwapState::ResponderBailed => "responder_bailed",
            SwapState::InitiatorRedeemed => "initiator_redeemed",
        };
        f.write_str(name)
    }
}

/// Everything the counterparty contributes during negotiation. Either all of it is
/// known or none of it is.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgreedTerms {
    pub responder_redeem_pkh: KeyHash,
    pub responder_refund_pkh: KeyHash,
    // Timelock of our lock
    pub initiator_timestamp: Timestamp,
    // Timelock of the counterparty lock
    pub responder_timestamp: Timestamp,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Negotiation {
    Pending,
    Agreed(AgreedTerms),
}

impl Negotiation {
    pub fn terms(&self) -> Option<&AgreedTerms> {
        match self {
            Negotiation::Pending => None,
            Negotiation::Agreed(terms) => Some(terms),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Swap {
    pub id: SwapId,
    pub state: SwapState,
    pub secret_hash: SecretHash,
    pub secret: Option<Secret>,
    pub amount: u64,
    pub initiator_redeem_pkh: KeyHash,
    pub initiator_refund_pkh: KeyHash,
    // Key used to sign our claim of the counterparty lock
    pub redeem_pk_id: Option<KeyId>,
    pub negotiation: Negotiation,
    pub responder_bail_transaction: Option<CachedTransaction>,
    #[serde(default)]
    pub initiator_bail_tx_id: Option<TransactionId>,
    #[serde(default)]
    pub initiator_redeem_tx_id: Option<TransactionId>,
}

impl Swap {
    /// Starts a new swap as initiator with a freshly generated secret.
    pub fn new(amount: u64, initiator_redeem_pkh: KeyHash, initiator_refund_pkh: KeyHash, redeem_pk_id: KeyId) -> Self {
        let secret = Secret::random();
        Swap {
            id: new_swap_id(),
            state: SwapState::Requested,
            secret_hash: secret.hash(),
            secret: Some(secret),
            amount,
            initiator_redeem_pkh,
            initiator_refund_pkh,
            redeem_pk_id: Some(redeem_pk_id),
            negotiation: Negotiation::Pending,
            responder_bail_transaction: None,
            initiator_bail_tx_id: None,
            initiator_redeem_tx_id: None,
        }
    }

    /// Records the counterparty's response. Only a `Requested` swap accepts it.
    pub fn record_response(&mut self, terms: AgreedTerms) -> bool {
        if self.state != SwapState::Requested {
            return false;
        }
        if terms.responder_timestamp >= terms.initiator_timestamp {
            log::warn!(
                "Swap {}: responder timelock {} does not expire before ours {}",
                self.id,
                terms.responder_timestamp,
                terms.initiator_timestamp
            );
        }
        self.negotiation = Negotiation::Agreed(terms);
        self.state = SwapState::Responded;
        true
    }

    pub fn terms(&self) -> Option<&AgreedTerms> {
        self.negotiation.terms()
    }
}
