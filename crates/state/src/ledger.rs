//! Ledger funding requests and proposals.

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use sluice_primitives::{amount::Amount, signature::Address};

use crate::{outcome::SimpleAllocationOutcome, state::ChannelId};

/// What a ledger request asks for.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash,
    BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
pub enum LedgerRequestKind {
    /// Allocate ledger funds to the target channel.
    Fund,
    /// Release the target channel's allocation back to the participants.
    Defund,
}

/// Lifecycle of a ledger request. Terminal statuses are final.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
pub enum LedgerRequestStatus {
    /// Wants to be included in the next proposal.
    Queued,
    /// Included in our outstanding proposal.
    Pending,
    /// Reflected in an agreed ledger state.
    Succeeded,
    /// Annihilated against a matching opposite request before proposal.
    Cancelled,
    /// The agreed state disagrees with the requested amount.
    Inconsistent,
    /// The ledger lacks capacity for the fund request.
    InsufficientFunds,
}

impl LedgerRequestStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Queued | Self::Pending)
    }
}

/// A request to change what a ledger channel funds.
///
/// Never deleted; terminal statuses record how the request was resolved.
#[derive(Clone, Debug, Eq, PartialEq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct LedgerRequest {
    ledger_channel_id: ChannelId,
    channel_to_be_funded: ChannelId,
    /// Nonce of the channel to be funded, used to order defunds
    /// deterministically (oldest channel first).
    channel_nonce: u64,
    kind: LedgerRequestKind,
    amount_a: Amount,
    amount_b: Amount,
    status: LedgerRequestStatus,
    missed_opportunity_count: u32,
    last_seen_agreed_turn: Option<u64>,
}

impl LedgerRequest {
    pub fn new(
        ledger_channel_id: ChannelId,
        channel_to_be_funded: ChannelId,
        channel_nonce: u64,
        kind: LedgerRequestKind,
        amount_a: Amount,
        amount_b: Amount,
    ) -> Self {
        Self {
            ledger_channel_id,
            channel_to_be_funded,
            channel_nonce,
            kind,
            amount_a,
            amount_b,
            status: LedgerRequestStatus::Queued,
            missed_opportunity_count: 0,
            last_seen_agreed_turn: None,
        }
    }

    pub fn ledger_channel_id(&self) -> ChannelId {
        self.ledger_channel_id
    }

    pub fn channel_to_be_funded(&self) -> ChannelId {
        self.channel_to_be_funded
    }

    pub fn channel_nonce(&self) -> u64 {
        self.channel_nonce
    }

    pub fn kind(&self) -> LedgerRequestKind {
        self.kind
    }

    pub fn amount_a(&self) -> Amount {
        self.amount_a
    }

    pub fn amount_b(&self) -> Amount {
        self.amount_b
    }

    /// The combined amount the target channel holds in the ledger.
    pub fn total(&self) -> Option<Amount> {
        self.amount_a.checked_add(self.amount_b)
    }

    pub fn status(&self) -> LedgerRequestStatus {
        self.status
    }

    pub fn set_status(&mut self, status: LedgerRequestStatus) {
        self.status = status;
    }

    pub fn missed_opportunity_count(&self) -> u32 {
        self.missed_opportunity_count
    }

    pub fn last_seen_agreed_turn(&self) -> Option<u64> {
        self.last_seen_agreed_turn
    }

    /// Records that the request observed `agreed_turn` as the current
    /// agreed ledger state without being carried into it. Seeing the same
    /// agreed state twice while still queued counts as a missed
    /// opportunity.
    pub fn note_agreed_turn(&mut self, agreed_turn: u64) {
        if self.last_seen_agreed_turn == Some(agreed_turn) {
            self.missed_opportunity_count += 1;
        }
        self.last_seen_agreed_turn = Some(agreed_turn);
    }
}

/// A participant's outstanding proposal for a ledger channel.
///
/// At most one non-null proposal per (channel, signer); cleared once the
/// proposed outcome is agreed or superseded by a higher nonce.
#[derive(Clone, Debug, Eq, PartialEq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct LedgerProposal {
    channel_id: ChannelId,
    signing_address: Address,
    proposal: Option<SimpleAllocationOutcome>,
    nonce: u32,
}

impl LedgerProposal {
    pub fn new(
        channel_id: ChannelId,
        signing_address: Address,
        proposal: Option<SimpleAllocationOutcome>,
        nonce: u32,
    ) -> Self {
        Self {
            channel_id,
            signing_address,
            proposal,
            nonce,
        }
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    pub fn signing_address(&self) -> &Address {
        &self.signing_address
    }

    pub fn proposal(&self) -> Option<&SimpleAllocationOutcome> {
        self.proposal.as_ref()
    }

    pub fn nonce(&self) -> u32 {
        self.nonce
    }

    pub fn clear(&mut self) {
        self.proposal = None;
    }
}
