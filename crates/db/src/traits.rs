//! Trait definitions for the wallet's store boundary.
//!
//! Each entity gets its own narrow interface; the umbrella
//! [`WalletDatabase`] exists so engine components can be parameterized over
//! one type when threading each trait separately gets cumbersome.

use std::sync::Arc;

use sluice_primitives::{amount::Amount, signature::Address};
use sluice_state::{
    chain_request::{AdjudicatorStatus, ChainRequestKind, ChainServiceRequest},
    channel::Channel,
    ledger::{LedgerProposal, LedgerRequest, LedgerRequestKind},
    objective::{Objective, ObjectiveId},
    state::ChannelId,
};

use crate::DbResult;

/// Umbrella over the per-entity interfaces.
pub trait WalletDatabase {
    type ChannelDB: ChannelDatabase + Send + Sync;
    type LedgerRequestDB: LedgerRequestDatabase + Send + Sync;
    type LedgerProposalDB: LedgerProposalDatabase + Send + Sync;
    type ObjectiveDB: ObjectiveDatabase + Send + Sync;
    type ChainRequestDB: ChainRequestDatabase + Send + Sync;
    type ChainViewDB: ChainViewDatabase + Send + Sync;

    fn channel_db(&self) -> &Arc<Self::ChannelDB>;
    fn ledger_request_db(&self) -> &Arc<Self::LedgerRequestDB>;
    fn ledger_proposal_db(&self) -> &Arc<Self::LedgerProposalDB>;
    fn objective_db(&self) -> &Arc<Self::ObjectiveDB>;
    fn chain_request_db(&self) -> &Arc<Self::ChainRequestDB>;
    fn chain_view_db(&self) -> &Arc<Self::ChainViewDB>;
}

/// Channel rows. Mutations at this level are NOT validated; all channel
/// mutation must go through the channel manager, which holds the row lock.
pub trait ChannelDatabase {
    fn get_channel(&self, channel_id: ChannelId) -> DbResult<Option<Channel>>;

    /// Inserts or replaces the whole channel row.
    fn upsert_channel(&self, channel: Channel) -> DbResult<()>;
}

/// Ledger fund/defund requests, keyed by (ledger, target, kind).
pub trait LedgerRequestDatabase {
    fn get_request(
        &self,
        ledger_channel_id: ChannelId,
        channel_to_be_funded: ChannelId,
        kind: LedgerRequestKind,
    ) -> DbResult<Option<LedgerRequest>>;

    fn upsert_request(&self, request: LedgerRequest) -> DbResult<()>;

    /// All non-terminal (queued or pending) requests against a ledger.
    fn get_active_requests(&self, ledger_channel_id: ChannelId) -> DbResult<Vec<LedgerRequest>>;

    /// All requests that target a given channel, any status.
    fn get_requests_for_target(
        &self,
        channel_to_be_funded: ChannelId,
    ) -> DbResult<Vec<LedgerRequest>>;
}

/// Outstanding ledger proposals, keyed by (channel, signer).
pub trait LedgerProposalDatabase {
    fn get_proposals(&self, channel_id: ChannelId) -> DbResult<Vec<LedgerProposal>>;

    fn upsert_proposal(&self, proposal: LedgerProposal) -> DbResult<()>;

    fn remove_proposals(&self, channel_id: ChannelId) -> DbResult<()>;
}

/// Objective rows. Never physically deleted.
pub trait ObjectiveDatabase {
    fn get_objective(&self, id: ObjectiveId) -> DbResult<Option<Objective>>;

    fn upsert_objective(&self, objective: Objective) -> DbResult<()>;

    fn get_objectives_for_channel(&self, channel_id: ChannelId) -> DbResult<Vec<Objective>>;
}

/// Chain submission dedup records, keyed by (channel, kind).
pub trait ChainRequestDatabase {
    fn get_request(
        &self,
        channel_id: ChannelId,
        kind: ChainRequestKind,
    ) -> DbResult<Option<ChainServiceRequest>>;

    fn upsert_request(&self, request: ChainServiceRequest) -> DbResult<()>;
}

/// Chain-derived facts the wallet mirrors: per-channel holdings and the
/// adjudicator's view of the channel. Written by whatever ingests chain
/// events, read by the cranks.
pub trait ChainViewDatabase {
    fn get_holdings(&self, channel_id: ChannelId) -> DbResult<Amount>;

    fn set_holdings(&self, channel_id: ChannelId, amount: Amount) -> DbResult<()>;

    fn get_adjudicator_status(&self, channel_id: ChannelId) -> DbResult<AdjudicatorStatus>;

    fn set_adjudicator_status(
        &self,
        channel_id: ChannelId,
        status: AdjudicatorStatus,
    ) -> DbResult<()>;
}

/// Convenience: which participant's address authored a proposal row.
pub fn split_proposals(
    proposals: Vec<LedgerProposal>,
    me: &Address,
) -> (Option<LedgerProposal>, Option<LedgerProposal>) {
    let mut mine = None;
    let mut theirs = None;
    for p in proposals {
        if p.signing_address() == me {
            mine = Some(p);
        } else {
            theirs = Some(p);
        }
    }
    (mine, theirs)
}
