//! In-memory stub implementations of the store traits, for tests.

use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;
use sluice_primitives::amount::Amount;
use sluice_state::{
    chain_request::{AdjudicatorStatus, ChainRequestKind, ChainServiceRequest},
    channel::Channel,
    ledger::{LedgerProposal, LedgerRequest, LedgerRequestKind},
    objective::{Objective, ObjectiveId},
    state::ChannelId,
};

use crate::{
    traits::{
        ChainRequestDatabase, ChainViewDatabase, ChannelDatabase, LedgerProposalDatabase,
        LedgerRequestDatabase, ObjectiveDatabase, WalletDatabase,
    },
    DbResult,
};

#[derive(Debug, Default)]
pub struct StubChannelDb {
    channels: RwLock<HashMap<ChannelId, Channel>>,
}

impl ChannelDatabase for StubChannelDb {
    fn get_channel(&self, channel_id: ChannelId) -> DbResult<Option<Channel>> {
        Ok(self.channels.read().get(&channel_id).cloned())
    }

    fn upsert_channel(&self, channel: Channel) -> DbResult<()> {
        self.channels.write().insert(channel.channel_id(), channel);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct StubLedgerRequestDb {
    requests: RwLock<HashMap<(ChannelId, ChannelId, LedgerRequestKind), LedgerRequest>>,
}

impl LedgerRequestDatabase for StubLedgerRequestDb {
    fn get_request(
        &self,
        ledger_channel_id: ChannelId,
        channel_to_be_funded: ChannelId,
        kind: LedgerRequestKind,
    ) -> DbResult<Option<LedgerRequest>> {
        Ok(self
            .requests
            .read()
            .get(&(ledger_channel_id, channel_to_be_funded, kind))
            .cloned())
    }

    fn upsert_request(&self, request: LedgerRequest) -> DbResult<()> {
        self.requests.write().insert(
            (
                request.ledger_channel_id(),
                request.channel_to_be_funded(),
                request.kind(),
            ),
            request,
        );
        Ok(())
    }

    fn get_active_requests(&self, ledger_channel_id: ChannelId) -> DbResult<Vec<LedgerRequest>> {
        let mut found: Vec<LedgerRequest> = self
            .requests
            .read()
            .values()
            .filter(|r| r.ledger_channel_id() == ledger_channel_id && !r.status().is_terminal())
            .cloned()
            .collect();
        // deterministic order for the protocol's sorting to build on
        found.sort_by_key(|r| (r.channel_nonce(), r.channel_to_be_funded()));
        Ok(found)
    }

    fn get_requests_for_target(
        &self,
        channel_to_be_funded: ChannelId,
    ) -> DbResult<Vec<LedgerRequest>> {
        Ok(self
            .requests
            .read()
            .values()
            .filter(|r| r.channel_to_be_funded() == channel_to_be_funded)
            .cloned()
            .collect())
    }
}

#[derive(Debug, Default)]
pub struct StubLedgerProposalDb {
    proposals: RwLock<HashMap<(ChannelId, sluice_primitives::signature::Address), LedgerProposal>>,
}

impl LedgerProposalDatabase for StubLedgerProposalDb {
    fn get_proposals(&self, channel_id: ChannelId) -> DbResult<Vec<LedgerProposal>> {
        let mut found: Vec<LedgerProposal> = self
            .proposals
            .read()
            .values()
            .filter(|p| p.channel_id() == channel_id)
            .cloned()
            .collect();
        found.sort_by_key(|p| *p.signing_address());
        Ok(found)
    }

    fn upsert_proposal(&self, proposal: LedgerProposal) -> DbResult<()> {
        self.proposals
            .write()
            .insert((proposal.channel_id(), *proposal.signing_address()), proposal);
        Ok(())
    }

    fn remove_proposals(&self, channel_id: ChannelId) -> DbResult<()> {
        self.proposals
            .write()
            .retain(|(cid, _), _| *cid != channel_id);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct StubObjectiveDb {
    objectives: RwLock<HashMap<ObjectiveId, Objective>>,
}

impl ObjectiveDatabase for StubObjectiveDb {
    fn get_objective(&self, id: ObjectiveId) -> DbResult<Option<Objective>> {
        Ok(self.objectives.read().get(&id).cloned())
    }

    fn upsert_objective(&self, objective: Objective) -> DbResult<()> {
        self.objectives.write().insert(objective.id(), objective);
        Ok(())
    }

    fn get_objectives_for_channel(&self, channel_id: ChannelId) -> DbResult<Vec<Objective>> {
        let mut found: Vec<Objective> = self
            .objectives
            .read()
            .values()
            .filter(|o| o.target() == channel_id)
            .cloned()
            .collect();
        found.sort_by_key(|o| (o.created_at(), o.id()));
        Ok(found)
    }
}

#[derive(Debug, Default)]
pub struct StubChainRequestDb {
    requests: RwLock<HashMap<(ChannelId, ChainRequestKind), ChainServiceRequest>>,
}

impl ChainRequestDatabase for StubChainRequestDb {
    fn get_request(
        &self,
        channel_id: ChannelId,
        kind: ChainRequestKind,
    ) -> DbResult<Option<ChainServiceRequest>> {
        Ok(self.requests.read().get(&(channel_id, kind)).cloned())
    }

    fn upsert_request(&self, request: ChainServiceRequest) -> DbResult<()> {
        self.requests
            .write()
            .insert((request.channel_id(), request.kind()), request);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct StubChainViewDb {
    holdings: RwLock<HashMap<ChannelId, Amount>>,
    adjudicator: RwLock<HashMap<ChannelId, AdjudicatorStatus>>,
}

impl ChainViewDatabase for StubChainViewDb {
    fn get_holdings(&self, channel_id: ChannelId) -> DbResult<Amount> {
        Ok(self
            .holdings
            .read()
            .get(&channel_id)
            .copied()
            .unwrap_or(Amount::ZERO))
    }

    fn set_holdings(&self, channel_id: ChannelId, amount: Amount) -> DbResult<()> {
        self.holdings.write().insert(channel_id, amount);
        Ok(())
    }

    fn get_adjudicator_status(&self, channel_id: ChannelId) -> DbResult<AdjudicatorStatus> {
        Ok(self
            .adjudicator
            .read()
            .get(&channel_id)
            .cloned()
            .unwrap_or(AdjudicatorStatus::Open))
    }

    fn set_adjudicator_status(
        &self,
        channel_id: ChannelId,
        status: AdjudicatorStatus,
    ) -> DbResult<()> {
        self.adjudicator.write().insert(channel_id, status);
        Ok(())
    }
}

/// A complete in-memory wallet database.
#[derive(Debug, Default)]
pub struct StubWalletDatabase {
    channels: Arc<StubChannelDb>,
    ledger_requests: Arc<StubLedgerRequestDb>,
    ledger_proposals: Arc<StubLedgerProposalDb>,
    objectives: Arc<StubObjectiveDb>,
    chain_requests: Arc<StubChainRequestDb>,
    chain_view: Arc<StubChainViewDb>,
}

impl StubWalletDatabase {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WalletDatabase for StubWalletDatabase {
    type ChannelDB = StubChannelDb;
    type LedgerRequestDB = StubLedgerRequestDb;
    type LedgerProposalDB = StubLedgerProposalDb;
    type ObjectiveDB = StubObjectiveDb;
    type ChainRequestDB = StubChainRequestDb;
    type ChainViewDB = StubChainViewDb;

    fn channel_db(&self) -> &Arc<Self::ChannelDB> {
        &self.channels
    }

    fn ledger_request_db(&self) -> &Arc<Self::LedgerRequestDB> {
        &self.ledger_requests
    }

    fn ledger_proposal_db(&self) -> &Arc<Self::LedgerProposalDB> {
        &self.ledger_proposals
    }

    fn objective_db(&self) -> &Arc<Self::ObjectiveDB> {
        &self.objectives
    }

    fn chain_request_db(&self) -> &Arc<Self::ChainRequestDB> {
        &self.chain_requests
    }

    fn chain_view_db(&self) -> &Arc<Self::ChainViewDB> {
        &self.chain_view
    }
}
