//! Ledger request and proposal persistence.

use std::sync::Arc;

use sluice_db::{
    traits::{split_proposals, LedgerProposalDatabase, LedgerRequestDatabase, WalletDatabase},
    DbResult,
};
use sluice_primitives::signature::Address;
use sluice_state::{
    ledger::{LedgerProposal, LedgerRequest, LedgerRequestKind, LedgerRequestStatus},
    state::ChannelId,
};
use tracing::*;

/// Handles the ledger-side bookkeeping: fund/defund requests and the
/// per-participant outstanding proposals.
pub struct LedgerManager<D> {
    db: Arc<D>,
}

impl<D: WalletDatabase> LedgerManager<D> {
    pub fn new(db: Arc<D>) -> Self {
        Self { db }
    }

    pub fn get_request(
        &self,
        ledger_channel_id: ChannelId,
        channel_to_be_funded: ChannelId,
        kind: LedgerRequestKind,
    ) -> DbResult<Option<LedgerRequest>> {
        self.db
            .ledger_request_db()
            .get_request(ledger_channel_id, channel_to_be_funded, kind)
    }

    /// Active (queued or pending) requests against a ledger, defunds ordered
    /// by target channel nonce and funds by target channel id.
    pub fn active_requests(&self, ledger_channel_id: ChannelId) -> DbResult<Vec<LedgerRequest>> {
        self.db
            .ledger_request_db()
            .get_active_requests(ledger_channel_id)
    }

    pub fn requests_for_target(
        &self,
        channel_to_be_funded: ChannelId,
    ) -> DbResult<Vec<LedgerRequest>> {
        self.db
            .ledger_request_db()
            .get_requests_for_target(channel_to_be_funded)
    }

    pub fn save_request(&self, request: LedgerRequest) -> DbResult<()> {
        self.db.ledger_request_db().upsert_request(request)
    }

    pub fn set_request_status(
        &self,
        mut request: LedgerRequest,
        status: LedgerRequestStatus,
    ) -> DbResult<()> {
        request.set_status(status);
        self.save_request(request)
    }

    /// Enqueues a new request, annihilating it against a still-queued
    /// opposite request for the same target. A defund arriving while the
    /// fund never left the queue cancels both; nothing was ever allocated,
    /// so there is nothing to release.
    pub fn enqueue_request(&self, request: LedgerRequest) -> DbResult<()> {
        let opposite = match request.kind() {
            LedgerRequestKind::Fund => LedgerRequestKind::Defund,
            LedgerRequestKind::Defund => LedgerRequestKind::Fund,
        };

        if let Some(mut existing) = self.get_request(
            request.ledger_channel_id(),
            request.channel_to_be_funded(),
            opposite,
        )? {
            if existing.status() == LedgerRequestStatus::Queued {
                info!(
                    target_channel = ?request.channel_to_be_funded(),
                    "annihilating queued opposite ledger request"
                );
                existing.set_status(LedgerRequestStatus::Cancelled);
                self.save_request(existing)?;

                let mut request = request;
                request.set_status(LedgerRequestStatus::Cancelled);
                return self.save_request(request);
            }
        }

        self.save_request(request)
    }

    /// The two outstanding proposal rows for a ledger channel, split into
    /// ours and the counterparty's.
    pub fn proposals(
        &self,
        channel_id: ChannelId,
        me: &Address,
    ) -> DbResult<(Option<LedgerProposal>, Option<LedgerProposal>)> {
        let all = self.db.ledger_proposal_db().get_proposals(channel_id)?;
        Ok(split_proposals(all, me))
    }

    pub fn save_proposal(&self, proposal: LedgerProposal) -> DbResult<()> {
        self.db.ledger_proposal_db().upsert_proposal(proposal)
    }

    pub fn clear_proposals(&self, channel_id: ChannelId) -> DbResult<()> {
        self.db.ledger_proposal_db().remove_proposals(channel_id)
    }
}
