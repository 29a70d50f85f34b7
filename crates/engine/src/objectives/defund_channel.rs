//! DefundChannel: pull a direct-funded channel's money back on chain.
//!
//! The objective completes on transaction submission, not on confirmation.
//! The dedup records cover the gap: a submitted-but-unmined transaction
//! blocks resubmission until the timeout passes.

use sluice_db::traits::{ChainRequestDatabase, ChainViewDatabase, WalletDatabase};
use sluice_state::{
    chain_request::{AdjudicatorStatus, ChainRequestKind},
    objective::FundingStrategy,
    state::{ChannelId, SignedState},
};
use tracing::*;

use crate::{
    chain::ChainService,
    crank::{Crank, WaitReason},
    errors::EngineResult,
    objectives::{submit_guarded, CrankCtx},
};

pub(crate) fn crank<D: WalletDatabase, C: ChainService>(
    ctx: &CrankCtx<'_, D, C>,
    target: ChannelId,
    funding: &FundingStrategy,
) -> EngineResult<(Crank, Vec<SignedState>)> {
    if matches!(funding, FundingStrategy::Ledger(_)) {
        return Ok((
            Crank::Failed("ledger-funded channels are defunded through their ledger"),
            Vec::new(),
        ));
    }

    // an earlier withdraw or push-outcome still in flight
    let chain_requests = ctx.db.chain_request_db();
    for kind in [ChainRequestKind::Withdraw, ChainRequestKind::PushOutcome] {
        if chain_requests
            .get_request(target, kind)?
            .is_some_and(|r| r.is_valid(ctx.now))
        {
            return Ok((Crank::Waiting(WaitReason::ChainTransaction), Vec::new()));
        }
    }

    if let AdjudicatorStatus::Finalized(state) =
        ctx.db.chain_view_db().get_adjudicator_status(target)?
    {
        submit_guarded(ctx, target, ChainRequestKind::PushOutcome, || {
            ctx.chain
                .push_outcome_and_withdraw(&state, ctx.channels.my_address())
        })?;
        info!(channel_id = ?target, "pushed finalized outcome and withdrew");
        return Ok((Crank::Complete, Vec::new()));
    }

    let channel = ctx.channels.expect_channel(target)?;
    if let Some(proof) = channel.conclusion_proof() {
        submit_guarded(ctx, target, ChainRequestKind::Withdraw, || {
            ctx.chain.conclude_and_withdraw(&proof)
        })?;
        info!(channel_id = ?target, "concluded and withdrew");
        return Ok((Crank::Complete, Vec::new()));
    }

    Ok((Crank::Waiting(WaitReason::Finalization), Vec::new()))
}
