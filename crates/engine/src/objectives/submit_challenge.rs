//! SubmitChallenge: register the channel's support with the adjudicator.

use sluice_db::traits::{ChainViewDatabase, WalletDatabase};
use sluice_state::{
    chain_request::ChainRequestKind,
    state::{ChannelId, SignedState},
};
use tracing::*;

use crate::{
    chain::ChainService,
    crank::Crank,
    errors::EngineResult,
    objectives::{submit_guarded, CrankCtx},
};

pub(crate) fn crank<D: WalletDatabase, C: ChainService>(
    ctx: &CrankCtx<'_, D, C>,
    target: ChannelId,
) -> EngineResult<(Crank, Vec<SignedState>)> {
    let status = ctx.db.chain_view_db().get_adjudicator_status(target)?;
    // already finalized on chain: a challenge is pointless
    if status.is_finalized() {
        info!(channel_id = ?target, "channel already finalized, skipping challenge");
        return Ok((Crank::Complete, Vec::new()));
    }
    // a challenge is already running its clock; submitting another would
    // revert on chain
    if status.is_challenge_active() {
        info!(channel_id = ?target, "challenge already registered, skipping");
        return Ok((Crank::Complete, Vec::new()));
    }

    let channel = ctx.channels.expect_channel(target)?;
    if channel.support().is_empty() {
        warn!(channel_id = ?target, "no support to challenge with");
        return Ok((Crank::Failed("channel has no supported state to challenge with"), Vec::new()));
    }

    // earliest to latest, the order the adjudicator verifies in
    let mut proof = channel.support().to_vec();
    proof.reverse();

    submit_guarded(ctx, target, ChainRequestKind::Challenge, || {
        ctx.chain.challenge(&proof)
    })?;
    Ok((Crank::Complete, Vec::new()))
}
