//! OpenChannel: drive a channel through prefund setup, funding and
//! postfund setup.

use sluice_db::traits::{ChainViewDatabase, WalletDatabase};
use sluice_primitives::amount::Amount;
use sluice_state::{
    chain_request::ChainRequestKind,
    channel::Channel,
    ledger::{LedgerRequest, LedgerRequestKind, LedgerRequestStatus},
    objective::FundingStrategy,
    state::{destination_for_address, ChannelId, SignedState, StateVars},
};
use tracing::*;

use crate::{
    chain::ChainService,
    crank::{Crank, WaitReason},
    errors::{EngineError, EngineResult},
    ledger::crank_ledger_channel,
    objectives::{submit_guarded, CrankCtx},
};

pub(crate) fn crank<D: WalletDatabase, C: ChainService>(
    ctx: &CrankCtx<'_, D, C>,
    target: ChannelId,
    funding: &FundingStrategy,
) -> EngineResult<(Crank, Vec<SignedState>)> {
    let mut signed = Vec::new();

    // prefund: sign our setup state if missing, then wait for full support
    let mut channel = ctx.channels.expect_channel(target)?;
    let my_prefund_turn = channel.my_index() as u64;
    let signed_prefund = channel
        .latest_signed_by_me()
        .is_some_and(|s| s.turn_num() >= my_prefund_turn);
    if !signed_prefund {
        let base = channel
            .latest()
            .ok_or(EngineError::EmptyChannel(target))?
            .state()
            .vars()
            .clone();
        let vars = StateVars {
            turn_num: my_prefund_turn,
            is_final: false,
            ..base
        };
        let (updated, ss) = ctx.channels.sign_state(target, vars)?;
        channel = updated;
        signed.push(ss);
    }

    let prefund_turn = channel.constants().pre_fund_turn();
    if !channel
        .supported()
        .is_some_and(|s| s.turn_num() >= prefund_turn)
    {
        return Ok((Crank::Waiting(WaitReason::TheirPreFundSetup), signed));
    }

    // funding, per strategy
    match funding {
        FundingStrategy::Direct => {
            if !direct_funding_complete(ctx, &channel)? {
                return Ok((Crank::Waiting(WaitReason::Funding), signed));
            }
        }
        FundingStrategy::Ledger(ledger_channel_id) => {
            match ledger_funding_step(ctx, &channel, *ledger_channel_id, &mut signed)? {
                LedgerFunding::Funded => {}
                LedgerFunding::InProgress => {
                    return Ok((Crank::Waiting(WaitReason::Funding), signed));
                }
                LedgerFunding::Dead => {
                    return Ok((Crank::Failed("ledger could not fund the channel"), signed));
                }
            }
        }
        FundingStrategy::Fake => {}
        FundingStrategy::Virtual | FundingStrategy::Unknown => {
            return Ok((Crank::Waiting(WaitReason::UnsupportedFunding), signed));
        }
    }

    // postfund: sign ours if missing, then wait for full support
    let channel = ctx.channels.expect_channel(target)?;
    let my_postfund_turn =
        channel.constants().num_participants() as u64 + channel.my_index() as u64;
    let signed_postfund = channel
        .latest_signed_by_me()
        .is_some_and(|s| s.turn_num() >= my_postfund_turn);
    if !signed_postfund {
        let base = channel
            .supported()
            .ok_or(EngineError::EmptyChannel(target))?
            .state()
            .vars()
            .clone();
        let vars = StateVars {
            turn_num: my_postfund_turn,
            is_final: false,
            ..base
        };
        let (_, ss) = ctx.channels.sign_state(target, vars)?;
        signed.push(ss);
    }

    let channel = ctx.channels.expect_channel(target)?;
    if channel
        .supported()
        .is_some_and(|s| s.turn_num() >= channel.constants().post_fund_turn())
    {
        info!(channel_id = ?target, "channel open");
        Ok((Crank::Complete, signed))
    } else {
        Ok((Crank::Waiting(WaitReason::TheirPostFundState), signed))
    }
}

/// Checks on-chain holdings against the prefund allocation and deposits our
/// share once every participant allocated before us has paid in.
fn direct_funding_complete<D: WalletDatabase, C: ChainService>(
    ctx: &CrankCtx<'_, D, C>,
    channel: &Channel,
) -> EngineResult<bool> {
    let target = channel.channel_id();
    let supported = channel
        .supported()
        .ok_or(EngineError::EmptyChannel(target))?;
    let outcome = supported.state().outcome();

    let total = outcome.total().ok_or(EngineError::AmountOverflow(target))?;
    let holdings = ctx.db.chain_view_db().get_holdings(target)?;
    if holdings >= total {
        return Ok(true);
    }

    let my_dest = destination_for_address(channel.my_address());
    let before = outcome
        .allocated_before(&my_dest)
        .ok_or(EngineError::AmountOverflow(target))?;
    let my_amount = outcome.balance_for(&my_dest).unwrap_or(Amount::ZERO);
    let ceiling = before
        .checked_add(my_amount)
        .ok_or(EngineError::AmountOverflow(target))?;

    // our deposit is safe exactly while the chain holds everything before
    // our slot but not yet our share
    if !my_amount.is_zero() && holdings >= before && holdings < ceiling {
        submit_guarded(ctx, target, ChainRequestKind::Fund, || {
            ctx.chain.fund_channel(target, holdings, my_amount)
        })?;
    }

    Ok(false)
}

enum LedgerFunding {
    Funded,
    InProgress,
    Dead,
}

/// Ensures a fund request against the ledger exists, cranks the ledger
/// protocol and reports where the funding stands.
fn ledger_funding_step<D: WalletDatabase, C: ChainService>(
    ctx: &CrankCtx<'_, D, C>,
    channel: &Channel,
    ledger_channel_id: ChannelId,
    signed: &mut Vec<SignedState>,
) -> EngineResult<LedgerFunding> {
    let target = channel.channel_id();

    if ctx
        .ledgers
        .get_request(ledger_channel_id, target, LedgerRequestKind::Fund)?
        .is_none()
    {
        let ledger = ctx.channels.expect_channel(ledger_channel_id)?;
        let supported = channel
            .supported()
            .ok_or(EngineError::EmptyChannel(target))?;
        let outcome = supported.state().outcome();
        let amount_for = |addr| {
            outcome
                .balance_for(&destination_for_address(addr))
                .unwrap_or(Amount::ZERO)
        };
        let request = LedgerRequest::new(
            ledger_channel_id,
            target,
            channel.constants().channel_nonce(),
            LedgerRequestKind::Fund,
            amount_for(&ledger.participants()[0]),
            amount_for(&ledger.participants()[1]),
        );
        debug!(channel_id = ?target, ?ledger_channel_id, "queued ledger fund request");
        ctx.ledgers.enqueue_request(request)?;
    }

    signed.extend(crank_ledger_channel(ctx.channels, ctx.ledgers, ledger_channel_id)?);

    let request = ctx
        .ledgers
        .get_request(ledger_channel_id, target, LedgerRequestKind::Fund)?
        .ok_or(EngineError::EmptyChannel(ledger_channel_id))?;
    Ok(match request.status() {
        LedgerRequestStatus::Succeeded => LedgerFunding::Funded,
        LedgerRequestStatus::Queued | LedgerRequestStatus::Pending => LedgerFunding::InProgress,
        LedgerRequestStatus::Cancelled
        | LedgerRequestStatus::Inconsistent
        | LedgerRequestStatus::InsufficientFunds => LedgerFunding::Dead,
    })
}
