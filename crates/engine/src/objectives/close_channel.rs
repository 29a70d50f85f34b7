//! CloseChannel: converge on a fully-signed final state, release ledger
//! funding, and conclude direct funding on chain.

use sluice_db::traits::WalletDatabase;
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

    let channel = ctx.channels.expect_channel(target)?;
    if channel.supported().is_some_and(|s| s.is_final()) {
        let crank = finish_close(ctx, &channel, funding, &mut signed)?;
        return Ok((crank, signed));
    }

    // get a final state of ours into the history
    let already_signed_final = channel
        .latest_signed_by_me()
        .is_some_and(|s| s.is_final());
    if !already_signed_final {
        let latest_is_final = channel.latest().is_some_and(|s| s.is_final());
        if latest_is_final {
            // countersign the counterparty's final state as-is
            let vars = channel
                .latest()
                .ok_or(EngineError::EmptyChannel(target))?
                .state()
                .vars()
                .clone();
            let (updated, ss) = ctx.channels.sign_state(target, vars)?;
            signed.push(ss);
            if updated.supported().is_some_and(|s| s.is_final()) {
                let crank = finish_close(ctx, &updated, funding, &mut signed)?;
                return Ok((crank, signed));
            }
            return Ok((Crank::Waiting(WaitReason::TheirFinalState), signed));
        }

        if channel.is_my_turn() {
            let supported = channel
                .supported()
                .ok_or(EngineError::EmptyChannel(target))?;
            let vars = StateVars {
                turn_num: supported.turn_num() + 1,
                is_final: true,
                app_data: supported.state().app_data().to_vec(),
                outcome: supported.state().outcome().clone(),
            };
            let (_, ss) = ctx.channels.sign_state(target, vars)?;
            debug!(channel_id = ?target, turn_num = ss.turn_num(), "signed closing state");
            signed.push(ss);
            return Ok((Crank::Waiting(WaitReason::TheirFinalState), signed));
        }

        return Ok((Crank::Waiting(WaitReason::TheirTurn), signed));
    }

    Ok((Crank::Waiting(WaitReason::TheirFinalState), signed))
}

/// Support is fully final: release the funding.
fn finish_close<D: WalletDatabase, C: ChainService>(
    ctx: &CrankCtx<'_, D, C>,
    channel: &Channel,
    funding: &FundingStrategy,
    signed: &mut Vec<SignedState>,
) -> EngineResult<Crank> {
    let target = channel.channel_id();

    match funding {
        FundingStrategy::Direct => {
            let proof = channel
                .conclusion_proof()
                .ok_or(EngineError::EmptyChannel(target))?;
            submit_guarded(ctx, target, ChainRequestKind::Withdraw, || {
                ctx.chain.conclude_and_withdraw(&proof)
            })?;
            info!(channel_id = ?target, "channel concluded");
            Ok(Crank::Complete)
        }

        FundingStrategy::Ledger(ledger_channel_id) => {
            let request = ctx.ledgers.get_request(
                *ledger_channel_id,
                target,
                LedgerRequestKind::Defund,
            )?;
            match request.map(|r| r.status()) {
                Some(LedgerRequestStatus::Succeeded) => {
                    info!(channel_id = ?target, "channel defunded from ledger");
                    Ok(Crank::Complete)
                }
                Some(LedgerRequestStatus::Queued) | Some(LedgerRequestStatus::Pending) => {
                    signed.extend(crank_ledger_channel(
                        ctx.channels,
                        ctx.ledgers,
                        *ledger_channel_id,
                    )?);
                    let request = ctx.ledgers.get_request(
                        *ledger_channel_id,
                        target,
                        LedgerRequestKind::Defund,
                    )?;
                    if request.is_some_and(|r| r.status() == LedgerRequestStatus::Succeeded) {
                        Ok(Crank::Complete)
                    } else {
                        Ok(Crank::Waiting(WaitReason::LedgerDefunding))
                    }
                }
                Some(_) => Ok(Crank::Failed("ledger could not defund the channel")),
                None => {
                    enqueue_defund(ctx, channel, *ledger_channel_id)?;
                    signed.extend(crank_ledger_channel(
                        ctx.channels,
                        ctx.ledgers,
                        *ledger_channel_id,
                    )?);
                    Ok(Crank::Waiting(WaitReason::LedgerDefunding))
                }
            }
        }

        FundingStrategy::Fake => Ok(Crank::Complete),

        FundingStrategy::Virtual | FundingStrategy::Unknown => {
            Ok(Crank::Failed("cannot release unsupported funding"))
        }
    }
}

fn enqueue_defund<D: WalletDatabase, C>(
    ctx: &CrankCtx<'_, D, C>,
    channel: &Channel,
    ledger_channel_id: ChannelId,
) -> EngineResult<()> {
    let target = channel.channel_id();
    let supported = channel
        .supported()
        .ok_or(EngineError::EmptyChannel(target))?;
    let outcome = supported.state().outcome();

    let ledger = ctx.channels.expect_channel(ledger_channel_id)?;
    let amount_for = |addr| {
        outcome
            .balance_for(&destination_for_address(addr))
            .unwrap_or(Amount::ZERO)
    };
    let request = LedgerRequest::new(
        ledger_channel_id,
        target,
        channel.constants().channel_nonce(),
        LedgerRequestKind::Defund,
        amount_for(&ledger.participants()[0]),
        amount_for(&ledger.participants()[1]),
    );
    debug!(channel_id = ?target, ?ledger_channel_id, "queued ledger defund request");
    ctx.ledgers.enqueue_request(request)?;
    Ok(())
}
