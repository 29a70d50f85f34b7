//! Per-objective-kind crank state machines.

use std::sync::Arc;

use sluice_db::traits::{ChainRequestDatabase, WalletDatabase};
use sluice_state::{
    chain_request::{ChainRequestKind, ChainServiceRequest},
    objective::{Objective, ObjectiveKind},
    state::{ChannelId, SignedState},
};
use sluice_storage::{ChannelManager, LedgerManager};
use tracing::*;

use crate::{
    chain::{ChainResult, ChainService},
    crank::Crank,
    errors::EngineResult,
};

pub(crate) mod close_channel;
pub(crate) mod defund_channel;
pub(crate) mod open_channel;
pub(crate) mod submit_challenge;

/// Everything a crank needs. The caller holds the channel locks for the
/// duration of the crank.
pub(crate) struct CrankCtx<'a, D, C> {
    pub db: &'a Arc<D>,
    pub channels: &'a ChannelManager<D>,
    pub ledgers: &'a LedgerManager<D>,
    pub chain: &'a C,
    /// Unix millis, fixed for the whole crank.
    pub now: u64,
}

/// Advances an approved objective by one step.
pub(crate) fn crank<D: WalletDatabase, C: ChainService>(
    ctx: &CrankCtx<'_, D, C>,
    objective: &Objective,
) -> EngineResult<(Crank, Vec<SignedState>)> {
    match objective.kind() {
        ObjectiveKind::OpenChannel { target, funding } => {
            open_channel::crank(ctx, *target, funding)
        }
        ObjectiveKind::CloseChannel { target, funding } => {
            close_channel::crank(ctx, *target, funding)
        }
        ObjectiveKind::SubmitChallenge { target } => submit_challenge::crank(ctx, *target),
        ObjectiveKind::DefundChannel { target, funding } => {
            defund_channel::crank(ctx, *target, funding)
        }
    }
}

/// Fires a chain transaction unless a previous submission for the same
/// (channel, kind) is still considered in flight.
///
/// Returns whether a transaction was submitted this call. A request at the
/// attempt cap blocks forever; one past the timeout is retried and the
/// retry recorded.
pub(crate) fn submit_guarded<D: WalletDatabase, C>(
    ctx: &CrankCtx<'_, D, C>,
    channel_id: ChannelId,
    kind: ChainRequestKind,
    submit: impl FnOnce() -> ChainResult<()>,
) -> EngineResult<bool> {
    let db = ctx.db.chain_request_db();
    match db.get_request(channel_id, kind)? {
        Some(req) if req.is_valid(ctx.now) => {
            debug!(?channel_id, ?kind, "chain request still in flight, not resubmitting");
            Ok(false)
        }
        Some(mut req) => {
            submit()?;
            req.retry(ctx.now);
            info!(?channel_id, ?kind, attempts = req.attempts(), "resubmitted chain request");
            db.upsert_request(req)?;
            Ok(true)
        }
        None => {
            submit()?;
            info!(?channel_id, ?kind, "submitted chain request");
            db.upsert_request(ChainServiceRequest::new(channel_id, kind, ctx.now))?;
            Ok(true)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use sluice_db::stubs::StubWalletDatabase;
    use sluice_primitives::{buf::Buf32, signature::Address};
    use sluice_state::{chain_request::REQUEST_TIMEOUT_MS, state::State};

    use super::*;
    use crate::chain::ChainError;

    struct NoopChain;

    impl ChainService for NoopChain {
        fn fund_channel(
            &self,
            _: ChannelId,
            _: sluice_primitives::amount::Amount,
            _: sluice_primitives::amount::Amount,
        ) -> ChainResult<()> {
            Ok(())
        }
        fn conclude_and_withdraw(&self, _: &[SignedState]) -> ChainResult<()> {
            Ok(())
        }
        fn push_outcome_and_withdraw(&self, _: &State, _: &Address) -> ChainResult<()> {
            Ok(())
        }
        fn challenge(&self, _: &[SignedState]) -> ChainResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_submit_guarded_timeout_and_attempt_cap() {
        use rand::{rngs::StdRng, SeedableRng};
        use secp256k1::SecretKey;

        let db = Arc::new(StubWalletDatabase::new());
        let mut rng = StdRng::seed_from_u64(3);
        let channels = ChannelManager::new(db.clone(), SecretKey::new(&mut rng));
        let ledgers = LedgerManager::new(db.clone());
        let chain = NoopChain;
        let channel_id = Buf32::new([4; 32]);
        let calls = AtomicUsize::new(0);

        let submit = || -> ChainResult<()> {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        };

        let t0 = 1_000_000;
        let at = |now| CrankCtx {
            db: &db,
            channels: &channels,
            ledgers: &ledgers,
            chain: &chain,
            now,
        };

        // first submission goes out
        assert!(submit_guarded(&at(t0), channel_id, ChainRequestKind::Withdraw, submit).unwrap());
        // within the timeout: blocked
        assert!(!submit_guarded(&at(t0 + 1), channel_id, ChainRequestKind::Withdraw, submit)
            .unwrap());
        // past the timeout: one retry allowed
        let t1 = t0 + REQUEST_TIMEOUT_MS;
        assert!(submit_guarded(&at(t1), channel_id, ChainRequestKind::Withdraw, submit).unwrap());
        // attempt cap reached: never again, even long after
        let t2 = t1 + 100 * REQUEST_TIMEOUT_MS;
        assert!(!submit_guarded(&at(t2), channel_id, ChainRequestKind::Withdraw, submit).unwrap());

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_submit_guarded_does_not_record_failed_submissions() {
        use rand::{rngs::StdRng, SeedableRng};
        use secp256k1::SecretKey;

        let db = Arc::new(StubWalletDatabase::new());
        let mut rng = StdRng::seed_from_u64(3);
        let channels = ChannelManager::new(db.clone(), SecretKey::new(&mut rng));
        let ledgers = LedgerManager::new(db.clone());
        let chain = NoopChain;
        let channel_id = Buf32::new([4; 32]);

        let ctx = CrankCtx {
            db: &db,
            channels: &channels,
            ledgers: &ledgers,
            chain: &chain,
            now: 1_000_000,
        };
        let err = submit_guarded(&ctx, channel_id, ChainRequestKind::Fund, || {
            Err(ChainError("node unreachable".into()))
        });
        assert!(err.is_err());
        assert!(db
            .chain_request_db()
            .get_request(channel_id, ChainRequestKind::Fund)
            .unwrap()
            .is_none());
    }
}
