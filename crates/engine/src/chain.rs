//! The on-chain submission boundary.

use sluice_primitives::{amount::Amount, signature::Address};
use sluice_state::state::{ChannelId, SignedState, State};
use thiserror::Error;

/// Failure reported by a chain service implementation.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ChainError(pub String);

pub type ChainResult<T> = Result<T, ChainError>;

/// Submits transactions to the adjudication chain.
///
/// All calls fire and return once the transaction is handed off; the engine
/// never awaits mining. Duplicate-submission protection lives in the engine
/// through [`sluice_state::chain_request::ChainServiceRequest`] records, not
/// here.
pub trait ChainService {
    /// Deposits `amount` into the channel, expecting `held` to already be
    /// on chain (the deposit is only safe once prior participants paid in).
    fn fund_channel(&self, channel_id: ChannelId, held: Amount, amount: Amount)
        -> ChainResult<()>;

    /// Concludes the channel with a proof of final states, earliest first,
    /// and withdraws.
    fn conclude_and_withdraw(&self, proof: &[SignedState]) -> ChainResult<()>;

    /// Pushes the outcome of a state the adjudicator already finalized and
    /// withdraws our share.
    fn push_outcome_and_withdraw(&self, finalized: &State, me: &Address) -> ChainResult<()>;

    /// Registers a challenge with the channel's support, earliest first.
    fn challenge(&self, support: &[SignedState]) -> ChainResult<()>;
}
