//! Engine error taxonomy.
//!
//! Invariant violations and protocol errors are fatal to the operation that
//! hit them and propagate out; a caller that merely cannot progress gets a
//! waiting result instead of an error.

use sluice_db::DbError;
use sluice_state::{errors::StateError, state::ChannelId};
use thiserror::Error;

use crate::chain::ChainError;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The ledger channel's signature pattern matches neither agreement,
    /// proposal nor counter-proposal. The counterparty is misbehaving or
    /// buggy; retrying cannot help.
    #[error("ledger channel {0} signature pattern violates the protocol")]
    ProtocolViolation(ChannelId),

    /// The follower's counter-proposal contains a change the leader never
    /// proposed. A protocol-following follower only ever narrows.
    #[error("counter-proposal for ledger channel {0} is not a narrowing of our proposal")]
    CounterProposalMismatch(ChannelId),

    #[error("payload must contain exactly 1 signed state, got {0}")]
    MalformedPayload(usize),

    #[error("objective {0} not found")]
    ObjectiveNotFound(ChannelId),

    /// A channel that must carry states by now has none.
    #[error("channel {0} has no states")]
    EmptyChannel(ChannelId),

    #[error("amount arithmetic overflow in channel {0}")]
    AmountOverflow(ChannelId),

    #[error("chain service failure: {0}")]
    Chain(#[from] ChainError),

    #[error("db: {0}")]
    Db(#[from] DbError),

    #[error("state: {0}")]
    State(#[from] StateError),
}

pub type EngineResult<T> = Result<T, EngineError>;
