//! Errors raised by state mutation and the support computation.
//!
//! These are invariant violations in the sense of the protocol: they mean
//! corrupted data or a misbehaving peer, never an expected-blocked condition.

use sluice_primitives::{errors::CryptoError, signature::Address};
use thiserror::Error;

use crate::state::{ChannelId, Destination};

#[derive(Debug, Error)]
pub enum StateError {
    /// Two distinct states at the same turn number both carry our own
    /// signature. We must never do that.
    #[error("multiple self-signed states at turn {0}")]
    MultipleSignedStates(u64),

    /// Duplicate turn numbers survived pruning.
    #[error("duplicate turn number {0} in retained states")]
    DuplicateTurnNumbers(u64),

    /// Retained states are not strictly decreasing by turn number.
    #[error("retained states not sorted by turn number")]
    NotSorted,

    /// A signature recovered to an address that is not a participant.
    #[error("signer {0:?} is not a channel participant")]
    InvalidSignature(Address),

    /// A state was routed to the wrong channel.
    #[error("state for channel {got:?} added to channel {expected:?}")]
    WrongChannel { expected: ChannelId, got: ChannelId },

    /// An allocation was constructed with a repeated destination.
    #[error("duplicate allocation destination {0:?}")]
    DuplicateDestination(Destination),

    /// Checked integer arithmetic failed.
    #[error("allocation amount overflow")]
    AmountOverflow,

    /// Our participant index is out of range for the channel.
    #[error("participant index {0} out of range")]
    InvalidParticipantIndex(usize),

    /// The channel has no supported state where one is required.
    #[error("channel {0:?} has no supported state")]
    NoSupportedState(ChannelId),

    #[error("crypto: {0}")]
    Crypto(#[from] CryptoError),
}

pub type StateResult<T> = Result<T, StateError>;
