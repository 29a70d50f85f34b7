//! Crank outcomes.

use std::fmt;

/// Why a crank could not progress. Not an error; the caller re-cranks when
/// the next message or poll tick arrives.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WaitReason {
    /// Objective exists but the application has not approved it.
    Approval,
    /// Counterparty has not completed the prefund setup.
    TheirPreFundSetup,
    /// Channel funding (on chain or in a ledger) is incomplete.
    Funding,
    /// Counterparty has not completed the postfund setup.
    TheirPostFundState,
    /// Funding strategy this wallet version cannot drive to completion.
    UnsupportedFunding,
    /// Ledger defunding request has not been agreed yet.
    LedgerDefunding,
    /// It is the counterparty's turn to move.
    TheirTurn,
    /// Waiting for the counterparty to sign a final state.
    TheirFinalState,
    /// A chain submission is in flight.
    ChainTransaction,
    /// The channel is not finalized on chain and no conclusion proof exists
    /// locally yet.
    Finalization,
}

impl fmt::Display for WaitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::Approval => "objective approval",
            Self::TheirPreFundSetup => "their prefund setup",
            Self::Funding => "channel funding",
            Self::TheirPostFundState => "their postfund state",
            Self::UnsupportedFunding => "unsupported funding strategy",
            Self::LedgerDefunding => "ledger defunding agreement",
            Self::TheirTurn => "their turn to move",
            Self::TheirFinalState => "their final state",
            Self::ChainTransaction => "chain transaction",
            Self::Finalization => "on-chain finalization or a conclusion proof",
        };
        write!(f, "waiting for {reason}")
    }
}

/// The result of one objective crank. Errors are fatal and travel
/// separately as `Err`; everything here is a normal outcome.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Crank {
    /// Cannot progress right now; re-crank later.
    Waiting(WaitReason),
    /// The objective's goal is reached.
    Complete,
    /// The objective can never be reached; the reason is recorded on the
    /// objective row.
    Failed(&'static str),
}
