//! Dedup records for on-chain submissions.

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

use crate::state::{ChannelId, State};

/// How long a submission is assumed in flight before a retry is allowed.
pub const REQUEST_TIMEOUT_MS: u64 = 10 * 60 * 1000;

/// After this many attempts a request is never resubmitted.
pub const MAX_ATTEMPTS: u32 = 2;

/// The kinds of chain transactions the engine fires.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash,
    BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
pub enum ChainRequestKind {
    Fund,
    Withdraw,
    Challenge,
    PushOutcome,
}

/// A record that some chain transaction was submitted for a channel.
///
/// The engine never awaits mining; it fires the transaction and records
/// this to avoid duplicate submissions. While [`Self::is_valid`] holds the
/// request is considered in flight and must not be resubmitted.
#[derive(Clone, Debug, Eq, PartialEq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct ChainServiceRequest {
    channel_id: ChannelId,
    kind: ChainRequestKind,
    /// Unix millis of the most recent submission.
    timestamp: u64,
    attempts: u32,
}

impl ChainServiceRequest {
    pub fn new(channel_id: ChannelId, kind: ChainRequestKind, now: u64) -> Self {
        Self {
            channel_id,
            kind,
            timestamp: now,
            attempts: 1,
        }
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    pub fn kind(&self) -> ChainRequestKind {
        self.kind
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Records a resubmission.
    pub fn retry(&mut self, now: u64) {
        self.attempts += 1;
        self.timestamp = now;
    }

    /// Whether the request still blocks a new submission: either the last
    /// attempt is younger than [`REQUEST_TIMEOUT_MS`], or the attempt cap
    /// is reached (at which point we never resubmit).
    pub fn is_valid(&self, now: u64) -> bool {
        self.attempts >= MAX_ATTEMPTS || now < self.timestamp.saturating_add(REQUEST_TIMEOUT_MS)
    }
}

/// The adjudicator contract's view of a channel, as mirrored from chain
/// events.
#[derive(Clone, Debug, Eq, PartialEq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub enum AdjudicatorStatus {
    /// No challenge registered and not finalized.
    Open,
    /// A challenge is registered and its clock is running. Chain ingestion
    /// flips this to [`Self::Finalized`] once the deadline passes without a
    /// response.
    Challenged {
        /// Unix millis at which the challenge window closes.
        expires_at: u64,
    },
    /// Finalized on chain with the given state; its outcome can be pushed
    /// and withdrawn.
    Finalized(State),
}

impl AdjudicatorStatus {
    pub fn is_finalized(&self) -> bool {
        matches!(self, Self::Finalized(_))
    }

    pub fn is_challenge_active(&self) -> bool {
        matches!(self, Self::Challenged { .. })
    }
}

#[cfg(test)]
mod tests {
    use sluice_primitives::buf::Buf32;

    use super::*;

    #[test]
    fn test_validity_window_and_attempt_cap() {
        let t0 = 1_000_000;
        let mut req = ChainServiceRequest::new(Buf32::new([1; 32]), ChainRequestKind::Withdraw, t0);

        // fresh request blocks resubmission
        assert!(req.is_valid(t0 + 1));
        assert!(req.is_valid(t0 + REQUEST_TIMEOUT_MS - 1));

        // after the timeout a single-attempt request allows a retry
        assert!(!req.is_valid(t0 + REQUEST_TIMEOUT_MS));

        // second attempt caps it forever
        req.retry(t0 + REQUEST_TIMEOUT_MS);
        assert!(req.is_valid(t0 + REQUEST_TIMEOUT_MS + 1));
        assert!(req.is_valid(t0 + 100 * REQUEST_TIMEOUT_MS));
    }

    #[test]
    fn test_adjudicator_status_queries() {
        let challenged = AdjudicatorStatus::Challenged { expires_at: 1 };
        assert!(challenged.is_challenge_active());
        assert!(!challenged.is_finalized());
        assert!(!AdjudicatorStatus::Open.is_challenge_active());
        assert!(!AdjudicatorStatus::Open.is_finalized());
    }
}
