//! Objectives: persisted, resumable goals advanced one crank at a time.

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use sluice_primitives::{buf::Buf32, hash::compute_borsh_hash};

use crate::state::ChannelId;

/// Identifier for an objective, a hash over its kind and payload.
pub type ObjectiveId = Buf32;

/// How a channel gets funded.
#[derive(Clone, Debug, Eq, PartialEq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub enum FundingStrategy {
    /// Deposit directly on chain.
    Direct,
    /// Reallocate funds inside the given ledger channel.
    Ledger(ChannelId),
    /// Treated as immediately funded, for tests and app-level escrow.
    Fake,
    /// Hub-mediated funding. Not implemented; cranks report it as such
    /// instead of pretending the channel will ever fund.
    Virtual,
    /// Strategy not recognized by this wallet version.
    Unknown,
}

/// Lifecycle of an objective.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
pub enum ObjectiveStatus {
    /// Learned about, not yet approved by the application.
    Pending,
    /// Approved; cranks may take actions.
    Approved,
    /// Rejected by the application; never cranked.
    Rejected,
    Succeeded,
    Failed,
}

impl ObjectiveStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Rejected | Self::Succeeded | Self::Failed)
    }
}

/// The objective kinds this wallet pursues, with their payloads.
#[derive(Clone, Debug, Eq, PartialEq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub enum ObjectiveKind {
    OpenChannel {
        target: ChannelId,
        funding: FundingStrategy,
    },
    CloseChannel {
        target: ChannelId,
        funding: FundingStrategy,
    },
    SubmitChallenge {
        target: ChannelId,
    },
    DefundChannel {
        target: ChannelId,
        funding: FundingStrategy,
    },
}

impl ObjectiveKind {
    pub fn target(&self) -> ChannelId {
        match self {
            Self::OpenChannel { target, .. }
            | Self::CloseChannel { target, .. }
            | Self::SubmitChallenge { target }
            | Self::DefundChannel { target, .. } => *target,
        }
    }

    /// Short label for logs and events.
    pub fn label(&self) -> &'static str {
        match self {
            Self::OpenChannel { .. } => "OpenChannel",
            Self::CloseChannel { .. } => "CloseChannel",
            Self::SubmitChallenge { .. } => "SubmitChallenge",
            Self::DefundChannel { .. } => "DefundChannel",
        }
    }
}

/// A persisted objective.
#[derive(Clone, Debug, Eq, PartialEq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Objective {
    id: ObjectiveId,
    kind: ObjectiveKind,
    status: ObjectiveStatus,
    /// Unix millis. Used for staleness and ordering, not correctness.
    created_at: u64,
    progress_last_made_at: u64,
}

impl Objective {
    pub fn new(kind: ObjectiveKind, status: ObjectiveStatus, now: u64) -> Self {
        Self {
            id: compute_borsh_hash(&kind),
            kind,
            status,
            created_at: now,
            progress_last_made_at: now,
        }
    }

    pub fn id(&self) -> ObjectiveId {
        self.id
    }

    pub fn kind(&self) -> &ObjectiveKind {
        &self.kind
    }

    pub fn target(&self) -> ChannelId {
        self.kind.target()
    }

    pub fn status(&self) -> ObjectiveStatus {
        self.status
    }

    pub fn set_status(&mut self, status: ObjectiveStatus) {
        self.status = status;
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn progress_last_made_at(&self) -> u64 {
        self.progress_last_made_at
    }

    /// Records that a crank made progress.
    pub fn touch(&mut self, now: u64) {
        self.progress_last_made_at = now;
    }
}
