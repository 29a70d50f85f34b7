//! The channel container: signed-state history plus derived support views.

use borsh::{BorshDeserialize, BorshSerialize};
use secp256k1::SecretKey;
use serde::{Deserialize, Serialize};
use sluice_primitives::signature::Address;
use tracing::*;

use crate::{
    errors::{StateError, StateResult},
    state::{ChannelConstants, ChannelId, SignedState, State, StateVars},
    support::{self, SupportView},
};

/// A channel as persisted: constants, our participant index and the signed
/// states we retain, ordered descending by turn number.
///
/// The support views are recomputed after every mutation and never lazily;
/// between mutations they are plain immutable data.
#[derive(Clone, Debug, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Channel {
    id: ChannelId,
    my_index: usize,
    constants: ChannelConstants,
    states: Vec<SignedState>,

    #[borsh(skip)]
    #[serde(skip)]
    view: SupportView,
}

impl Channel {
    pub fn new(constants: ChannelConstants, my_index: usize) -> StateResult<Self> {
        if my_index >= constants.num_participants() {
            return Err(StateError::InvalidParticipantIndex(my_index));
        }
        Ok(Self {
            id: constants.channel_id(),
            my_index,
            constants,
            states: Vec::new(),
            view: SupportView::default(),
        })
    }

    pub fn channel_id(&self) -> ChannelId {
        self.id
    }

    pub fn my_index(&self) -> usize {
        self.my_index
    }

    pub fn constants(&self) -> &ChannelConstants {
        &self.constants
    }

    pub fn participants(&self) -> &[Address] {
        self.constants.participants()
    }

    pub fn my_address(&self) -> &Address {
        &self.constants.participants()[self.my_index]
    }

    /// Whether we are the ledger leader (participant 0).
    pub fn is_leader(&self) -> bool {
        self.my_index == 0
    }

    pub fn states(&self) -> &[SignedState] {
        &self.states
    }

    pub fn view(&self) -> &SupportView {
        &self.view
    }

    pub fn supported(&self) -> Option<&SignedState> {
        self.view.supported()
    }

    pub fn latest(&self) -> Option<&SignedState> {
        self.view.latest()
    }

    pub fn latest_signed_by_me(&self) -> Option<&SignedState> {
        self.view.latest_signed_by_me()
    }

    pub fn support(&self) -> &[SignedState] {
        self.view.support()
    }

    /// Whether it is our turn to move after the currently supported state.
    pub fn is_my_turn(&self) -> bool {
        match self.supported() {
            Some(ss) => self.constants.is_my_turn_after(ss.turn_num(), self.my_index),
            None => false,
        }
    }

    /// The support chain ordered earliest to latest, if it proves a
    /// conclusion (i.e. the supported state is final).
    pub fn conclusion_proof(&self) -> Option<Vec<SignedState>> {
        let supported = self.supported()?;
        if !supported.is_final() {
            return None;
        }
        let mut proof = self.view.support().to_vec();
        proof.reverse();
        Some(proof)
    }

    /// Merges a signed state into the history and recomputes the views.
    ///
    /// States for the wrong channel are rejected; identical states merge
    /// their signature sets. After the merge the invariants of the history
    /// are re-checked and old states buried under the support are pruned.
    pub fn add_signed_state(&mut self, ss: SignedState) -> StateResult<()> {
        if ss.channel_id() != self.id {
            return Err(StateError::WrongChannel {
                expected: self.id,
                got: ss.channel_id(),
            });
        }

        let hash = ss.state_hash();
        match self.states.iter_mut().find(|s| s.state_hash() == hash) {
            Some(existing) => existing.merge_signatures(&ss),
            None => {
                // keep descending turn order, newest first among equals
                let pos = self
                    .states
                    .iter()
                    .position(|s| s.turn_num() <= ss.turn_num())
                    .unwrap_or(self.states.len());
                self.states.insert(pos, ss);
            }
        }

        self.recompute()
    }

    /// Signs a fresh state with our key and merges it in.
    ///
    /// # Errors
    ///
    /// [`StateError::MultipleSignedStates`] if we already signed a
    /// different state at this turn number.
    pub fn sign_state(&mut self, vars: StateVars, sk: &SecretKey) -> StateResult<SignedState> {
        let state = State::new(self.constants.clone(), vars);
        let me = *self.my_address();

        if self.states.iter().any(|s| {
            s.turn_num() == state.turn_num()
                && s.is_signed_by(&me)
                && s.state_hash() != state.state_hash()
        }) {
            return Err(StateError::MultipleSignedStates(state.turn_num()));
        }

        let mut ss = SignedState::new(state);
        ss.sign(sk)?;
        debug!(channel_id = ?self.id, turn_num = ss.turn_num(), "signed state");

        self.add_signed_state(ss.clone())?;
        Ok(ss)
    }

    fn recompute(&mut self) -> StateResult<()> {
        self.check_no_double_self_signing()?;

        let me = *self.my_address();
        self.view = support::compute_support(self.constants.participants(), &me, &self.states);

        self.prune();
        self.check_retained_sorted()?;
        Ok(())
    }

    /// Discards states at turns below the earliest state of the current
    /// support. Without a support the full history is retained; it may
    /// still be needed to establish one.
    ///
    /// The newest fully-signed state is always kept: protocols anchored on
    /// explicit countersignatures still need it after a mover-signed chain
    /// overtakes it.
    fn prune(&mut self) {
        let Some(mut boundary) = self.view.earliest_support_turn() else {
            return;
        };
        if let Some(anchor) = self.states.iter().find(|s| s.is_fully_signed()) {
            boundary = boundary.min(anchor.turn_num());
        }
        let before = self.states.len();
        self.states.retain(|s| s.turn_num() >= boundary);
        let dropped = before - self.states.len();
        if dropped > 0 {
            trace!(channel_id = ?self.id, dropped, "pruned buried states");
        }
    }

    fn check_no_double_self_signing(&self) -> StateResult<()> {
        let me = self.my_address();
        for (i, a) in self.states.iter().enumerate() {
            for b in &self.states[i + 1..] {
                if a.turn_num() == b.turn_num()
                    && a.is_signed_by(me)
                    && b.is_signed_by(me)
                {
                    return Err(StateError::MultipleSignedStates(a.turn_num()));
                }
            }
        }
        Ok(())
    }

    /// Once a support exists the retained states must be strictly
    /// decreasing by turn number; surviving duplicates indicate corruption.
    fn check_retained_sorted(&self) -> StateResult<()> {
        if !self.view.has_support() {
            return Ok(());
        }
        for pair in self.states.windows(2) {
            if pair[0].turn_num() == pair[1].turn_num() {
                return Err(StateError::DuplicateTurnNumbers(pair[0].turn_num()));
            }
            if pair[0].turn_num() < pair[1].turn_num() {
                return Err(StateError::NotSorted);
            }
        }
        Ok(())
    }
}
