//! The channel support computation.
//!
//! Given the signed states of one channel this works out which state is
//! "supported": the most recent state with a validly-chained run of
//! signatures covering every participant. The computation is a pure function
//! of the state list, so two parties holding the same states always agree on
//! the supported one regardless of the order they received them in.

use std::collections::BTreeSet;

use sluice_primitives::signature::Address;

use crate::state::{SignedState, State};

/// The derived views over a channel's signed states.
///
/// Computed once per load/mutation and treated as immutable afterwards.
#[derive(Clone, Debug, Default)]
pub struct SupportView {
    /// Most recent state with full, validly-chained signature coverage.
    supported: Option<SignedState>,

    /// Highest-turn state regardless of signer completeness.
    latest: Option<SignedState>,

    /// Highest-turn state carrying our own signature.
    latest_signed_by_me: Option<SignedState>,

    /// The maximal run of states, youngest to oldest, establishing
    /// `supported`. Empty when there is no supported state.
    support: Vec<SignedState>,
}

impl SupportView {
    pub fn supported(&self) -> Option<&SignedState> {
        self.supported.as_ref()
    }

    pub fn latest(&self) -> Option<&SignedState> {
        self.latest.as_ref()
    }

    pub fn latest_signed_by_me(&self) -> Option<&SignedState> {
        self.latest_signed_by_me.as_ref()
    }

    pub fn support(&self) -> &[SignedState] {
        &self.support
    }

    pub fn has_support(&self) -> bool {
        !self.support.is_empty()
    }

    /// Turn number of the earliest state in the support, the prune
    /// boundary.
    pub fn earliest_support_turn(&self) -> Option<u64> {
        self.support.last().map(SignedState::turn_num)
    }
}

/// Whether `next` is a legal successor of `current`.
///
/// Turn numbers must be contiguous; a transition into a final state must
/// keep the outcome; setup-phase transitions must keep outcome and app data.
/// Anything after setup is accepted as-is (app-level validation is a
/// separate concern).
pub fn valid_transition(current: &State, next: &State) -> bool {
    if next.turn_num() != current.turn_num() + 1 {
        return false;
    }

    if next.is_final() && next.outcome() != current.outcome() {
        return false;
    }

    if next.in_setup_phase()
        && (next.outcome() != current.outcome() || next.app_data() != current.app_data())
    {
        return false;
    }

    true
}

/// Computes the support views from states sorted descending by turn number.
///
/// Walks from the highest turn downwards accumulating signers. A state only
/// extends the chain if its mover signed it; an invalid transition between
/// consecutive accepted states discards the accumulation and restarts the
/// search at the current state.
pub fn compute_support(
    participants: &[Address],
    my_address: &Address,
    sorted_states: &[SignedState],
) -> SupportView {
    let latest = sorted_states.first().cloned();
    let latest_signed_by_me = sorted_states
        .iter()
        .find(|ss| ss.is_signed_by(my_address))
        .cloned();

    let mut support: Vec<SignedState> = Vec::new();
    let mut unsigned: BTreeSet<&Address> = participants.iter().collect();
    let mut previous: Option<&SignedState> = None;

    for ss in sorted_states {
        if let Some(prev) = previous {
            if !valid_transition(ss.state(), prev.state()) {
                support.clear();
                unsigned = participants.iter().collect();
                previous = None;
            }
        }

        if !ss.is_signed_by_mover() {
            continue;
        }

        previous = Some(ss);
        support.push(ss.clone());
        for signer in ss.signers() {
            unsigned.remove(signer);
        }

        if unsigned.is_empty() {
            let supported = support.first().cloned();
            return SupportView {
                supported,
                latest,
                latest_signed_by_me,
                support,
            };
        }
    }

    SupportView {
        supported: None,
        latest,
        latest_signed_by_me,
        support: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use secp256k1::SecretKey;
    use sluice_primitives::{buf::Buf32, signature::address_for_secret};

    use super::*;
    use crate::{
        outcome::{AllocationItem, SimpleAllocationOutcome},
        state::{ChannelConstants, StateVars},
    };

    struct Fixture {
        keys: Vec<SecretKey>,
        constants: ChannelConstants,
    }

    impl Fixture {
        fn new(n: usize) -> Self {
            use rand::{rngs::StdRng, SeedableRng};
            let mut rng = StdRng::seed_from_u64(5);
            let keys: Vec<SecretKey> = (0..n).map(|_| SecretKey::new(&mut rng)).collect();
            let participants = keys.iter().map(address_for_secret).collect();
            let constants = ChannelConstants::new(1, participants, 1, Address::zero(), 60);
            Self { keys, constants }
        }

        fn participants(&self) -> &[Address] {
            self.constants.participants()
        }

        fn me(&self) -> Address {
            address_for_secret(&self.keys[0])
        }

        fn state(&self, turn_num: u64, amount: u64) -> State {
            let outcome = SimpleAllocationOutcome::new(
                Address::zero(),
                vec![AllocationItem::new(Buf32::new([9; 32]), amount.into())],
            )
            .unwrap();
            State::new(
                self.constants.clone(),
                StateVars {
                    turn_num,
                    is_final: false,
                    app_data: vec![],
                    outcome,
                },
            )
        }

        /// Signs `state` with the listed participant indices.
        fn signed(&self, state: State, signers: &[usize]) -> SignedState {
            let mut ss = SignedState::new(state);
            for idx in signers {
                ss.sign(&self.keys[*idx]).expect("fixture key should sign");
            }
            ss
        }
    }

    #[test]
    fn test_fully_signed_single_state_is_supported() {
        let fx = Fixture::new(2);
        let ss = fx.signed(fx.state(0, 5), &[0, 1]);

        let view = compute_support(fx.participants(), &fx.me(), &[ss.clone()]);
        assert_eq!(view.supported().map(|s| s.turn_num()), Some(0));
        assert_eq!(view.support().len(), 1);
        assert_eq!(view.latest().map(|s| s.turn_num()), Some(0));
    }

    #[test]
    fn test_chained_signatures_support_latest() {
        // turn 0 signed by p0 (mover), turn 1 signed by p1 (mover):
        // together they cover both participants, so turn 1 is supported.
        let fx = Fixture::new(2);
        let s1 = fx.signed(fx.state(1, 5), &[1]);
        let s0 = fx.signed(fx.state(0, 5), &[0]);

        let view = compute_support(fx.participants(), &fx.me(), &[s1, s0]);
        assert_eq!(view.supported().map(|s| s.turn_num()), Some(1));
        assert_eq!(view.support().len(), 2, "both states form the support");
        assert_eq!(view.earliest_support_turn(), Some(0));
    }

    #[test]
    fn test_state_not_signed_by_mover_does_not_count() {
        // turn 1's mover is p1 but only p0 signed it.
        let fx = Fixture::new(2);
        let s1 = fx.signed(fx.state(1, 5), &[0]);
        let s0 = fx.signed(fx.state(0, 5), &[0]);

        let view = compute_support(fx.participants(), &fx.me(), &[s1.clone(), s0]);
        assert!(view.supported().is_none());
        assert_eq!(view.latest().map(|s| s.turn_num()), Some(1));
        assert_eq!(view.latest_signed_by_me().map(|s| s.turn_num()), Some(1));
    }

    #[test]
    fn test_setup_phase_outcome_change_breaks_chain() {
        // Outcome changes between setup turns 0 and 1, so the pair cannot
        // form a support even though every participant signed one of them.
        let fx = Fixture::new(2);
        let s1 = fx.signed(fx.state(1, 6), &[1]);
        let s0 = fx.signed(fx.state(0, 5), &[0]);

        let view = compute_support(fx.participants(), &fx.me(), &[s1, s0]);
        assert!(view.supported().is_none());
    }

    #[test]
    fn test_restart_after_invalid_transition_finds_lower_support() {
        // turn 5 signed only by p1, turn 3/2 fully signed. The 5 -> 3 gap is
        // invalid, so the search restarts and finds support at turn 3.
        let fx = Fixture::new(2);
        let post_setup = |fx: &Fixture, turn: u64, amt: u64, signers: &[usize]| {
            fx.signed(fx.state(turn, amt), signers)
        };
        let s5 = post_setup(&fx, 5, 9, &[1]);
        let s3 = post_setup(&fx, 3, 5, &[1]);
        let s2 = post_setup(&fx, 2, 5, &[0]);

        let view = compute_support(fx.participants(), &fx.me(), &[s5, s3, s2]);
        assert_eq!(view.supported().map(|s| s.turn_num()), Some(3));
        assert_eq!(view.support().len(), 2);
    }

    #[test]
    fn test_insertion_order_does_not_matter() {
        // Determinism: the same set of states yields the same support no
        // matter how the (sorted) list was assembled.
        let fx = Fixture::new(2);
        let s2 = fx.signed(fx.state(2, 7), &[0, 1]);
        let s1 = fx.signed(fx.state(1, 5), &[1]);
        let s0 = fx.signed(fx.state(0, 5), &[0]);

        let sorted = vec![s2.clone(), s1.clone(), s0.clone()];
        let view_a = compute_support(fx.participants(), &fx.me(), &sorted);
        let view_b = compute_support(fx.participants(), &fx.me(), &sorted);
        assert_eq!(
            view_a.supported().map(|s| s.state_hash()),
            view_b.supported().map(|s| s.state_hash())
        );
        assert_eq!(view_a.supported().map(|s| s.turn_num()), Some(2));
    }

    #[test]
    fn test_final_state_must_keep_outcome() {
        let fx = Fixture::new(2);
        let final_vars = StateVars {
            turn_num: 5,
            is_final: true,
            app_data: vec![],
            outcome: fx.state(5, 9).outcome().clone(),
        };
        let final_state = State::new(fx.constants.clone(), final_vars);

        // predecessor at turn 4 with a different outcome
        let s4 = fx.signed(fx.state(4, 5), &[0]);
        let s5 = fx.signed(final_state, &[1]);

        let view = compute_support(fx.participants(), &fx.me(), &[s5, s4]);
        assert!(
            view.supported().is_none(),
            "final state with changed outcome must not chain"
        );
    }
}
