//! The ledger reallocation protocol.
//!
//! A ledger channel funds and defunds application channels by moving
//! allocation entries instead of transacting on chain. The leader
//! (participant 0) proposes a new outcome covering its queued requests; the
//! follower either countersigns it, or narrows it to the changes it also
//! wants with a counter-proposal, which the leader must then accept. Any
//! signature pattern outside agreement / proposal / counter-proposal is a
//! protocol violation and fatal.

use sluice_db::traits::WalletDatabase;
use sluice_primitives::{amount::Amount, signature::Address};
use sluice_state::{
    channel::Channel,
    ledger::{LedgerProposal, LedgerRequest, LedgerRequestKind, LedgerRequestStatus},
    outcome::SimpleAllocationOutcome,
    state::{destination_for_address, ChannelId, Destination, SignedState, StateVars},
};
use sluice_storage::{ChannelManager, LedgerManager};
use tracing::*;

use crate::errors::{EngineError, EngineResult};

/// The ledger channel's protocol position, read off the signature pattern
/// of its newest states.
#[derive(Clone, Debug)]
enum Pattern {
    /// Latest state fully signed: both sides agree on the current outcome.
    Agreement(SignedState),
    /// Leader signed a new outcome; follower has not responded.
    Proposal {
        agreed: SignedState,
        proposed: SignedState,
    },
    /// Follower responded with a narrowed outcome; leader must accept.
    CounterProposal {
        agreed: SignedState,
        proposed: SignedState,
        counter: SignedState,
    },
}

fn signed_only_by(ss: &SignedState, addr: &Address) -> bool {
    ss.signatures().len() == 1 && ss.is_signed_by(addr)
}

/// Whether a state can anchor the protocol as the agreed outcome. Setup
/// states are only ever signed by their own mover, so a channel fresh out
/// of setup has no fully-signed state yet; its supported postfund state
/// stands in as the agreement. The open guard in [`crank_ledger_channel`]
/// keeps channels without a supported postfund state out of here.
fn is_agreed(ss: &SignedState) -> bool {
    ss.is_fully_signed() || ss.state().in_setup_phase()
}

fn classify(
    channel_id: ChannelId,
    states: &[SignedState],
    leader: &Address,
    follower: &Address,
) -> EngineResult<Pattern> {
    let latest = states.first().ok_or(EngineError::EmptyChannel(channel_id))?;

    if is_agreed(latest) {
        return Ok(Pattern::Agreement(latest.clone()));
    }

    if signed_only_by(latest, leader) {
        if let Some(prev) = states.get(1) {
            if is_agreed(prev) && latest.turn_num() == prev.turn_num() + 1 {
                return Ok(Pattern::Proposal {
                    agreed: prev.clone(),
                    proposed: latest.clone(),
                });
            }
        }
    }

    if signed_only_by(latest, follower) {
        if let (Some(prev), Some(base)) = (states.get(1), states.get(2)) {
            if signed_only_by(prev, leader)
                && is_agreed(base)
                && latest.turn_num() == prev.turn_num() + 1
                && prev.turn_num() == base.turn_num() + 1
            {
                return Ok(Pattern::CounterProposal {
                    agreed: base.clone(),
                    proposed: prev.clone(),
                    counter: latest.clone(),
                });
            }
        }
    }

    warn!(?channel_id, "unrecognized ledger signature pattern");
    Err(EngineError::ProtocolViolation(channel_id))
}

/// Whether `outcome` reflects the request: a fund's destination carries the
/// exact requested total, a defund's destination is gone.
fn reflects(outcome: &SimpleAllocationOutcome, request: &LedgerRequest) -> bool {
    let dest = request.channel_to_be_funded();
    match request.kind() {
        LedgerRequestKind::Fund => outcome.balance_for(&dest) == request.total(),
        LedgerRequestKind::Defund => !outcome.contains(&dest),
    }
}

/// Applies requests to `base`, defunds first (ordered by target channel
/// nonce), then funds (ordered by target channel id). Returns the candidate
/// outcome, the requests it carries and the fund requests the ledger could
/// not satisfy.
fn build_candidate(
    base: &SimpleAllocationOutcome,
    participants: &[Address],
    requests: &[LedgerRequest],
) -> (
    SimpleAllocationOutcome,
    Vec<LedgerRequest>,
    Vec<LedgerRequest>,
) {
    let dest_a = destination_for_address(&participants[0]);
    let dest_b = destination_for_address(&participants[1]);
    let split = |r: &LedgerRequest| -> [(Destination, Amount); 2] {
        [(dest_a, r.amount_a()), (dest_b, r.amount_b())]
    };

    let mut defunds: Vec<&LedgerRequest> = requests
        .iter()
        .filter(|r| r.kind() == LedgerRequestKind::Defund)
        .collect();
    defunds.sort_by_key(|r| (r.channel_nonce(), r.channel_to_be_funded()));

    let mut funds: Vec<&LedgerRequest> = requests
        .iter()
        .filter(|r| r.kind() == LedgerRequestKind::Fund)
        .collect();
    funds.sort_by_key(|r| r.channel_to_be_funded());

    let mut candidate = base.clone();
    let mut included = Vec::new();
    let mut starved = Vec::new();

    for req in defunds {
        match candidate.remove(&req.channel_to_be_funded(), &split(req)) {
            Some(next) => {
                candidate = next;
                included.push(req.clone());
            }
            None => {
                // amounts disagree with the agreed entry; reconciliation
                // marks the request inconsistent on the next agreement pass
                warn!(target_channel = ?req.channel_to_be_funded(), "defund request does not match agreed entry");
            }
        }
    }

    for req in funds {
        match candidate.add(req.channel_to_be_funded(), &split(req)) {
            Some(next) => {
                candidate = next;
                included.push(req.clone());
            }
            None => starved.push(req.clone()),
        }
    }

    (candidate, included, starved)
}

/// Cranks the ledger protocol for one channel, assuming its lock is held.
///
/// Returns the states signed during the crank so the caller can queue them
/// for the counterparty. A channel still in setup is left to its own
/// open-channel objective.
pub fn crank_ledger_channel<D: WalletDatabase>(
    channels: &ChannelManager<D>,
    ledgers: &LedgerManager<D>,
    ledger_channel_id: ChannelId,
) -> EngineResult<Vec<SignedState>> {
    let mut signed = Vec::new();

    loop {
        let channel = channels.expect_channel(ledger_channel_id)?;

        let open = channel
            .supported()
            .is_some_and(|s| s.turn_num() >= channel.constants().post_fund_turn());
        if !open {
            return Ok(signed);
        }

        let participants = channel.participants().to_vec();
        let pattern = classify(
            ledger_channel_id,
            channel.states(),
            &participants[0],
            &participants[1],
        )?;

        match pattern {
            Pattern::Agreement(agreed) => {
                reconcile(ledgers, ledger_channel_id, &agreed)?;
                if channel.is_leader() {
                    propose(channels, ledgers, &channel, &agreed, &mut signed)?;
                }
                return Ok(signed);
            }

            Pattern::Proposal { agreed, proposed } => {
                if channel.is_leader() {
                    // waiting on the follower
                    return Ok(signed);
                }
                let accepted =
                    respond(channels, ledgers, &channel, &agreed, &proposed, &mut signed)?;
                if !accepted {
                    // counter-proposal sent; now waiting on the leader
                    return Ok(signed);
                }
                // fully agreed: reclassify so the agreement reconciles
            }

            Pattern::CounterProposal {
                agreed,
                proposed,
                counter,
            } => {
                if !channel.is_leader() {
                    // waiting on the leader
                    return Ok(signed);
                }
                accept_counter_proposal(
                    channels,
                    ledger_channel_id,
                    &agreed,
                    &proposed,
                    &counter,
                    &mut signed,
                )?;
                // now agreed: reclassify to reconcile and propose the rest
            }
        }
    }
}

/// Settles request statuses against a newly-agreed outcome and clears the
/// outstanding proposal rows it supersedes.
fn reconcile<D: WalletDatabase>(
    ledgers: &LedgerManager<D>,
    ledger_channel_id: ChannelId,
    agreed: &SignedState,
) -> EngineResult<()> {
    let outcome = agreed.state().outcome();

    let active = ledgers.active_requests(ledger_channel_id)?;

    // matched fund/defund pairs still queued annihilate before proposing
    for req in &active {
        if req.kind() != LedgerRequestKind::Fund || req.status() != LedgerRequestStatus::Queued {
            continue;
        }
        let twin = ledgers.get_request(
            ledger_channel_id,
            req.channel_to_be_funded(),
            LedgerRequestKind::Defund,
        )?;
        if let Some(twin) = twin {
            if twin.status() == LedgerRequestStatus::Queued {
                info!(target_channel = ?req.channel_to_be_funded(), "cancelling matched fund/defund pair");
                ledgers.set_request_status(req.clone(), LedgerRequestStatus::Cancelled)?;
                ledgers.set_request_status(twin, LedgerRequestStatus::Cancelled)?;
            }
        }
    }

    for mut req in ledgers.active_requests(ledger_channel_id)? {
        if reflects(outcome, &req) {
            debug!(target_channel = ?req.channel_to_be_funded(), kind = ?req.kind(), "ledger request agreed");
            ledgers.set_request_status(req, LedgerRequestStatus::Succeeded)?;
            continue;
        }

        match req.kind() {
            // an entry exists for the target but carries the wrong balance
            LedgerRequestKind::Fund => {
                if let Some(balance) = outcome.balance_for(&req.channel_to_be_funded()) {
                    warn!(
                        target_channel = ?req.channel_to_be_funded(),
                        %balance,
                        "agreed balance disagrees with fund request"
                    );
                    ledgers.set_request_status(req, LedgerRequestStatus::Inconsistent)?;
                    continue;
                }
            }
            // the requested amounts do not add up to the agreed entry, so
            // removing it can never conserve funds
            LedgerRequestKind::Defund => {
                if let Some(balance) = outcome.balance_for(&req.channel_to_be_funded()) {
                    if Some(balance) != req.total() {
                        warn!(
                            target_channel = ?req.channel_to_be_funded(),
                            %balance,
                            "agreed balance disagrees with defund request"
                        );
                        ledgers.set_request_status(req, LedgerRequestStatus::Inconsistent)?;
                        continue;
                    }
                }
            }
        }

        // left out of this agreement: back to the queue
        if req.status() == LedgerRequestStatus::Pending {
            req.set_status(LedgerRequestStatus::Queued);
        }
        req.note_agreed_turn(agreed.turn_num());
        ledgers.save_request(req)?;
    }

    ledgers.clear_proposals(ledger_channel_id)?;
    Ok(())
}

/// Leader: sign a proposal covering the queued requests, if any change the
/// agreed outcome.
fn propose<D: WalletDatabase>(
    channels: &ChannelManager<D>,
    ledgers: &LedgerManager<D>,
    channel: &Channel,
    agreed: &SignedState,
    signed: &mut Vec<SignedState>,
) -> EngineResult<()> {
    let ledger_channel_id = channel.channel_id();
    let queued: Vec<LedgerRequest> = ledgers
        .active_requests(ledger_channel_id)?
        .into_iter()
        .filter(|r| r.status() == LedgerRequestStatus::Queued)
        .collect();
    if queued.is_empty() {
        return Ok(());
    }

    let (candidate, included, starved) =
        build_candidate(agreed.state().outcome(), channel.participants(), &queued);

    for req in starved {
        warn!(target_channel = ?req.channel_to_be_funded(), "ledger lacks capacity for fund request");
        ledgers.set_request_status(req, LedgerRequestStatus::InsufficientFunds)?;
    }

    if candidate == *agreed.state().outcome() {
        return Ok(());
    }

    let vars = StateVars {
        turn_num: agreed.turn_num() + 1,
        is_final: false,
        app_data: agreed.state().app_data().to_vec(),
        outcome: candidate.clone(),
    };
    let (_, ss) = channels.sign_state(ledger_channel_id, vars)?;
    info!(?ledger_channel_id, turn_num = ss.turn_num(), "proposed ledger outcome");

    for req in included {
        ledgers.set_request_status(req, LedgerRequestStatus::Pending)?;
    }
    store_my_proposal(ledgers, ledger_channel_id, channels.my_address(), candidate)?;

    signed.push(ss);
    Ok(())
}

/// Follower: countersign the leader's proposal when it matches what we
/// would propose, otherwise counter-propose the overlap. Returns whether
/// the proposal was accepted as-is.
fn respond<D: WalletDatabase>(
    channels: &ChannelManager<D>,
    ledgers: &LedgerManager<D>,
    channel: &Channel,
    agreed: &SignedState,
    proposed: &SignedState,
    signed: &mut Vec<SignedState>,
) -> EngineResult<bool> {
    let ledger_channel_id = channel.channel_id();
    let mine = ledgers.active_requests(ledger_channel_id)?;

    let (my_candidate, _, starved) =
        build_candidate(agreed.state().outcome(), channel.participants(), &mine);
    for req in starved {
        ledgers.set_request_status(req, LedgerRequestStatus::InsufficientFunds)?;
    }

    if *proposed.state().outcome() == my_candidate {
        // full agreement: countersigning the identical state merges our
        // signature onto the leader's
        let (_, ss) = channels.sign_state(ledger_channel_id, proposed.state().vars().clone())?;
        info!(?ledger_channel_id, turn_num = ss.turn_num(), "accepted ledger proposal");
        for req in ledgers.active_requests(ledger_channel_id)? {
            if reflects(proposed.state().outcome(), &req) {
                ledgers.set_request_status(req, LedgerRequestStatus::Pending)?;
            }
        }
        signed.push(ss);
        return Ok(true);
    }

    // Narrow to the requests the leader's proposal also carries.
    let overlapping: Vec<LedgerRequest> = mine
        .into_iter()
        .filter(|r| reflects(proposed.state().outcome(), r))
        .collect();
    let (counter, included, _) =
        build_candidate(agreed.state().outcome(), channel.participants(), &overlapping);

    let vars = StateVars {
        turn_num: proposed.turn_num() + 1,
        is_final: false,
        app_data: agreed.state().app_data().to_vec(),
        outcome: counter.clone(),
    };
    let (_, ss) = channels.sign_state(ledger_channel_id, vars)?;
    info!(
        ?ledger_channel_id,
        turn_num = ss.turn_num(),
        carried = included.len(),
        "counter-proposed narrowed ledger outcome"
    );

    for req in included {
        ledgers.set_request_status(req, LedgerRequestStatus::Pending)?;
    }
    store_my_proposal(ledgers, ledger_channel_id, channels.my_address(), counter)?;

    signed.push(ss);
    Ok(false)
}

/// Leader: a protocol-following follower only ever narrows our proposal, so
/// any change it introduces that we did not propose is fatal. Otherwise we
/// sign the counter-proposal unconditionally.
fn accept_counter_proposal<D: WalletDatabase>(
    channels: &ChannelManager<D>,
    ledger_channel_id: ChannelId,
    agreed: &SignedState,
    proposed: &SignedState,
    counter: &SignedState,
    signed: &mut Vec<SignedState>,
) -> EngineResult<()> {
    let base = agreed.state().outcome();
    let counter_outcome = counter.state().outcome();
    let proposed_outcome = proposed.state().outcome();

    for changed in base.xor(counter_outcome) {
        if proposed_outcome.balance_for(&changed) != counter_outcome.balance_for(&changed) {
            return Err(EngineError::CounterProposalMismatch(ledger_channel_id));
        }
    }

    let (_, ss) = channels.sign_state(ledger_channel_id, counter.state().vars().clone())?;
    info!(?ledger_channel_id, turn_num = ss.turn_num(), "accepted ledger counter-proposal");
    signed.push(ss);
    Ok(())
}

fn store_my_proposal<D: WalletDatabase>(
    ledgers: &LedgerManager<D>,
    ledger_channel_id: ChannelId,
    me: &Address,
    outcome: SimpleAllocationOutcome,
) -> EngineResult<()> {
    let (mine, _) = ledgers.proposals(ledger_channel_id, me)?;
    let nonce = mine.map(|p| p.nonce() + 1).unwrap_or(0);
    ledgers.save_proposal(LedgerProposal::new(
        ledger_channel_id,
        *me,
        Some(outcome),
        nonce,
    ))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};
    use secp256k1::SecretKey;
    use sluice_primitives::buf::Buf32;
    use sluice_primitives::signature::address_for_secret;
    use sluice_state::{
        outcome::AllocationItem,
        state::{ChannelConstants, State},
    };

    use super::*;

    struct Fixture {
        keys: Vec<SecretKey>,
        constants: ChannelConstants,
    }

    impl Fixture {
        fn new() -> Self {
            let mut rng = StdRng::seed_from_u64(31);
            let keys: Vec<SecretKey> = (0..2).map(|_| SecretKey::new(&mut rng)).collect();
            let participants = keys.iter().map(address_for_secret).collect();
            let constants = ChannelConstants::new(1, participants, 8, Address::zero(), 60);
            Self { keys, constants }
        }

        fn leader(&self) -> Address {
            address_for_secret(&self.keys[0])
        }

        fn follower(&self) -> Address {
            address_for_secret(&self.keys[1])
        }

        fn state(&self, turn_num: u64, entries: &[(u8, u64)]) -> State {
            let items = entries
                .iter()
                .map(|(tag, amt)| AllocationItem::new(Buf32::new([*tag; 32]), Amount::from(*amt)))
                .collect();
            State::new(
                self.constants.clone(),
                StateVars {
                    turn_num,
                    is_final: false,
                    app_data: vec![],
                    outcome: SimpleAllocationOutcome::new(Address::zero(), items)
                        .expect("fixture outcome"),
                },
            )
        }

        fn signed(&self, state: State, signers: &[usize]) -> SignedState {
            let mut ss = SignedState::new(state);
            for idx in signers {
                ss.sign(&self.keys[*idx]).expect("fixture signer");
            }
            ss
        }
    }

    #[test]
    fn test_classify_agreement() {
        let fx = Fixture::new();
        let states = [fx.signed(fx.state(5, &[(1, 5)]), &[0, 1])];
        let pattern = classify(
            fx.constants.channel_id(),
            &states,
            &fx.leader(),
            &fx.follower(),
        )
        .expect("fully signed latest is an agreement");
        assert!(matches!(pattern, Pattern::Agreement(_)));
    }

    #[test]
    fn test_classify_proposal_and_counter() {
        let fx = Fixture::new();
        let agreed = fx.signed(fx.state(5, &[(1, 5)]), &[0, 1]);
        let proposed = fx.signed(fx.state(6, &[(1, 3), (2, 2)]), &[0]);
        let counter = fx.signed(fx.state(7, &[(1, 5)]), &[1]);

        let pattern = classify(
            fx.constants.channel_id(),
            &[proposed.clone(), agreed.clone()],
            &fx.leader(),
            &fx.follower(),
        )
        .expect("leader-only latest over an agreement is a proposal");
        assert!(matches!(pattern, Pattern::Proposal { .. }));

        let pattern = classify(
            fx.constants.channel_id(),
            &[counter, proposed, agreed],
            &fx.leader(),
            &fx.follower(),
        )
        .expect("follower-only over leader-only over full is a counter-proposal");
        assert!(matches!(pattern, Pattern::CounterProposal { .. }));
    }

    #[test]
    fn test_classify_anchors_on_supported_setup_state() {
        let fx = Fixture::new();
        // postfund states are mover-signed only, never fully signed
        let postfund = fx.signed(fx.state(3, &[(1, 5)]), &[1]);
        let pattern = classify(
            fx.constants.channel_id(),
            &[postfund.clone()],
            &fx.leader(),
            &fx.follower(),
        )
        .expect("a setup state anchors as agreement");
        assert!(matches!(pattern, Pattern::Agreement(_)));

        let proposed = fx.signed(fx.state(4, &[(1, 3), (2, 2)]), &[0]);
        let pattern = classify(
            fx.constants.channel_id(),
            &[proposed, postfund],
            &fx.leader(),
            &fx.follower(),
        )
        .expect("the first proposal rides on the setup anchor");
        assert!(matches!(pattern, Pattern::Proposal { .. }));
    }

    #[test]
    fn test_classify_rejects_unknown_patterns() {
        let fx = Fixture::new();
        // follower-signed state directly on top of an agreement: the
        // follower never proposes first
        let agreed = fx.signed(fx.state(5, &[(1, 5)]), &[0, 1]);
        let rogue = fx.signed(fx.state(6, &[(1, 4), (2, 1)]), &[1]);

        let err = classify(
            fx.constants.channel_id(),
            &[rogue, agreed],
            &fx.leader(),
            &fx.follower(),
        )
        .expect_err("rogue follower state must be a violation");
        assert!(matches!(err, EngineError::ProtocolViolation(_)));
    }

    #[test]
    fn test_build_candidate_defunds_then_funds() {
        let fx = Fixture::new();
        let participants = fx.constants.participants().to_vec();
        let dest_a = destination_for_address(&participants[0]);
        let dest_b = destination_for_address(&participants[1]);
        let c = Buf32::new([0xcc; 32]);
        let d = Buf32::new([0xdd; 32]);

        let base = SimpleAllocationOutcome::new(
            Address::zero(),
            vec![
                AllocationItem::new(dest_a, 5u64.into()),
                AllocationItem::new(dest_b, 5u64.into()),
                AllocationItem::new(c, 10u64.into()),
            ],
        )
        .unwrap();

        let ledger_id = fx.constants.channel_id();
        let requests = vec![
            LedgerRequest::new(ledger_id, d, 2, LedgerRequestKind::Fund, 1u64.into(), 1u64.into()),
            LedgerRequest::new(ledger_id, c, 1, LedgerRequestKind::Defund, 5u64.into(), 5u64.into()),
        ];

        let (candidate, included, starved) = build_candidate(&base, &participants, &requests);
        assert!(starved.is_empty());
        assert_eq!(included.len(), 2);
        // defund refunds first, then the fund draws from the refunded pot
        assert_eq!(candidate.balance_for(&dest_a), Some(9u64.into()));
        assert_eq!(candidate.balance_for(&dest_b), Some(9u64.into()));
        assert_eq!(candidate.balance_for(&d), Some(2u64.into()));
        assert!(!candidate.contains(&c));
    }

    #[test]
    fn test_build_candidate_reports_starved_fund() {
        let fx = Fixture::new();
        let participants = fx.constants.participants().to_vec();
        let dest_a = destination_for_address(&participants[0]);
        let dest_b = destination_for_address(&participants[1]);
        let d = Buf32::new([0xdd; 32]);

        let base = SimpleAllocationOutcome::new(
            Address::zero(),
            vec![
                AllocationItem::new(dest_a, 1u64.into()),
                AllocationItem::new(dest_b, 1u64.into()),
            ],
        )
        .unwrap();

        let requests = vec![LedgerRequest::new(
            fx.constants.channel_id(),
            d,
            1,
            LedgerRequestKind::Fund,
            5u64.into(),
            5u64.into(),
        )];

        let (candidate, included, starved) = build_candidate(&base, &participants, &requests);
        assert_eq!(candidate, base, "starved fund leaves the outcome alone");
        assert!(included.is_empty());
        assert_eq!(starved.len(), 1);
    }
}
