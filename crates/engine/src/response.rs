//! Accumulates the outward-visible effects of one external call.
//!
//! A single push or crank can touch several channels and objectives. The
//! builder collects everything and flushes it as one deduplicated,
//! deterministically ordered response: at most one envelope per recipient,
//! last-write-wins channel results, and the objective events the
//! application layer subscribes to.

use std::collections::BTreeMap;

use sluice_primitives::signature::Address;
use sluice_state::{
    channel_result::ChannelResult,
    objective::Objective,
    state::{ChannelId, SignedState},
};

/// One outgoing message to one peer.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub sender: Address,
    pub recipient: Address,
    pub signed_states: Vec<SignedState>,
    pub objectives: Vec<Objective>,
}

/// An objective reached its goal.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ObjectiveEvent {
    pub channel_id: ChannelId,
    pub kind: &'static str,
}

/// Everything one external call produced.
#[derive(Debug, Default)]
pub struct Response {
    pub outbox: Vec<Envelope>,
    pub channel_results: Vec<ChannelResult>,
    pub created_objectives: Vec<Objective>,
    pub succeeded_objectives: Vec<ObjectiveEvent>,
}

#[derive(Default)]
struct EnvelopeAccum {
    signed_states: Vec<SignedState>,
    objectives: Vec<Objective>,
}

/// Builder for a [`Response`].
pub struct ResponseBuilder {
    sender: Address,
    envelopes: BTreeMap<Address, EnvelopeAccum>,
    channel_results: BTreeMap<ChannelId, ChannelResult>,
    created_objectives: Vec<Objective>,
    succeeded_objectives: Vec<ObjectiveEvent>,
}

impl ResponseBuilder {
    pub fn new(sender: Address) -> Self {
        Self {
            sender,
            envelopes: BTreeMap::new(),
            channel_results: BTreeMap::new(),
            created_objectives: Vec::new(),
            succeeded_objectives: Vec::new(),
        }
    }

    /// Queues a signed state for one recipient, dropping exact duplicates.
    pub fn queue_state(&mut self, recipient: Address, ss: SignedState) {
        let accum = self.envelopes.entry(recipient).or_default();
        if !accum.signed_states.contains(&ss) {
            accum.signed_states.push(ss);
        }
    }

    /// Queues a signed state for every channel participant except us.
    pub fn queue_state_to_peers(&mut self, participants: &[Address], ss: &SignedState) {
        for p in participants {
            if p != &self.sender {
                self.queue_state(*p, ss.clone());
            }
        }
    }

    /// Queues an objective proposal for one recipient, dropping duplicates.
    pub fn queue_objective(&mut self, recipient: Address, objective: Objective) {
        let accum = self.envelopes.entry(recipient).or_default();
        if !accum.objectives.iter().any(|o| o.id() == objective.id()) {
            accum.objectives.push(objective);
        }
    }

    /// Records a channel snapshot. Later writes for the same channel win.
    pub fn record_channel_result(&mut self, result: ChannelResult) {
        self.channel_results.insert(result.channel_id(), result);
    }

    pub fn record_objective_created(&mut self, objective: Objective) {
        if !self
            .created_objectives
            .iter()
            .any(|o| o.id() == objective.id())
        {
            self.created_objectives.push(objective);
        }
    }

    pub fn record_objective_succeeded(&mut self, channel_id: ChannelId, kind: &'static str) {
        let event = ObjectiveEvent { channel_id, kind };
        if !self.succeeded_objectives.contains(&event) {
            self.succeeded_objectives.push(event);
        }
    }

    /// Flushes into a [`Response`]. Signed states within each envelope are
    /// ordered by (channel id descending, turn number ascending) so equal
    /// inputs always serialize identically.
    pub fn finish(self) -> Response {
        let sender = self.sender;
        let outbox = self
            .envelopes
            .into_iter()
            .map(|(recipient, mut accum)| {
                accum.signed_states.sort_by(|a, b| {
                    b.channel_id()
                        .cmp(&a.channel_id())
                        .then(a.turn_num().cmp(&b.turn_num()))
                });
                Envelope {
                    sender,
                    recipient,
                    signed_states: accum.signed_states,
                    objectives: accum.objectives,
                }
            })
            .collect();

        Response {
            outbox,
            channel_results: self.channel_results.into_values().collect(),
            created_objectives: self.created_objectives,
            succeeded_objectives: self.succeeded_objectives,
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};
    use secp256k1::SecretKey;
    use sluice_primitives::{buf::Buf32, signature::address_for_secret};
    use sluice_state::{
        outcome::{AllocationItem, SimpleAllocationOutcome},
        state::{ChannelConstants, State, StateVars},
    };

    use super::*;

    fn signed(nonce: u64, turn_num: u64) -> SignedState {
        let mut rng = StdRng::seed_from_u64(17);
        let keys: Vec<SecretKey> = (0..2).map(|_| SecretKey::new(&mut rng)).collect();
        let constants = ChannelConstants::new(
            1,
            keys.iter().map(address_for_secret).collect(),
            nonce,
            Address::zero(),
            60,
        );
        let vars = StateVars {
            turn_num,
            is_final: false,
            app_data: vec![],
            outcome: SimpleAllocationOutcome::new(
                Address::zero(),
                vec![AllocationItem::new(Buf32::new([1; 32]), 5u64.into())],
            )
            .unwrap(),
        };
        let mut ss = SignedState::new(State::new(constants, vars));
        ss.sign(&keys[0]).unwrap();
        ss
    }

    #[test]
    fn test_one_envelope_per_recipient_with_dedup() {
        let me = Address::new([1; 20]);
        let peer = Address::new([2; 20]);
        let mut builder = ResponseBuilder::new(me);

        let ss = signed(1, 0);
        builder.queue_state(peer, ss.clone());
        builder.queue_state(peer, ss.clone());
        builder.queue_state(peer, signed(1, 1));

        let response = builder.finish();
        assert_eq!(response.outbox.len(), 1, "one envelope per recipient");
        assert_eq!(response.outbox[0].signed_states.len(), 2);
        assert_eq!(response.outbox[0].recipient, peer);
    }

    #[test]
    fn test_states_sorted_channel_desc_turn_asc() {
        let me = Address::new([1; 20]);
        let peer = Address::new([2; 20]);
        let mut builder = ResponseBuilder::new(me);

        builder.queue_state(peer, signed(1, 1));
        builder.queue_state(peer, signed(2, 0));
        builder.queue_state(peer, signed(1, 0));

        let response = builder.finish();
        let states = &response.outbox[0].signed_states;
        let keys: Vec<_> = states
            .iter()
            .map(|s| (s.channel_id(), s.turn_num()))
            .collect();
        let mut expected = keys.clone();
        expected.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        assert_eq!(keys, expected);
    }

    #[test]
    fn test_channel_results_last_write_wins() {
        use sluice_state::{channel::Channel, objective::FundingStrategy};

        let me = Address::new([1; 20]);
        let mut builder = ResponseBuilder::new(me);

        let ss = signed(1, 0);
        let mut channel =
            Channel::new(ss.state().constants().clone(), 0).expect("index in range");
        builder.record_channel_result(ChannelResult::from_channel(
            &channel,
            FundingStrategy::Direct,
        ));
        channel.add_signed_state(ss).unwrap();
        builder.record_channel_result(ChannelResult::from_channel(
            &channel,
            FundingStrategy::Direct,
        ));

        let response = builder.finish();
        assert_eq!(response.channel_results.len(), 1);
        assert_eq!(response.channel_results[0].turn_num(), 0);
        assert!(response.channel_results[0].allocations().is_some());
    }
}
