//! Channel snapshots for the application layer.

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

use crate::{
    channel::Channel,
    objective::FundingStrategy,
    outcome::SimpleAllocationOutcome,
    state::ChannelId,
};

/// Coarse lifecycle stage of a channel as the application sees it.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
pub enum ChannelStatus {
    /// Known but no states yet.
    Proposed,
    /// Setup underway, postfund not yet supported.
    Opening,
    Running,
    /// A final state exists but is not yet supported.
    Closing,
    /// The supported state is final.
    Closed,
}

/// A point-in-time summary of a channel, emitted after every crank that
/// touched it. Last-write-wins per channel within one response.
#[derive(Clone, Debug, Eq, PartialEq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct ChannelResult {
    channel_id: ChannelId,
    turn_num: u64,
    status: ChannelStatus,
    funding: FundingStrategy,
    allocations: Option<SimpleAllocationOutcome>,
}

impl ChannelResult {
    pub fn from_channel(channel: &Channel, funding: FundingStrategy) -> Self {
        let status = derive_status(channel);
        let best = channel.supported().or(channel.latest());
        Self {
            channel_id: channel.channel_id(),
            turn_num: best.map(|s| s.turn_num()).unwrap_or(0),
            status,
            funding,
            allocations: best.map(|s| s.state().outcome().clone()),
        }
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    pub fn turn_num(&self) -> u64 {
        self.turn_num
    }

    pub fn status(&self) -> ChannelStatus {
        self.status
    }

    pub fn funding(&self) -> &FundingStrategy {
        &self.funding
    }

    pub fn allocations(&self) -> Option<&SimpleAllocationOutcome> {
        self.allocations.as_ref()
    }
}

fn derive_status(channel: &Channel) -> ChannelStatus {
    let Some(latest) = channel.latest() else {
        return ChannelStatus::Proposed;
    };

    if channel.supported().is_some_and(|s| s.is_final()) {
        return ChannelStatus::Closed;
    }
    if latest.is_final() {
        return ChannelStatus::Closing;
    }
    if channel
        .supported()
        .is_some_and(|s| s.turn_num() >= channel.constants().post_fund_turn())
    {
        return ChannelStatus::Running;
    }
    ChannelStatus::Opening
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};
    use secp256k1::SecretKey;
    use sluice_primitives::{
        buf::Buf32,
        signature::{address_for_secret, Address},
    };

    use super::*;
    use crate::{
        outcome::AllocationItem,
        state::{ChannelConstants, SignedState, State, StateVars},
    };

    fn fixture() -> (Vec<SecretKey>, Channel) {
        let mut rng = StdRng::seed_from_u64(21);
        let keys: Vec<SecretKey> = (0..2).map(|_| SecretKey::new(&mut rng)).collect();
        let participants = keys.iter().map(address_for_secret).collect();
        let constants = ChannelConstants::new(1, participants, 1, Address::zero(), 60);
        (keys.clone(), Channel::new(constants, 0).unwrap())
    }

    fn vars(turn_num: u64, is_final: bool) -> StateVars {
        StateVars {
            turn_num,
            is_final,
            app_data: vec![],
            outcome: SimpleAllocationOutcome::new(
                Address::zero(),
                vec![AllocationItem::new(Buf32::new([7; 32]), 5u64.into())],
            )
            .unwrap(),
        }
    }

    fn add_fully_signed(channel: &mut Channel, keys: &[SecretKey], v: StateVars) {
        let mut ss = SignedState::new(State::new(channel.constants().clone(), v));
        for k in keys {
            ss.sign(k).unwrap();
        }
        channel.add_signed_state(ss).unwrap();
    }

    #[test]
    fn test_status_progression() {
        let (keys, mut channel) = fixture();
        assert_eq!(
            ChannelResult::from_channel(&channel, FundingStrategy::Direct).status(),
            ChannelStatus::Proposed
        );

        add_fully_signed(&mut channel, &keys[..1], vars(0, false));
        assert_eq!(
            ChannelResult::from_channel(&channel, FundingStrategy::Direct).status(),
            ChannelStatus::Opening
        );

        add_fully_signed(&mut channel, &keys, vars(3, false));
        assert_eq!(
            ChannelResult::from_channel(&channel, FundingStrategy::Direct).status(),
            ChannelStatus::Running
        );

        add_fully_signed(&mut channel, &keys, vars(4, true));
        let result = ChannelResult::from_channel(&channel, FundingStrategy::Direct);
        assert_eq!(result.status(), ChannelStatus::Closed);
        assert_eq!(result.turn_num(), 4);
    }
}
