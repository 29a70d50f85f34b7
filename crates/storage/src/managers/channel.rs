//! Channel persistence with validation.

use std::sync::Arc;

use secp256k1::SecretKey;
use sluice_db::{
    traits::{ChannelDatabase, WalletDatabase},
    DbError, DbResult,
};
use sluice_primitives::signature::{address_for_secret, Address, RecoverableSig};
use sluice_state::{
    channel::Channel,
    state::{ChannelId, SignedState, State, StateVars},
};
use tracing::*;

/// Handles creation, mutation and signing of channel rows.
///
/// All channel writes go through here so that every mutation re-validates
/// signatures, recomputes the support views and enforces the history
/// invariants. Callers must hold the channel's lock for the duration of a
/// read-decide-write sequence.
pub struct ChannelManager<D> {
    db: Arc<D>,
    signing_key: SecretKey,
    my_address: Address,
}

impl<D: WalletDatabase> ChannelManager<D> {
    pub fn new(db: Arc<D>, signing_key: SecretKey) -> Self {
        let my_address = address_for_secret(&signing_key);
        Self {
            db,
            signing_key,
            my_address,
        }
    }

    pub fn my_address(&self) -> &Address {
        &self.my_address
    }

    pub fn get_channel(&self, channel_id: ChannelId) -> DbResult<Option<Channel>> {
        self.db.channel_db().get_channel(channel_id)
    }

    pub fn expect_channel(&self, channel_id: ChannelId) -> DbResult<Channel> {
        self.get_channel(channel_id)?
            .ok_or(DbError::ChannelNotFound(channel_id))
    }

    pub fn save_channel(&self, channel: Channel) -> DbResult<()> {
        self.db.channel_db().upsert_channel(channel)
    }

    /// Merges a state arriving off the wire into its channel, creating the
    /// channel row the first time an unknown channel id shows up.
    ///
    /// Signatures are re-recovered here; a signature by a non-participant
    /// or any history invariant violation fails the whole operation and
    /// leaves the row unchanged.
    pub fn add_wire_state(
        &self,
        state: State,
        signatures: &[RecoverableSig],
    ) -> DbResult<Channel> {
        let channel_id = state.channel_id();

        let mut channel = match self.get_channel(channel_id)? {
            Some(channel) => channel,
            None => {
                let my_index = state
                    .constants()
                    .participants()
                    .iter()
                    .position(|p| p == &self.my_address)
                    .ok_or_else(|| {
                        DbError::Other(format!(
                            "not a participant of channel {channel_id:?}"
                        ))
                    })?;
                debug!(?channel_id, my_index, "creating channel from first state");
                Channel::new(state.constants().clone(), my_index).map_err(DbError::State)?
            }
        };

        let mut ss = SignedState::new(state);
        for sig in signatures {
            ss.add_signature(*sig).map_err(DbError::State)?;
        }

        channel.add_signed_state(ss).map_err(DbError::State)?;
        self.save_channel(channel.clone())?;
        Ok(channel)
    }

    /// Signs a fresh state for an existing channel and persists it.
    pub fn sign_state(
        &self,
        channel_id: ChannelId,
        vars: StateVars,
    ) -> DbResult<(Channel, SignedState)> {
        let mut channel = self.expect_channel(channel_id)?;
        let ss = channel
            .sign_state(vars, &self.signing_key)
            .map_err(DbError::State)?;
        self.save_channel(channel.clone())?;
        Ok((channel, ss))
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};
    use sluice_db::stubs::StubWalletDatabase;
    use sluice_primitives::{buf::Buf32, signature};
    use sluice_state::{
        errors::StateError,
        outcome::{AllocationItem, SimpleAllocationOutcome},
        state::ChannelConstants,
    };

    use super::*;

    fn setup() -> (Vec<SecretKey>, ChannelManager<StubWalletDatabase>, ChannelConstants) {
        let mut rng = StdRng::seed_from_u64(42);
        let keys: Vec<SecretKey> = (0..2).map(|_| SecretKey::new(&mut rng)).collect();
        let participants = keys.iter().map(address_for_secret).collect();
        let constants = ChannelConstants::new(1, participants, 1, Address::zero(), 60);
        let manager = ChannelManager::new(Arc::new(StubWalletDatabase::new()), keys[0]);
        (keys, manager, constants)
    }

    fn vars(turn_num: u64) -> StateVars {
        StateVars {
            turn_num,
            is_final: false,
            app_data: vec![],
            outcome: SimpleAllocationOutcome::new(
                Address::zero(),
                vec![AllocationItem::new(Buf32::new([1; 32]), 5u64.into())],
            )
            .unwrap(),
        }
    }

    #[test]
    fn test_channel_created_on_first_wire_state() {
        let (keys, manager, constants) = setup();
        let state = State::new(constants.clone(), vars(0));
        let sig = signature::sign_hash(&state.state_hash(), &keys[1]);

        assert!(manager.get_channel(constants.channel_id()).unwrap().is_none());
        let channel = manager
            .add_wire_state(state, &[sig])
            .expect("first state should create the channel");
        assert_eq!(channel.my_index(), 0);
        assert_eq!(channel.states().len(), 1);
    }

    #[test]
    fn test_wire_state_for_foreign_channel_rejected() {
        let (keys, manager, _) = setup();
        // a channel we are not a participant of
        let mut rng = StdRng::seed_from_u64(7);
        let outsiders: Vec<SecretKey> = (0..2).map(|_| SecretKey::new(&mut rng)).collect();
        let constants = ChannelConstants::new(
            1,
            outsiders.iter().map(address_for_secret).collect(),
            1,
            Address::zero(),
            60,
        );
        let state = State::new(constants, vars(0));
        let sig = signature::sign_hash(&state.state_hash(), &keys[1]);

        assert!(manager.add_wire_state(state, &[sig]).is_err());
    }

    #[test]
    fn test_sign_state_persists() {
        let (keys, manager, constants) = setup();
        let state = State::new(constants.clone(), vars(0));
        let sig = signature::sign_hash(&state.state_hash(), &keys[1]);
        manager.add_wire_state(state, &[sig]).unwrap();

        let (channel, ss) = manager
            .sign_state(constants.channel_id(), vars(0))
            .expect("countersigning the prefund state should work");
        assert!(ss.is_signed_by(manager.my_address()));
        assert!(channel.supported().is_some(), "turn 0 is now fully signed");

        let reloaded = manager.expect_channel(constants.channel_id()).unwrap();
        assert_eq!(reloaded.states().len(), channel.states().len());
    }

    #[test]
    fn test_double_self_sign_rejected_through_manager() {
        let (keys, manager, constants) = setup();
        let state = State::new(constants.clone(), vars(0));
        let sig = signature::sign_hash(&state.state_hash(), &keys[1]);
        manager.add_wire_state(state, &[sig]).unwrap();
        manager.sign_state(constants.channel_id(), vars(0)).unwrap();

        let mut other = vars(0);
        other.app_data = vec![1];
        let err = manager
            .sign_state(constants.channel_id(), other)
            .expect_err("a second distinct self-signed turn-0 state must fail");
        assert!(matches!(
            err,
            DbError::State(StateError::MultipleSignedStates(0))
        ));
    }
}
