//! Channel constants, state variables and signed states.

use std::collections::BTreeMap;

use arbitrary::Arbitrary;
use borsh::{BorshDeserialize, BorshSerialize};
use secp256k1::SecretKey;
use serde::{Deserialize, Serialize};
use sluice_primitives::{
    buf::Buf32,
    hash::compute_borsh_hash,
    signature::{self, Address, RecoverableSig},
};

use crate::{
    errors::{StateError, StateResult},
    outcome::SimpleAllocationOutcome,
};

/// Identifies a channel.
///
/// A type alias over [`Buf32`] rather than a newtype because channel ids and
/// allocation destinations are freely converted into one another when a
/// channel is funded by a ledger.
pub type ChannelId = Buf32;

/// An allocation destination: either a channel id or an address left-padded
/// to 32 bytes.
pub type Destination = Buf32;

/// Pads an external address into a destination.
pub fn destination_for_address(addr: &Address) -> Destination {
    let mut raw = [0u8; 32];
    raw[12..].copy_from_slice(addr.as_slice());
    Buf32::new(raw)
}

/// The fixed part of a channel, committed to by every state.
#[derive(
    Clone, Debug, Eq, PartialEq, Arbitrary, BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
pub struct ChannelConstants {
    chain_id: u64,
    participants: Vec<Address>,
    channel_nonce: u64,
    app_definition: Address,
    challenge_duration: u32,
}

impl ChannelConstants {
    pub fn new(
        chain_id: u64,
        participants: Vec<Address>,
        channel_nonce: u64,
        app_definition: Address,
        challenge_duration: u32,
    ) -> Self {
        Self {
            chain_id,
            participants,
            channel_nonce,
            app_definition,
            challenge_duration,
        }
    }

    /// The channel id is a hash over the constants, so it is the same for
    /// every state of the channel and for every participant.
    pub fn channel_id(&self) -> ChannelId {
        compute_borsh_hash(self)
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn participants(&self) -> &[Address] {
        &self.participants
    }

    pub fn num_participants(&self) -> usize {
        self.participants.len()
    }

    pub fn channel_nonce(&self) -> u64 {
        self.channel_nonce
    }

    pub fn challenge_duration(&self) -> u32 {
        self.challenge_duration
    }

    /// The participant expected to author the state at `turn_num`.
    pub fn mover(&self, turn_num: u64) -> &Address {
        &self.participants[(turn_num % self.participants.len() as u64) as usize]
    }

    /// Whether the participant at `index` is the one who moves next after a
    /// state at `turn_num` is supported.
    pub fn is_my_turn_after(&self, turn_num: u64, index: usize) -> bool {
        ((turn_num + 1) % self.participants.len() as u64) as usize == index
    }

    /// Turn number of the last setup (postfund) state.
    pub fn post_fund_turn(&self) -> u64 {
        2 * self.participants.len() as u64 - 1
    }

    /// Turn number of the prefund state this participant signs.
    pub fn pre_fund_turn(&self) -> u64 {
        self.participants.len() as u64 - 1
    }
}

/// The variable part of a channel state.
#[derive(
    Clone, Debug, Eq, PartialEq, Arbitrary, BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
pub struct StateVars {
    pub turn_num: u64,
    pub is_final: bool,
    pub app_data: Vec<u8>,
    pub outcome: SimpleAllocationOutcome,
}

/// A complete channel state: constants plus variables.
#[derive(
    Clone, Debug, Eq, PartialEq, Arbitrary, BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
pub struct State {
    constants: ChannelConstants,
    vars: StateVars,
}

impl State {
    pub fn new(constants: ChannelConstants, vars: StateVars) -> Self {
        Self { constants, vars }
    }

    pub fn constants(&self) -> &ChannelConstants {
        &self.constants
    }

    pub fn vars(&self) -> &StateVars {
        &self.vars
    }

    pub fn channel_id(&self) -> ChannelId {
        self.constants.channel_id()
    }

    pub fn turn_num(&self) -> u64 {
        self.vars.turn_num
    }

    pub fn is_final(&self) -> bool {
        self.vars.is_final
    }

    pub fn outcome(&self) -> &SimpleAllocationOutcome {
        &self.vars.outcome
    }

    pub fn app_data(&self) -> &[u8] {
        &self.vars.app_data
    }

    /// Whether this state is still within the prefund/postfund setup phase.
    pub fn in_setup_phase(&self) -> bool {
        self.vars.turn_num < 2 * self.constants.num_participants() as u64
    }

    /// Hash the state for signing. Covers constants and variables.
    pub fn state_hash(&self) -> Buf32 {
        compute_borsh_hash(self)
    }
}

/// A state with the signatures collected for it so far.
///
/// At most one signature per signer; the map is keyed by the recovered
/// signer address so re-adding a signature is idempotent.
#[derive(Clone, Debug, Eq, PartialEq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct SignedState {
    state: State,
    signatures: BTreeMap<Address, RecoverableSig>,
}

impl SignedState {
    pub fn new(state: State) -> Self {
        Self {
            state,
            signatures: BTreeMap::new(),
        }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn turn_num(&self) -> u64 {
        self.state.turn_num()
    }

    pub fn is_final(&self) -> bool {
        self.state.is_final()
    }

    pub fn channel_id(&self) -> ChannelId {
        self.state.channel_id()
    }

    pub fn state_hash(&self) -> Buf32 {
        self.state.state_hash()
    }

    pub fn signatures(&self) -> &BTreeMap<Address, RecoverableSig> {
        &self.signatures
    }

    pub fn signers(&self) -> impl Iterator<Item = &Address> {
        self.signatures.keys()
    }

    pub fn is_signed_by(&self, addr: &Address) -> bool {
        self.signatures.contains_key(addr)
    }

    /// Whether every channel participant has signed this state.
    pub fn is_fully_signed(&self) -> bool {
        self.state
            .constants()
            .participants()
            .iter()
            .all(|p| self.is_signed_by(p))
    }

    /// Whether the mover for this state's turn has signed it.
    pub fn is_signed_by_mover(&self) -> bool {
        self.is_signed_by(self.state.constants().mover(self.turn_num()))
    }

    /// Recovers the signer of `sig` and records it.
    ///
    /// # Errors
    ///
    /// If the recovered signer is not a channel participant.
    pub fn add_signature(&mut self, sig: RecoverableSig) -> StateResult<Address> {
        let signer = signature::recover_signer(&self.state_hash(), &sig)?;

        if !self.state.constants().participants().contains(&signer) {
            return Err(StateError::InvalidSignature(signer));
        }

        self.signatures.insert(signer, sig);
        Ok(signer)
    }

    /// Signs the state with `sk` and records the signature.
    pub fn sign(&mut self, sk: &SecretKey) -> StateResult<Address> {
        let sig = signature::sign_hash(&self.state_hash(), sk);
        self.add_signature(sig)
    }

    /// Merges the signatures of another copy of the same state into this
    /// one. The caller must have checked the state hashes match.
    pub fn merge_signatures(&mut self, other: &SignedState) {
        debug_assert_eq!(self.state_hash(), other.state_hash());
        for (signer, sig) in &other.signatures {
            self.signatures.insert(*signer, *sig);
        }
    }
}
