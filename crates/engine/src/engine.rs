//! The wallet engine: the request-driven entry points that tie the store,
//! the crank machines and the outbox together.
//!
//! Every entry point runs to completion inside the channel locks it needs
//! and returns a [`Response`] with everything the caller must forward:
//! signed states for peers, channel snapshots for the application, and
//! objective events.

use std::sync::Arc;

use secp256k1::SecretKey;
use sluice_db::traits::{ObjectiveDatabase, WalletDatabase};
use sluice_primitives::signature::{address_for_secret, Address, RecoverableSig};
use sluice_state::{
    channel::Channel,
    channel_result::ChannelResult,
    objective::{FundingStrategy, Objective, ObjectiveId, ObjectiveKind, ObjectiveStatus},
    state::{ChannelConstants, ChannelId, SignedState, State, StateVars},
};
use sluice_storage::{ChannelLocks, ChannelManager, LedgerManager};
use tracing::*;

use crate::{
    chain::ChainService,
    crank::Crank,
    errors::{EngineError, EngineResult},
    ledger::crank_ledger_channel,
    objectives::{self, CrankCtx},
    response::{Response, ResponseBuilder},
};

/// A state arriving off the wire: the bare state plus detached signatures,
/// recovered and validated on ingestion.
#[derive(Clone, Debug)]
pub struct WireState {
    pub state: State,
    pub signatures: Vec<RecoverableSig>,
}

/// An inbound message from a peer. Must carry exactly one signed state;
/// objectives piggyback on it.
#[derive(Clone, Debug, Default)]
pub struct InboundMessage {
    pub signed_states: Vec<WireState>,
    pub objectives: Vec<ObjectiveKind>,
}

/// The engine. One per wallet; shared across callers.
pub struct WalletEngine<D, C> {
    db: Arc<D>,
    channels: ChannelManager<D>,
    ledgers: LedgerManager<D>,
    chain: C,
    locks: ChannelLocks,
    my_address: Address,
}

impl<D: WalletDatabase, C: ChainService> WalletEngine<D, C> {
    pub fn new(db: Arc<D>, signing_key: SecretKey, chain: C) -> Self {
        let my_address = address_for_secret(&signing_key);
        Self {
            channels: ChannelManager::new(db.clone(), signing_key),
            ledgers: LedgerManager::new(db.clone()),
            db,
            chain,
            locks: ChannelLocks::new(),
            my_address,
        }
    }

    pub fn my_address(&self) -> &Address {
        &self.my_address
    }

    pub fn get_channel(&self, channel_id: ChannelId) -> EngineResult<Option<Channel>> {
        Ok(self.channels.get_channel(channel_id)?)
    }

    pub fn get_objective(&self, id: ObjectiveId) -> EngineResult<Option<Objective>> {
        Ok(self.db.objective_db().get_objective(id)?)
    }

    /// Proposes a new channel: persists it, signs our prefund state and
    /// creates an approved open-channel objective for it. The returned
    /// response carries the state and the objective for every peer.
    pub fn create_channel(
        &self,
        constants: ChannelConstants,
        vars: StateVars,
        funding: FundingStrategy,
        now: u64,
    ) -> EngineResult<Response> {
        let my_index = constants
            .participants()
            .iter()
            .position(|p| p == &self.my_address)
            .ok_or_else(|| {
                sluice_db::DbError::Other("not a participant of the proposed channel".into())
            })?;
        let channel_id = constants.channel_id();

        let ss = self.locks.with_channel(channel_id, || -> EngineResult<SignedState> {
            if self.channels.get_channel(channel_id)?.is_some() {
                return Err(
                    sluice_db::DbError::Other(format!("channel {channel_id} already exists"))
                        .into(),
                );
            }
            let channel = Channel::new(constants.clone(), my_index)?;
            self.channels.save_channel(channel)?;

            let vars = StateVars {
                turn_num: my_index as u64,
                is_final: false,
                ..vars
            };
            let (_, ss) = self.channels.sign_state(channel_id, vars)?;
            Ok(ss)
        })?;
        info!(?channel_id, "proposed channel");

        let objective = Objective::new(
            ObjectiveKind::OpenChannel {
                target: channel_id,
                funding,
            },
            ObjectiveStatus::Approved,
            now,
        );
        self.db.objective_db().upsert_objective(objective.clone())?;

        let mut response = ResponseBuilder::new(self.my_address);
        response.record_objective_created(objective.clone());
        response.queue_state_to_peers(constants.participants(), &ss);
        for peer in constants.participants() {
            if peer != &self.my_address {
                response.queue_objective(*peer, objective.clone());
            }
        }
        self.record_result(channel_id, &mut response)?;
        Ok(response.finish())
    }

    /// Registers a locally-initiated objective (close, challenge, defund),
    /// already approved, shares it with the target channel's peers and
    /// cranks it once.
    pub fn register_objective(&self, kind: ObjectiveKind, now: u64) -> EngineResult<Response> {
        let objective = Objective::new(kind, ObjectiveStatus::Approved, now);
        self.db.objective_db().upsert_objective(objective.clone())?;
        info!(objective_id = %objective.id(), kind = objective.kind().label(), "registered objective");

        let mut response = ResponseBuilder::new(self.my_address);
        response.record_objective_created(objective.clone());
        if let Some(channel) = self.channels.get_channel(objective.target())? {
            for peer in channel.participants() {
                if peer != &self.my_address {
                    response.queue_objective(*peer, objective.clone());
                }
            }
        }
        self.crank_objective_inner(objective, now, &mut response)?;
        Ok(response.finish())
    }

    /// Ingests one peer message: persists its signed state, stores any new
    /// objectives as pending, and cranks everything the state may have
    /// unblocked.
    pub fn push_message(&self, message: InboundMessage, now: u64) -> EngineResult<Response> {
        let count = message.signed_states.len();
        if count != 1 {
            return Err(EngineError::MalformedPayload(count));
        }

        let mut response = ResponseBuilder::new(self.my_address);

        for kind in message.objectives {
            let objective = Objective::new(kind, ObjectiveStatus::Pending, now);
            if self.db.objective_db().get_objective(objective.id())?.is_none() {
                info!(objective_id = %objective.id(), kind = objective.kind().label(), "learned objective");
                self.db.objective_db().upsert_objective(objective.clone())?;
                response.record_objective_created(objective);
            }
        }

        let mut states = message.signed_states.into_iter();
        let wire = match (states.next(), states.next()) {
            (Some(wire), None) => wire,
            _ => return Err(EngineError::MalformedPayload(count)),
        };

        let channel_id = wire.state.channel_id();
        self.locks.with_channel(channel_id, || {
            self.channels.add_wire_state(wire.state, &wire.signatures)
        })?;
        self.record_result(channel_id, &mut response)?;

        for objective in self.db.objective_db().get_objectives_for_channel(channel_id)? {
            self.crank_objective_inner(objective, now, &mut response)?;
        }

        // the state may be a ledger update this wallet is waiting on
        let active = self.ledgers.active_requests(channel_id)?;
        if !active.is_empty() {
            let signed = self.locks.with_channel(channel_id, || {
                crank_ledger_channel(&self.channels, &self.ledgers, channel_id)
            })?;
            for ss in &signed {
                response.queue_state_to_peers(ss.state().constants().participants(), ss);
            }
            self.record_result(channel_id, &mut response)?;

            for request in active {
                let target = request.channel_to_be_funded();
                for objective in self.db.objective_db().get_objectives_for_channel(target)? {
                    self.crank_objective_inner(objective, now, &mut response)?;
                }
            }
        }

        Ok(response.finish())
    }

    /// Approves a pending objective and cranks it.
    pub fn approve_objective(&self, id: ObjectiveId, now: u64) -> EngineResult<Response> {
        let mut objective = self
            .db
            .objective_db()
            .get_objective(id)?
            .ok_or(EngineError::ObjectiveNotFound(id))?;

        if objective.status() == ObjectiveStatus::Pending {
            objective.set_status(ObjectiveStatus::Approved);
            objective.touch(now);
            self.db.objective_db().upsert_objective(objective.clone())?;
            info!(objective_id = %id, kind = objective.kind().label(), "objective approved");
        }

        let mut response = ResponseBuilder::new(self.my_address);
        self.crank_objective_inner(objective, now, &mut response)?;
        Ok(response.finish())
    }

    /// Rejects a pending objective. Terminal; it will never be cranked.
    pub fn reject_objective(&self, id: ObjectiveId, now: u64) -> EngineResult<()> {
        let mut objective = self
            .db
            .objective_db()
            .get_objective(id)?
            .ok_or(EngineError::ObjectiveNotFound(id))?;
        if objective.status() == ObjectiveStatus::Pending {
            objective.set_status(ObjectiveStatus::Rejected);
            objective.touch(now);
            self.db.objective_db().upsert_objective(objective)?;
            info!(objective_id = %id, "objective rejected");
        }
        Ok(())
    }

    /// Cranks one objective, typically from a poll tick.
    pub fn crank_objective(&self, id: ObjectiveId, now: u64) -> EngineResult<Response> {
        let objective = self
            .db
            .objective_db()
            .get_objective(id)?
            .ok_or(EngineError::ObjectiveNotFound(id))?;
        let mut response = ResponseBuilder::new(self.my_address);
        self.crank_objective_inner(objective, now, &mut response)?;
        Ok(response.finish())
    }

    fn crank_objective_inner(
        &self,
        mut objective: Objective,
        now: u64,
        response: &mut ResponseBuilder,
    ) -> EngineResult<()> {
        match objective.status() {
            ObjectiveStatus::Pending => {
                debug!(objective_id = %objective.id(), "objective awaiting approval");
                return Ok(());
            }
            ObjectiveStatus::Rejected | ObjectiveStatus::Succeeded | ObjectiveStatus::Failed => {
                return Ok(());
            }
            ObjectiveStatus::Approved => {}
        }

        let target = objective.target();
        let ctx = CrankCtx {
            db: &self.db,
            channels: &self.channels,
            ledgers: &self.ledgers,
            chain: &self.chain,
            now,
        };

        // canonical lock order: application channel before its ledger
        let result = match ledger_of(objective.kind()) {
            Some(ledger_channel_id) => self
                .locks
                .with_channels(target, ledger_channel_id, || {
                    objectives::crank(&ctx, &objective)
                }),
            None => self
                .locks
                .with_channel(target, || objectives::crank(&ctx, &objective)),
        };
        let (crank, signed) = result?;

        for ss in &signed {
            response.queue_state_to_peers(ss.state().constants().participants(), ss);
            self.record_result(ss.channel_id(), response)?;
        }
        self.record_result(target, response)?;

        match crank {
            Crank::Complete => {
                info!(objective_id = %objective.id(), kind = objective.kind().label(), "objective succeeded");
                let kind = objective.kind().label();
                objective.set_status(ObjectiveStatus::Succeeded);
                objective.touch(now);
                self.db.objective_db().upsert_objective(objective)?;
                response.record_objective_succeeded(target, kind);
            }
            Crank::Failed(reason) => {
                warn!(objective_id = %objective.id(), reason, "objective failed");
                objective.set_status(ObjectiveStatus::Failed);
                objective.touch(now);
                self.db.objective_db().upsert_objective(objective)?;
            }
            Crank::Waiting(reason) => {
                debug!(objective_id = %objective.id(), %reason, "objective blocked");
                if !signed.is_empty() {
                    objective.touch(now);
                    self.db.objective_db().upsert_objective(objective)?;
                }
            }
        }

        Ok(())
    }

    fn record_result(
        &self,
        channel_id: ChannelId,
        response: &mut ResponseBuilder,
    ) -> EngineResult<()> {
        if let Some(channel) = self.channels.get_channel(channel_id)? {
            let funding = self.funding_for_channel(channel_id)?;
            response.record_channel_result(ChannelResult::from_channel(&channel, funding));
        }
        Ok(())
    }

    /// The channel's funding strategy per its open-channel objective, if
    /// one is known.
    fn funding_for_channel(&self, channel_id: ChannelId) -> EngineResult<FundingStrategy> {
        for objective in self.db.objective_db().get_objectives_for_channel(channel_id)? {
            if let ObjectiveKind::OpenChannel { funding, .. } = objective.kind() {
                return Ok(funding.clone());
            }
        }
        Ok(FundingStrategy::Unknown)
    }
}

fn ledger_of(kind: &ObjectiveKind) -> Option<ChannelId> {
    match kind {
        ObjectiveKind::OpenChannel {
            funding: FundingStrategy::Ledger(id),
            ..
        }
        | ObjectiveKind::CloseChannel {
            funding: FundingStrategy::Ledger(id),
            ..
        } => Some(*id),
        _ => None,
    }
}
