//! The objective/protocol crank engine.
//!
//! Decides, from a channel's signed-state history and the pending ledger
//! requests, what the next action is: sign a state, fire a chain
//! transaction, propose a ledger reallocation, or report why nothing can
//! happen yet. Pure protocol decisions live here; persistence is behind
//! the store traits and on-chain submission behind [`chain::ChainService`].

pub mod chain;
pub mod crank;
pub mod engine;
pub mod errors;
pub mod ledger;
pub mod response;

pub(crate) mod objectives;

pub use chain::{ChainError, ChainResult, ChainService};
pub use crank::{Crank, WaitReason};
pub use engine::{InboundMessage, WalletEngine, WireState};
pub use errors::{EngineError, EngineResult};
pub use response::{Envelope, ObjectiveEvent, Response, ResponseBuilder};
