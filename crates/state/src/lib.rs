//! Channel state types and the pure computations over them.
//!
//! Everything in this crate is value-level: channel constants, signed
//! states, the support computation, the allocation algebra and the persisted
//! entity types for ledger requests, objectives and chain-service requests.
//! Side effects (persistence, locking, signing keys) live in the storage and
//! engine crates.

pub mod chain_request;
pub mod channel;
pub mod channel_result;
pub mod errors;
pub mod ledger;
pub mod objective;
pub mod outcome;
pub mod state;
pub mod support;
