//! Higher-level storage interfaces over the raw database traits.
//!
//! The managers here are what the engine talks to: they combine database
//! access with the validation that must happen on every mutation, and the
//! lock table serializes cranks per channel.

pub mod locks;
pub mod managers;

pub use locks::ChannelLocks;
pub use managers::{channel::ChannelManager, ledger::LedgerManager};
