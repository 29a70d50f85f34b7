//! Common primitive types shared across the sluice wallet crates.
//!
//! These are lower-level building blocks (byte buffers, amounts, hashing,
//! key handling) that the channel state and protocol crates are built on.

pub mod amount;
pub mod buf;
pub mod errors;
pub mod hash;
pub mod signature;
