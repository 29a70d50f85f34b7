//! Persistence interfaces for the wallet.
//!
//! This crate defines the store boundary as traits only; real persistence
//! is provided by a backend crate. The in-memory implementations behind the
//! `stubs` feature exist for the engine's tests.

pub mod errors;
pub mod traits;

#[cfg(feature = "stubs")]
pub mod stubs;

pub use errors::{DbError, DbResult};
