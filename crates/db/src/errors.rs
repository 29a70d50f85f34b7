use sluice_state::{errors::StateError, state::ChannelId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    /// A channel row that was expected to exist is missing.
    #[error("channel {0:?} not found")]
    ChannelNotFound(ChannelId),

    /// An objective row that was expected to exist is missing.
    #[error("objective not found")]
    ObjectiveNotFound,

    /// A state-level invariant failed while mutating a stored channel.
    #[error("state: {0}")]
    State(#[from] StateError),

    /// Backend failure that the caller cannot do anything about.
    #[error("{0}")]
    Other(String),
}

pub type DbResult<T> = Result<T, DbError>;
