//! Error types for primitive parsing and crypto operations.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    /// The recovery id byte attached to a signature is not in `0..=3`.
    #[error("invalid signature recovery id {0}")]
    InvalidRecoveryId(u8),

    /// Pubkey recovery from a signature failed.
    #[error("signature recovery: {0}")]
    Recovery(#[from] secp256k1::Error),
}

pub type CryptoResult<T> = Result<T, CryptoError>;
