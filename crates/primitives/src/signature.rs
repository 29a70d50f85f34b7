//! ECDSA signing and signer recovery.
//!
//! Channel participants are identified by 20-byte addresses derived from
//! their secp256k1 pubkeys, so signatures are carried in recoverable form
//! and verification is "recover the signer and check it is a participant".

use alloy_primitives::keccak256;
use arbitrary::Arbitrary;
use borsh::{BorshDeserialize, BorshSerialize};
use secp256k1::{
    ecdsa::{RecoverableSignature, RecoveryId},
    Message, PublicKey, SecretKey, SECP256K1,
};
use serde::{Deserialize, Serialize};

use crate::{
    buf::{Buf20, Buf32, Buf64},
    errors::{CryptoError, CryptoResult},
};

/// A signer address.
///
/// Derived from a pubkey the usual EVM way: the low 20 bytes of the keccak
/// hash of the uncompressed key.
pub type Address = Buf20;

/// A compact ECDSA signature together with its recovery id.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Arbitrary,
    BorshSerialize,
    BorshDeserialize,
    Serialize,
    Deserialize,
)]
pub struct RecoverableSig {
    sig: Buf64,
    rec_id: u8,
}

impl RecoverableSig {
    pub fn new(sig: Buf64, rec_id: u8) -> Self {
        Self { sig, rec_id }
    }

    pub fn sig(&self) -> &Buf64 {
        &self.sig
    }

    pub fn rec_id(&self) -> u8 {
        self.rec_id
    }

    fn to_recoverable(self) -> CryptoResult<RecoverableSignature> {
        let rec_id = RecoveryId::from_i32(self.rec_id as i32)
            .map_err(|_| CryptoError::InvalidRecoveryId(self.rec_id))?;
        Ok(RecoverableSignature::from_compact(
            self.sig.as_slice(),
            rec_id,
        )?)
    }
}

/// Signs a 32-byte digest, producing a recoverable signature.
pub fn sign_hash(hash: &Buf32, sk: &SecretKey) -> RecoverableSig {
    let msg = Message::from_digest(hash.into_inner());
    let sig = SECP256K1.sign_ecdsa_recoverable(&msg, sk);
    let (rec_id, compact) = sig.serialize_compact();
    RecoverableSig::new(Buf64::new(compact), rec_id.to_i32() as u8)
}

/// Recovers the address that produced a signature over a digest.
pub fn recover_signer(hash: &Buf32, sig: &RecoverableSig) -> CryptoResult<Address> {
    let msg = Message::from_digest(hash.into_inner());
    let pubkey = SECP256K1.recover_ecdsa(&msg, &sig.to_recoverable()?)?;
    Ok(pubkey_to_address(&pubkey))
}

/// Derives the address for a pubkey.
pub fn pubkey_to_address(pubkey: &PublicKey) -> Address {
    let uncompressed = pubkey.serialize_uncompressed();
    let digest = keccak256(&uncompressed[1..]);
    let mut addr = [0u8; 20];
    addr.copy_from_slice(&digest[12..]);
    Buf20::new(addr)
}

/// Derives the address for a secret key.
pub fn address_for_secret(sk: &SecretKey) -> Address {
    pubkey_to_address(&sk.public_key(SECP256K1))
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    fn test_key(seed: u64) -> SecretKey {
        let mut rng = StdRng::seed_from_u64(seed);
        SecretKey::new(&mut rng)
    }

    #[test]
    fn test_sign_and_recover() {
        let sk = test_key(1);
        let hash = crate::hash::raw(b"some state");
        let sig = sign_hash(&hash, &sk);

        let recovered = recover_signer(&hash, &sig).expect("should recover signer");
        assert_eq!(
            recovered,
            address_for_secret(&sk),
            "recovered address should match the signing key"
        );
    }

    #[test]
    fn test_recover_wrong_hash_gives_other_address() {
        let sk = test_key(2);
        let hash = crate::hash::raw(b"state a");
        let sig = sign_hash(&hash, &sk);

        let other = crate::hash::raw(b"state b");
        let recovered = recover_signer(&other, &sig).expect("recovery itself should succeed");
        assert_ne!(
            recovered,
            address_for_secret(&sk),
            "recovering against the wrong digest must not yield the signer"
        );
    }

    #[test]
    fn test_invalid_recovery_id_rejected() {
        let sk = test_key(3);
        let hash = crate::hash::raw(b"state");
        let sig = sign_hash(&hash, &sk);
        let mangled = RecoverableSig::new(*sig.sig(), 7);

        assert!(matches!(
            recover_signer(&hash, &mangled),
            Err(CryptoError::InvalidRecoveryId(7))
        ));
    }
}
