//! Exact-integer amounts used in allocations.

use std::fmt;

use alloy_primitives::U256;
use arbitrary::Arbitrary;
use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

/// A non-negative 256-bit amount.
///
/// All arithmetic used by the allocation algebra goes through the checked
/// methods here; overflow or underflow is surfaced to the caller instead of
/// wrapping.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Amount(U256);

impl Amount {
    pub const ZERO: Amount = Amount(U256::ZERO);

    pub fn new(value: U256) -> Self {
        Self(value)
    }

    pub fn inner(&self) -> U256 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }

    /// Sums an iterator of amounts, returning `None` on overflow.
    pub fn checked_sum(amounts: impl IntoIterator<Item = Amount>) -> Option<Amount> {
        amounts
            .into_iter()
            .try_fold(Amount::ZERO, |acc, a| acc.checked_add(a))
    }
}

impl From<u64> for Amount {
    fn from(value: u64) -> Self {
        Self(U256::from(value))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl BorshSerialize for Amount {
    fn serialize<W: std::io::Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(&self.0.to_le_bytes::<32>())
    }
}

impl BorshDeserialize for Amount {
    fn deserialize_reader<R: std::io::Read>(reader: &mut R) -> std::io::Result<Self> {
        let mut array = [0u8; 32];
        reader.read_exact(&mut array)?;
        Ok(Self(U256::from_le_bytes(array)))
    }
}

impl<'a> Arbitrary<'a> for Amount {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        let mut array = [0u8; 32];
        u.fill_buffer(&mut array)?;
        Ok(Self(U256::from_le_bytes(array)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checked_sub_underflow() {
        let a = Amount::from(3);
        let b = Amount::from(5);
        assert_eq!(a.checked_sub(b), None, "underflow must be reported");
        assert_eq!(b.checked_sub(a), Some(Amount::from(2)));
    }

    #[test]
    fn test_checked_add_overflow() {
        let max = Amount::new(U256::MAX);
        assert_eq!(max.checked_add(Amount::from(1)), None);
        assert_eq!(max.checked_add(Amount::ZERO), Some(max));
    }

    #[test]
    fn test_checked_sum() {
        let amounts = [1u64, 2, 3, 4].map(Amount::from);
        assert_eq!(Amount::checked_sum(amounts), Some(Amount::from(10)));

        let overflowing = [Amount::new(U256::MAX), Amount::from(1)];
        assert_eq!(Amount::checked_sum(overflowing), None);
    }

    #[test]
    fn test_borsh_roundtrip() {
        let a = Amount::from(u64::MAX);
        let enc = borsh::to_vec(&a).expect("should serialize");
        assert_eq!(enc.len(), 32);
        let dec: Amount = borsh::from_slice(&enc).expect("should deserialize");
        assert_eq!(a, dec);
    }
}
