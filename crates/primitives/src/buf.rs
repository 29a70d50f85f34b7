//! Fixed-size byte buffers used for hashes, addresses and signatures.

use std::{fmt, str};

use arbitrary::Arbitrary;
use borsh::{BorshDeserialize, BorshSerialize};

macro_rules! impl_buf {
    ($name:ident, $len:expr) => {
        impl $name {
            pub const LEN: usize = $len;

            pub fn new(data: [u8; $len]) -> Self {
                Self(data)
            }

            pub fn zero() -> Self {
                Self([0; $len])
            }

            pub fn is_zero(&self) -> bool {
                self.0.iter().all(|b| *b == 0)
            }

            pub fn as_slice(&self) -> &[u8] {
                &self.0
            }

            pub fn into_inner(self) -> [u8; $len] {
                self.0
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl From<[u8; $len]> for $name {
            fn from(data: [u8; $len]) -> Self {
                Self(data)
            }
        }

        impl<'a> From<&'a [u8; $len]> for $name {
            fn from(data: &'a [u8; $len]) -> Self {
                Self(*data)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::zero()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let mut buf = [0; $len * 2];
                hex::encode_to_slice(self.0, &mut buf).expect("buf: enc hex");
                f.write_str(unsafe { str::from_utf8_unchecked(&buf) })
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Debug::fmt(self, f)
            }
        }

        impl BorshSerialize for $name {
            fn serialize<W: std::io::Write>(&self, writer: &mut W) -> std::io::Result<()> {
                writer.write_all(&self.0)
            }
        }

        impl BorshDeserialize for $name {
            fn deserialize_reader<R: std::io::Read>(reader: &mut R) -> std::io::Result<Self> {
                let mut array = [0u8; $len];
                reader.read_exact(&mut array)?;
                Ok(Self(array))
            }
        }

        impl<'a> Arbitrary<'a> for $name {
            fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
                let mut array = [0u8; $len];
                u.fill_buffer(&mut array)?;
                Ok(Self(array))
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&hex::encode(self.0))
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = <String as serde::Deserialize>::deserialize(deserializer)?;
                let s = s.strip_prefix("0x").unwrap_or(&s);
                let mut array = [0u8; $len];
                hex::decode_to_slice(s, &mut array).map_err(serde::de::Error::custom)?;
                Ok(Self(array))
            }
        }
    };
}

/// 20-byte buf, used for signer addresses.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Buf20([u8; 20]);
impl_buf!(Buf20, 20);

/// 32-byte buf, used for hashes, channel ids and allocation destinations.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Buf32([u8; 32]);
impl_buf!(Buf32, 32);

/// 64-byte buf, used for the compact part of ECDSA signatures.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Buf64([u8; 64]);
impl_buf!(Buf64, 64);
