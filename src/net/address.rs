use std::{fmt, str::FromStr};

use arrayref::array_ref;
use blake3::hash;
use serde::{Deserialize, Serialize};

use crate::hex::HexDisplayExt;

/// Length in bytes of a node address.
pub const ADDRESS_SIZE: usize = 32;

/// An overlay node's address. It is the digest of the node's public key, so it
/// names the node independently of wherever the node can currently be dialled.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address([u8; ADDRESS_SIZE]);

impl Address {
    pub const fn from_bytes(bytes: [u8; ADDRESS_SIZE]) -> Self {
        Self(bytes)
    }

    /// Derives the address owned by the holder of `public_key`.
    pub fn derive(public_key: &[u8]) -> Self {
        Self(*hash(public_key).as_bytes())
    }

    /// A fresh address derived from a random key. Used by nodes that are not
    /// given an identity explicitly.
    pub fn random() -> Self {
        let key: [u8; 32] = rand::random();
        Self::derive(&key)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != ADDRESS_SIZE {
            return None;
        }
        Some(Self(*array_ref![bytes, 0, ADDRESS_SIZE]))
    }

    pub fn from_hex(input: &str) -> Option<Self> {
        Self::from_slice(&::hex::decode(input).ok()?)
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_SIZE] {
        &self.0
    }
}

impl AsRef<[u8]> for Address {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            write!(f, "{}", self.0.hex().short())
        } else {
            write!(f, "{}", self.0.hex())
        }
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.0.hex().short())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("address must be {ADDRESS_SIZE} hex-encoded bytes")]
pub struct AddressParseError;

impl FromStr for Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s).ok_or(AddressParseError)
    }
}
