//! Call identifiers.
//!
//! Frames, async calls and callbacks are all named by a 32-byte blake3
//! digest. Nested ids are derived from the id of the context that issued
//! them, which is how a callback arriving from another shard finds both the
//! saved context and the call it answers.

use crate::error::TypesError;
use std::fmt;
use std::str::FromStr;

const CALLBACK_DOMAIN: &[u8] = b"callback";

/// 32-byte identifier (blake3 digest).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Hash([u8; 32]);

impl Hash {
    pub const ZERO: Self = Self([0u8; 32]);
    pub const LEN: usize = 32;

    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, TypesError> {
        let bytes: [u8; 32] = slice
            .try_into()
            .map_err(|_| TypesError::InvalidHashLength(slice.len()))?;
        Ok(Self(bytes))
    }

    pub fn compute(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Id of the `counter`-th call issued by the context named `self`:
    /// `blake3(self || counter_be)`.
    pub fn derive_call_id(&self, counter: u64) -> Self {
        self.extend(&counter.to_be_bytes())
    }

    /// Id of the callback transaction answering the call named `self`.
    pub fn callback_call_id(&self) -> Self {
        self.extend(CALLBACK_DOMAIN)
    }

    fn extend(&self, suffix: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.0);
        hasher.update(suffix);
        Self(*hasher.finalize().as_bytes())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CallId({})", self)
    }
}

impl FromStr for Hash {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.strip_prefix("0x").unwrap_or(s))?;
        Self::from_slice(&bytes)
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
