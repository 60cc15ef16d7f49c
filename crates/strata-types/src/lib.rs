//! Strata Types - value types shared by the Strata contract host.
//!
//! This crate provides:
//! - Addresses (32-byte, Bech32m encoded, shard selected by the last byte)
//! - Hashes (32-byte, blake3 digests)
//! - Return codes and call types exchanged with contract code and other shards

pub mod address;
pub mod call_type;
pub mod error;
pub mod hash;
pub mod return_code;

#[cfg(any(feature = "serde", feature = "borsh"))]
mod serialization;

pub use address::Address;
pub use call_type::CallType;
pub use error::TypesError;
pub use hash::Hash;
pub use return_code::ReturnCode;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{Address, CallType, Hash, ReturnCode, TypesError};
}
