//! Harbor Wallet core
//!
//! This crate implements the key-material model, address encodings and the
//! BIP-32 derivation primitive used by discovery and the address cache.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod address;
pub mod derivation;
pub mod error;
pub mod keys;

pub use address::{
    address_to_scripthash, hash160, scripthash_for_script,
    AddressType, EncodedAddress,
};
pub use derivation::{
    AddressDeriver, Bip32Deriver, Chain, DerivationRequest, DerivationScheme, DerivedAddress,
    SCAN_ORDER,
};
pub use error::{Error, ErrorCategory, Result};
pub use keys::{ExtendedKey, KeyMaterial, ParsedKey, SingleKey, DEFAULT_GAP_LIMIT};
