//! Harbor Wallet network parameters and constants
//!
//! This crate provides network-specific address encodings, BIP-44 coin types
//! and address-prefix network inference for Bitcoin-style networks.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod network;

pub use network::{Network, NetworkType};

/// Error types for parameter operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid network specified
    #[error("Invalid network: {0}")]
    InvalidNetwork(String),

    /// Address prefix does not belong to any known network
    #[error("Unknown address prefix: {0}")]
    UnknownAddressPrefix(String),
}

/// Result type for parameter operations
pub type Result<T> = std::result::Result<T, Error>;
