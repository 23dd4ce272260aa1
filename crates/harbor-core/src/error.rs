//! Error types for Harbor Core
//!
//! Error taxonomy for key material, address encoding and derivation.

use std::fmt;

/// Result type
pub type Result<T> = std::result::Result<T, Error>;

/// Harbor Core errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid address format
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Key derivation error
    #[error("Key derivation error: {0}")]
    KeyDerivation(String),

    /// Invalid key
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Invalid mnemonic
    #[error("Invalid mnemonic: {0}")]
    InvalidMnemonic(String),

    /// Invalid seed
    #[error("Invalid seed: {0}")]
    InvalidSeed(String),

    /// Requested address type cannot be produced from this key material
    #[error("Unsupported address type: {0}")]
    UnsupportedAddressType(String),

    /// Network mismatch between key material and configuration
    #[error("Network mismatch: {0}")]
    NetworkMismatch(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Check if error is a user-facing error (vs internal error)
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidAddress(_)
                | Error::InvalidKey(_)
                | Error::InvalidMnemonic(_)
                | Error::InvalidSeed(_)
                | Error::NetworkMismatch(_)
        )
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            Error::InvalidAddress(_) => {
                "The address is invalid. Please check and try again.".to_string()
            }
            Error::InvalidKey(_) => {
                "The key could not be read. Please check it and try again.".to_string()
            }
            Error::InvalidMnemonic(_) => {
                "The recovery phrase is invalid. Please check and try again.".to_string()
            }
            Error::InvalidSeed(_) => {
                "The wallet seed is invalid. Please check and try again.".to_string()
            }
            Error::NetworkMismatch(_) => {
                "This key belongs to a different network than the wallet.".to_string()
            }
            _ => self.to_string(),
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::InvalidAddress(_) | Error::UnsupportedAddressType(_) => ErrorCategory::Address,
            Error::KeyDerivation(_) | Error::InvalidKey(_) | Error::NetworkMismatch(_) => {
                ErrorCategory::Keys
            }
            Error::InvalidMnemonic(_) | Error::InvalidSeed(_) => ErrorCategory::Wallet,
            Error::Other(_) => ErrorCategory::Internal,
        }
    }
}

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Address-related errors
    Address,
    /// Key-related errors
    Keys,
    /// Wallet-related errors
    Wallet,
    /// Internal/system errors
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Address => write!(f, "Address"),
            ErrorCategory::Keys => write!(f, "Keys"),
            ErrorCategory::Wallet => write!(f, "Wallet"),
            ErrorCategory::Internal => write!(f, "Internal"),
        }
    }
}
