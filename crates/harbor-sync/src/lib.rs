//! Derivation discovery and wallet sync for Harbor Wallet
//!
//! Scans imported key material across the standard derivation schemes and
//! keeps established wallets' address and transaction caches in step with a
//! remote chain index.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cancel;
pub mod chain_index;
pub mod config;
pub mod discovery;
pub mod discovery_logger;
pub mod error;
pub mod progress;
pub mod sync;

pub use cancel::CancelToken;
pub use chain_index::{
    AddressQueryResult, Balance, ChainIndex, ChainIndexError, FixtureAddress, FixtureChainIndex,
    HistoryEntry, TransactionSource,
};
pub use config::{DiscoveryConfig, SyncConfig};
pub use discovery::DiscoveryEngine;
pub use discovery_logger::{init_discovery_logging, DiscoveryEvent, DiscoveryLogger};
pub use error::{Error, Result};
pub use progress::{DiscoveryAggregateResult, DiscoveryProgress, ScanPathResult, ScanStatus};
pub use sync::{AddressRefresh, SyncReport, WalletSynchronizer};
