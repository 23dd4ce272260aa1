//! Persistent caches for Harbor Wallet
//!
//! Provides an async key-value store abstraction with in-memory and SQLite
//! backends, and the two per-wallet caches kept on top of it:
//!
//! - **Address cache**: gap-limit-bounded windows of derived addresses per
//!   wallet, address type and chain
//! - **Transaction cache**: transaction history with incremental merge driven
//!   by per-scripthash activity counts
//!
//! Records are JSON with a `schemaVersion`; a record with a different version
//! or one that fails to decode is a cache miss, never an error.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod address_cache;
pub mod cache_migration;
pub mod database;
pub mod error;
pub mod kv;
pub mod migrations;
pub mod tx_cache;
pub mod wallet_records;

pub use address_cache::{
    add_derived_addresses, create_from_addresses, get_derivation_range, mark_used,
    AddressCacheStore, CachedAddressEntry, ChainState, DerivationRange, DerivationState,
    ExtensionNeeded, WalletAddressCache, ADDRESS_CACHE_SCHEMA_VERSION, EXTENSION_THRESHOLD,
};
pub use cache_migration::{CacheMigrator, LegacyAddressEntry, MigrationReport};
pub use database::{SqliteStore, BASE_BACKOFF_MS, MAX_BACKOFF_MS, MAX_BUSY_RETRIES};
pub use error::{Error, Result};
pub use kv::{KeyValueStore, MemoryStore};
pub use tx_cache::{
    CachedTransaction, MergeSummary, ScripthashState, TransactionCacheState,
    TransactionCacheStore, TxStatus, STABLE_CONFIRMATIONS, TX_CACHE_SCHEMA_VERSION,
};
pub use wallet_records::{
    address_cache_key, delete_wallet_caches, legacy_address_cache_key, tx_cache_key,
    wallet_cache_keys, MIGRATION_MARKER_KEY,
};
