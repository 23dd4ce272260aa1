//! Chain index interfaces
//!
//! [`ChainIndex`] answers balance and history for a window of addresses in
//! one round trip; [`TransactionSource`] serves the scripthash-level queries
//! the transaction cache needs. Transport, retries and TLS live behind these
//! traits.

use async_trait::async_trait;
use harbor_core::address_to_scripthash;
use harbor_storage::CachedTransaction;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Chain index failure, reported verbatim in scan results
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ChainIndexError {
    /// Human readable reason
    pub message: String,
}

impl ChainIndexError {
    /// Create from any message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Balance of a set of addresses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    /// Confirmed plus unconfirmed satoshis
    pub total: u64,
}

/// One history entry of an address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    /// Transaction id
    pub tx_hash: String,
    /// Block height, `<= 0` for mempool
    pub height: i64,
}

/// Answer to a window query
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressQueryResult {
    /// Total over every queried address
    pub balance: Balance,
    /// History per address; absent or empty means unused
    #[serde(default)]
    pub history: HashMap<String, Vec<HistoryEntry>>,
}

impl AddressQueryResult {
    /// Whether `address` has at least one history entry
    pub fn is_used(&self, address: &str) -> bool {
        self.history
            .get(address)
            .is_some_and(|entries| !entries.is_empty())
    }

    /// Addresses with at least one history entry
    pub fn used_addresses(&self) -> HashSet<String> {
        self.history
            .iter()
            .filter(|(_, entries)| !entries.is_empty())
            .map(|(address, _)| address.clone())
            .collect()
    }
}

/// Balance and history lookups for address windows
#[async_trait]
pub trait ChainIndex: Send + Sync {
    /// Query a whole window of addresses at once
    async fn query(&self, addresses: &[String]) -> Result<AddressQueryResult, ChainIndexError>;
}

/// Scripthash-level lookups for incremental history sync
#[async_trait]
pub trait TransactionSource: Send + Sync {
    /// Current chain tip
    async fn tip_height(&self) -> Result<u64, ChainIndexError>;

    /// History length per scripthash
    async fn history_counts(
        &self,
        scripthashes: &[String],
    ) -> Result<HashMap<String, u32>, ChainIndexError>;

    /// Full history per scripthash
    async fn history(
        &self,
        scripthashes: &[String],
    ) -> Result<HashMap<String, Vec<HistoryEntry>>, ChainIndexError>;

    /// Transaction details as seen by this wallet
    async fn transactions(&self, txids: &[String])
        -> Result<Vec<CachedTransaction>, ChainIndexError>;
}

/// Address activity in a [`FixtureChainIndex`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureAddress {
    /// Balance held by the address
    #[serde(default)]
    pub balance_sats: u64,
    /// History of the address
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

/// Chain index served from a static snapshot
///
/// Loaded from JSON by the discovery harness and used by tests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureChainIndex {
    /// Chain tip reported to the transaction cache
    #[serde(default)]
    pub tip_height: u64,
    /// Activity keyed by address
    #[serde(default)]
    pub addresses: HashMap<String, FixtureAddress>,
    /// Transactions served by [`TransactionSource::transactions`]
    #[serde(default)]
    pub transactions: Vec<CachedTransaction>,
    #[serde(skip)]
    by_scripthash: HashMap<String, String>,
}

impl FixtureChainIndex {
    /// Empty snapshot at `tip_height`
    pub fn new(tip_height: u64) -> Self {
        Self {
            tip_height,
            ..Self::default()
        }
    }

    /// Parse a JSON snapshot
    pub fn from_json(json: &str) -> Result<Self, ChainIndexError> {
        let mut fixture: Self = serde_json::from_str(json)
            .map_err(|e| ChainIndexError::new(format!("invalid fixture: {e}")))?;
        fixture.reindex();
        Ok(fixture)
    }

    /// Record activity for an address
    pub fn with_address(
        mut self,
        address: impl Into<String>,
        balance_sats: u64,
        history: Vec<HistoryEntry>,
    ) -> Self {
        self.addresses.insert(
            address.into(),
            FixtureAddress {
                balance_sats,
                history,
            },
        );
        self.reindex();
        self
    }

    /// Add a transaction served by txid
    pub fn with_transaction(mut self, tx: CachedTransaction) -> Self {
        self.transactions.push(tx);
        self
    }

    fn reindex(&mut self) {
        self.by_scripthash = self
            .addresses
            .keys()
            .filter_map(|address| {
                address_to_scripthash(address)
                    .ok()
                    .map(|scripthash| (scripthash, address.clone()))
            })
            .collect();
    }

    fn history_for_scripthash(&self, scripthash: &str) -> &[HistoryEntry] {
        self.by_scripthash
            .get(scripthash)
            .and_then(|address| self.addresses.get(address))
            .map(|entry| entry.history.as_slice())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ChainIndex for FixtureChainIndex {
    async fn query(&self, addresses: &[String]) -> Result<AddressQueryResult, ChainIndexError> {
        let mut result = AddressQueryResult::default();
        for address in addresses {
            if let Some(entry) = self.addresses.get(address) {
                result.balance.total += entry.balance_sats;
                result.history.insert(address.clone(), entry.history.clone());
            }
        }
        Ok(result)
    }
}

#[async_trait]
impl TransactionSource for FixtureChainIndex {
    async fn tip_height(&self) -> Result<u64, ChainIndexError> {
        Ok(self.tip_height)
    }

    async fn history_counts(
        &self,
        scripthashes: &[String],
    ) -> Result<HashMap<String, u32>, ChainIndexError> {
        Ok(scripthashes
            .iter()
            .map(|scripthash| {
                let count = self.history_for_scripthash(scripthash).len();
                (scripthash.clone(), u32::try_from(count).unwrap_or(u32::MAX))
            })
            .collect())
    }

    async fn history(
        &self,
        scripthashes: &[String],
    ) -> Result<HashMap<String, Vec<HistoryEntry>>, ChainIndexError> {
        Ok(scripthashes
            .iter()
            .map(|scripthash| {
                (
                    scripthash.clone(),
                    self.history_for_scripthash(scripthash).to_vec(),
                )
            })
            .collect())
    }

    async fn transactions(
        &self,
        txids: &[String],
    ) -> Result<Vec<CachedTransaction>, ChainIndexError> {
        let wanted: HashSet<&str> = txids.iter().map(String::as_str).collect();
        Ok(self
            .transactions
            .iter()
            .filter(|tx| wanted.contains(tx.txid.as_str()))
            .cloned()
            .collect())
    }
}
