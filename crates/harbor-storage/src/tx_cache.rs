//! Transaction history cache
//!
//! History is refetched incrementally: the cache remembers how many history
//! entries each scripthash had at the last sync, and only scripthashes whose
//! count grew are queried again. `pending_txids` always mirrors the
//! unconfirmed transactions in `transactions`.

use crate::kv::KeyValueStore;
use crate::wallet_records::tx_cache_key;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Schema version of persisted transaction cache records
pub const TX_CACHE_SCHEMA_VERSION: u32 = 1;

/// Confirmations after which a transaction is no longer rechecked
pub const STABLE_CONFIRMATIONS: u32 = 6;

/// Confirmation status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Pending,
    Confirmed,
}

impl TxStatus {
    fn from_confirmed(confirmed: bool) -> Self {
        if confirmed {
            TxStatus::Confirmed
        } else {
            TxStatus::Pending
        }
    }
}

/// One wallet transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedTransaction {
    pub txid: String,
    /// Block height, `<= 0` while in the mempool
    pub height: i64,
    pub confirmed: bool,
    pub confirmations: u32,
    pub status: TxStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee_sats: Option<u64>,
    /// Net effect on the wallet balance
    #[serde(default)]
    pub net_sats: i64,
}

impl CachedTransaction {
    /// Unconfirmed transaction
    pub fn pending(txid: impl Into<String>, net_sats: i64) -> Self {
        Self {
            txid: txid.into(),
            height: 0,
            confirmed: false,
            confirmations: 0,
            status: TxStatus::Pending,
            block_time: None,
            fee_sats: None,
            net_sats,
        }
    }

    /// Transaction mined at `height`, as seen from `tip_height`
    pub fn confirmed(txid: impl Into<String>, height: i64, tip_height: u64, net_sats: i64) -> Self {
        Self {
            txid: txid.into(),
            height,
            confirmed: true,
            confirmations: confirmations_at(height, tip_height),
            status: TxStatus::Confirmed,
            block_time: None,
            fee_sats: None,
            net_sats,
        }
    }
}

/// Activity snapshot of one scripthash
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScripthashState {
    pub last_seen_tx_count: u32,
    pub last_checked_height: u64,
}

/// Transaction cache of one wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionCacheState {
    pub schema_version: u32,
    pub wallet_id: String,
    pub transactions: Vec<CachedTransaction>,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub last_known_tip_height: u64,
    pub scripthash_states: HashMap<String, ScripthashState>,
    pub pending_txids: Vec<String>,
}

impl TransactionCacheState {
    /// Look up a transaction by id
    pub fn get(&self, txid: &str) -> Option<&CachedTransaction> {
        self.transactions.iter().find(|tx| tx.txid == txid)
    }

    /// Sum of `net_sats` over confirmed transactions
    pub fn confirmed_balance(&self) -> i64 {
        self.transactions
            .iter()
            .filter(|tx| tx.confirmed)
            .map(|tx| tx.net_sats)
            .sum()
    }
}

/// What a [`merge`] changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    /// Transactions not previously cached
    pub added: usize,
    /// Cached transactions whose height or confirmation state changed
    pub reordered: usize,
    /// Confirmed transactions whose confirmation count was refreshed
    pub confirmations_refreshed: usize,
    /// Whether the transaction list was re-sorted
    pub resorted: bool,
}

/// Empty cache for a new wallet
pub fn create_empty(wallet_id: impl Into<String>) -> TransactionCacheState {
    TransactionCacheState {
        schema_version: TX_CACHE_SCHEMA_VERSION,
        wallet_id: wallet_id.into(),
        transactions: Vec::new(),
        last_sync_time: None,
        last_known_tip_height: 0,
        scripthash_states: HashMap::new(),
        pending_txids: Vec::new(),
    }
}

/// Cache seeded from a complete history fetch
pub fn create_from_full_sync(
    wallet_id: impl Into<String>,
    transactions: Vec<CachedTransaction>,
    tip_height: u64,
    counts: &HashMap<String, u32>,
) -> TransactionCacheState {
    let mut cache = create_empty(wallet_id);
    merge(&mut cache, transactions, tip_height, counts);
    cache
}

/// Scripthashes whose history count grew since they were last recorded,
/// sorted
pub fn get_changed_scripthashes(
    cache: &TransactionCacheState,
    current_counts: &HashMap<String, u32>,
) -> Vec<String> {
    let mut changed: Vec<String> = current_counts
        .iter()
        .filter(|(scripthash, count)| match cache.scripthash_states.get(*scripthash) {
            Some(state) => **count > state.last_seen_tx_count,
            None => true,
        })
        .map(|(scripthash, _)| scripthash.clone())
        .collect();
    changed.sort();
    changed
}

/// Txids not yet cached, in input order without duplicates
pub fn get_new_txids(cache: &TransactionCacheState, all_txids: &[String]) -> Vec<String> {
    let known: HashSet<&str> = cache.transactions.iter().map(|tx| tx.txid.as_str()).collect();
    let mut seen = HashSet::new();
    all_txids
        .iter()
        .filter(|txid| !known.contains(txid.as_str()) && seen.insert(txid.as_str()))
        .cloned()
        .collect()
}

/// Merge freshly fetched transactions into the cache
///
/// Incoming transactions replace cached ones with the same txid. Merging the
/// same input twice leaves the cache unchanged apart from `last_sync_time`.
pub fn merge(
    cache: &mut TransactionCacheState,
    new_transactions: Vec<CachedTransaction>,
    tip_height: u64,
    updated_counts: &HashMap<String, u32>,
) -> MergeSummary {
    let mut summary = MergeSummary::default();
    let mut positions: HashMap<String, usize> = cache
        .transactions
        .iter()
        .enumerate()
        .map(|(position, tx)| (tx.txid.clone(), position))
        .collect();

    for mut tx in new_transactions {
        tx.status = TxStatus::from_confirmed(tx.confirmed);
        match positions.get(&tx.txid) {
            Some(&position) => {
                let existing = &mut cache.transactions[position];
                if existing.height != tx.height || existing.confirmed != tx.confirmed {
                    summary.reordered += 1;
                }
                *existing = tx;
            }
            None => {
                positions.insert(tx.txid.clone(), cache.transactions.len());
                cache.transactions.push(tx);
                summary.added += 1;
            }
        }
    }

    for tx in cache.transactions.iter_mut() {
        if tx.confirmed && tx.height > 0 {
            let confirmations = confirmations_at(tx.height, tip_height);
            if tx.confirmations != confirmations {
                tx.confirmations = confirmations;
                summary.confirmations_refreshed += 1;
            }
        }
    }

    if summary.added > 0 || summary.reordered > 0 {
        cache
            .transactions
            .sort_by_key(|tx| (tx.confirmed, Reverse(tx.height)));
        summary.resorted = true;
    }

    recompute_pending(cache);

    for (scripthash, count) in updated_counts {
        cache.scripthash_states.insert(
            scripthash.clone(),
            ScripthashState {
                last_seen_tx_count: *count,
                last_checked_height: tip_height,
            },
        );
    }
    cache.last_known_tip_height = tip_height;
    cache.last_sync_time = Some(Utc::now());

    tracing::debug!(
        wallet_id = %cache.wallet_id,
        added = summary.added,
        reordered = summary.reordered,
        refreshed = summary.confirmations_refreshed,
        pending = cache.pending_txids.len(),
        tip_height,
        "Merged transactions"
    );
    summary
}

/// Mark one cached transaction as mined at `height`
///
/// Returns `false` if the txid is not cached.
pub fn confirm_transaction(
    cache: &mut TransactionCacheState,
    txid: &str,
    height: i64,
    tip_height: u64,
) -> bool {
    let Some(tx) = cache.transactions.iter_mut().find(|tx| tx.txid == txid) else {
        return false;
    };

    tx.confirmed = true;
    tx.height = height;
    tx.confirmations = confirmations_at(height, tip_height);
    tx.status = TxStatus::Confirmed;
    cache.pending_txids.retain(|pending| pending != txid);
    true
}

/// Confirmed deeply enough to stop rechecking
pub fn is_stable(tx: &CachedTransaction) -> bool {
    is_stable_at(tx, STABLE_CONFIRMATIONS)
}

/// [`is_stable`] with an explicit confirmation threshold
pub fn is_stable_at(tx: &CachedTransaction, min_confirmations: u32) -> bool {
    tx.confirmed && tx.confirmations >= min_confirmations
}

/// Txids that still need rechecking
pub fn get_unstable_txids(cache: &TransactionCacheState) -> Vec<String> {
    unstable_txids_at(cache, STABLE_CONFIRMATIONS)
}

/// [`get_unstable_txids`] with an explicit confirmation threshold
pub fn unstable_txids_at(cache: &TransactionCacheState, min_confirmations: u32) -> Vec<String> {
    cache
        .transactions
        .iter()
        .filter(|tx| !is_stable_at(tx, min_confirmations))
        .map(|tx| tx.txid.clone())
        .collect()
}

fn confirmations_at(height: i64, tip_height: u64) -> u32 {
    if height <= 0 {
        return 0;
    }
    let tip = i64::try_from(tip_height).unwrap_or(i64::MAX);
    u32::try_from((tip - height + 1).max(0)).unwrap_or(u32::MAX)
}

fn recompute_pending(cache: &mut TransactionCacheState) {
    cache.pending_txids = cache
        .transactions
        .iter()
        .filter(|tx| !tx.confirmed)
        .map(|tx| tx.txid.clone())
        .collect();
}

/// Loads and saves transaction caches on a [`KeyValueStore`]
#[derive(Clone)]
pub struct TransactionCacheStore {
    store: Arc<dyn KeyValueStore>,
}

impl TransactionCacheStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Load a cache; missing, stale-version or undecodable records are `None`
    pub async fn load(&self, wallet_id: &str) -> Option<TransactionCacheState> {
        let raw = match self.store.get(&tx_cache_key(wallet_id)).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(wallet_id = %wallet_id, error = %e, "Transaction cache read failed");
                return None;
            }
        };

        match serde_json::from_str::<TransactionCacheState>(&raw) {
            Ok(cache) if cache.schema_version == TX_CACHE_SCHEMA_VERSION && cache.wallet_id == wallet_id => {
                Some(cache)
            }
            Ok(cache) => {
                tracing::info!(
                    wallet_id = %wallet_id,
                    found = cache.schema_version,
                    "Discarding transaction cache with unexpected schema version"
                );
                None
            }
            Err(e) => {
                tracing::warn!(wallet_id = %wallet_id, error = %e, "Corrupt transaction cache record");
                None
            }
        }
    }

    /// Load a cache or start an empty one
    pub async fn load_or_empty(&self, wallet_id: &str) -> TransactionCacheState {
        match self.load(wallet_id).await {
            Some(cache) => cache,
            None => create_empty(wallet_id),
        }
    }

    /// Persist a cache, logging and swallowing write failures
    pub async fn save(&self, cache: &TransactionCacheState) -> bool {
        match self.try_save(cache).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(wallet_id = %cache.wallet_id, error = %e, "Transaction cache write failed");
                false
            }
        }
    }

    /// Persist a cache, propagating failures
    pub async fn try_save(&self, cache: &TransactionCacheState) -> Result<()> {
        self.store
            .set(&tx_cache_key(&cache.wallet_id), serde_json::to_string(cache)?)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStore;

    fn counts(entries: &[(&str, u32)]) -> HashMap<String, u32> {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_changed_scripthashes() {
        let cache = create_from_full_sync("w1", vec![], 100, &counts(&[("a", 2), ("b", 1)]));
        let changed =
            get_changed_scripthashes(&cache, &counts(&[("a", 2), ("b", 3), ("c", 0)]));
        assert_eq!(changed, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_new_txids_dedup() {
        let cache = create_from_full_sync(
            "w1",
            vec![CachedTransaction::confirmed("t1", 90, 100, 5)],
            100,
            &HashMap::new(),
        );
        let ids: Vec<String> = ["t2", "t1", "t3", "t2"].iter().map(|s| s.to_string()).collect();
        assert_eq!(get_new_txids(&cache, &ids), vec!["t2".to_string(), "t3".to_string()]);
    }

    #[test]
    fn test_merge_orders_pending_first() {
        let mut cache = create_empty("w1");
        let summary = merge(
            &mut cache,
            vec![
                CachedTransaction::confirmed("old", 10, 100, 1),
                CachedTransaction::pending("mempool", 2),
                CachedTransaction::confirmed("new", 95, 100, 3),
            ],
            100,
            &counts(&[("a", 3)]),
        );

        assert_eq!(summary.added, 3);
        assert!(summary.resorted);
        let order: Vec<_> = cache.transactions.iter().map(|tx| tx.txid.as_str()).collect();
        assert_eq!(order, vec!["mempool", "new", "old"]);
        assert_eq!(cache.pending_txids, vec!["mempool".to_string()]);
        assert_eq!(cache.get("new").unwrap().confirmations, 6);
        assert_eq!(cache.scripthash_states["a"].last_checked_height, 100);
        assert_eq!(cache.last_known_tip_height, 100);
        assert!(cache.last_sync_time.is_some());
    }

    #[test]
    fn test_merge_is_idempotent() {
        let txs = vec![
            CachedTransaction::pending("p", -5),
            CachedTransaction::confirmed("c", 50, 60, 7),
        ];
        let mut cache = create_empty("w1");
        merge(&mut cache, txs.clone(), 60, &counts(&[("a", 2)]));
        let first = cache.clone();

        let summary = merge(&mut cache, txs, 60, &counts(&[("a", 2)]));

        assert_eq!(summary.added, 0);
        assert!(!summary.resorted);
        assert_eq!(cache.transactions, first.transactions);
        assert_eq!(cache.pending_txids, first.pending_txids);
        assert_eq!(cache.scripthash_states, first.scripthash_states);
    }

    #[test]
    fn test_tip_advance_refreshes_without_resorting() {
        let mut cache = create_empty("w1");
        merge(
            &mut cache,
            vec![CachedTransaction::confirmed("c", 50, 50, 1)],
            50,
            &HashMap::new(),
        );

        let summary = merge(&mut cache, vec![], 55, &HashMap::new());

        assert_eq!(summary.confirmations_refreshed, 1);
        assert!(!summary.resorted);
        assert_eq!(cache.get("c").unwrap().confirmations, 6);
    }

    #[test]
    fn test_merge_replaces_pending_with_confirmed() {
        let mut cache = create_empty("w1");
        merge(&mut cache, vec![CachedTransaction::pending("t", 4)], 10, &HashMap::new());

        let summary = merge(
            &mut cache,
            vec![CachedTransaction::confirmed("t", 11, 11, 4)],
            11,
            &HashMap::new(),
        );

        assert_eq!(summary.reordered, 1);
        assert!(summary.resorted);
        assert!(cache.pending_txids.is_empty());
        assert_eq!(cache.transactions.len(), 1);
        assert_eq!(cache.get("t").unwrap().status, TxStatus::Confirmed);
    }

    #[test]
    fn test_confirm_transaction() {
        let mut cache = create_empty("w1");
        merge(&mut cache, vec![CachedTransaction::pending("t", 1)], 10, &HashMap::new());

        assert!(!confirm_transaction(&mut cache, "unknown", 11, 11));
        assert!(confirm_transaction(&mut cache, "t", 11, 13));

        let tx = cache.get("t").unwrap();
        assert!(tx.confirmed);
        assert_eq!(tx.confirmations, 3);
        assert_eq!(tx.status, TxStatus::Confirmed);
        assert!(cache.pending_txids.is_empty());
    }

    #[test]
    fn test_stability() {
        let tip = 100;
        assert!(!is_stable(&CachedTransaction::pending("p", 0)));
        assert!(!is_stable(&CachedTransaction::confirmed("five", 96, tip, 0)));
        assert!(is_stable(&CachedTransaction::confirmed("six", 95, tip, 0)));

        let cache = create_from_full_sync(
            "w1",
            vec![
                CachedTransaction::pending("p", 0),
                CachedTransaction::confirmed("five", 96, tip, 0),
                CachedTransaction::confirmed("six", 95, tip, 0),
            ],
            tip,
            &HashMap::new(),
        );
        let mut unstable = get_unstable_txids(&cache);
        unstable.sort();
        assert_eq!(unstable, vec!["five".to_string(), "p".to_string()]);
        assert_eq!(unstable_txids_at(&cache, 1), vec!["p".to_string()]);
    }

    #[tokio::test]
    async fn test_store_roundtrip() {
        let kv = Arc::new(MemoryStore::new());
        let store = TransactionCacheStore::new(kv.clone());
        assert_eq!(store.load("w1").await, None);

        let cache = create_from_full_sync(
            "w1",
            vec![CachedTransaction::confirmed("c", 5, 10, 100)],
            10,
            &counts(&[("a", 1)]),
        );
        assert!(store.save(&cache).await);
        assert_eq!(store.load("w1").await, Some(cache));

        kv.set(&tx_cache_key("w1"), r#"{"schemaVersion":0}"#.to_string())
            .await
            .unwrap();
        assert_eq!(store.load("w1").await, None);
        assert_eq!(store.load_or_empty("w1").await.transactions.len(), 0);
    }
}
