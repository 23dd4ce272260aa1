//! Steady-state wallet sync
//!
//! Keeps an established wallet's address and transaction caches current:
//! extend each chain's gap window and mark newly used addresses, then
//! refetch history only for scripthashes whose activity count grew.

use crate::cancel::CancelToken;
use crate::chain_index::{ChainIndex, TransactionSource};
use crate::config::SyncConfig;
use crate::discovery_logger::duration_ms;
use crate::{Error, Result};
use harbor_core::{AddressDeriver, AddressType, Chain, DerivationRequest, ParsedKey};
use harbor_params::NetworkType;
use harbor_storage::address_cache::{
    add_derived_addresses, get_derivation_range, mark_used, AddressCacheStore, CachedAddressEntry,
    WalletAddressCache,
};
use harbor_storage::tx_cache::{self, MergeSummary, TransactionCacheState, TransactionCacheStore};
use harbor_storage::KeyValueStore;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

/// Outcome of one address refresh
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddressRefresh {
    /// Addresses appended to the cache
    pub derived: usize,
    /// Addresses newly marked used
    pub newly_used: usize,
    /// Derive-and-query rounds run
    pub rounds: u32,
}

/// Outcome of a full wallet sync
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Per address type refresh results
    pub addresses: Vec<(AddressType, AddressRefresh)>,
    /// Scripthashes whose history was refetched
    pub changed_scripthashes: usize,
    /// Transactions fetched from the source
    pub fetched_transactions: usize,
    /// Effect of the merge
    pub merge: MergeSummary,
    /// Tip height used for confirmations
    pub tip_height: u64,
    /// Net value of confirmed transactions after the merge
    pub confirmed_balance_sats: i64,
}

/// Wallet synchronizer
pub struct WalletSynchronizer {
    config: SyncConfig,
    deriver: Arc<dyn AddressDeriver>,
    chain_index: Arc<dyn ChainIndex>,
    source: Arc<dyn TransactionSource>,
    address_store: AddressCacheStore,
    tx_store: TransactionCacheStore,
}

impl WalletSynchronizer {
    /// Create a synchronizer persisting caches in `store`
    pub fn new(
        config: SyncConfig,
        deriver: Arc<dyn AddressDeriver>,
        chain_index: Arc<dyn ChainIndex>,
        source: Arc<dyn TransactionSource>,
        store: Arc<dyn KeyValueStore>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            deriver,
            chain_index,
            source,
            address_store: AddressCacheStore::new(Arc::clone(&store)),
            tx_store: TransactionCacheStore::new(store),
        })
    }

    /// Active configuration
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Sync one wallet, loading and saving its caches
    pub async fn sync_wallet(
        &self,
        wallet_id: &str,
        network: NetworkType,
        key: &ParsedKey,
        address_types: &[AddressType],
        cancel: &CancelToken,
    ) -> Result<SyncReport> {
        let started = Instant::now();
        let mut report = SyncReport::default();
        let mut caches = Vec::with_capacity(address_types.len());

        for &address_type in address_types {
            let mut cache = match self.address_store.load(wallet_id, address_type).await {
                Some(cache) => cache,
                None => {
                    tracing::info!(
                        wallet_id = %wallet_id,
                        address_type = %address_type,
                        "No usable address cache, rebuilding"
                    );
                    WalletAddressCache::new(wallet_id, network, address_type)
                }
            };

            let refresh = self.refresh_addresses(key, &mut cache, cancel).await?;
            self.address_store.save(&cache).await;
            report.addresses.push((address_type, refresh));
            caches.push(cache);
        }

        let mut tx_cache = self.tx_store.load_or_empty(wallet_id).await;
        let (changed, fetched, merge) = self
            .refresh_transactions(&caches, &mut tx_cache, cancel)
            .await?;
        self.tx_store.save(&tx_cache).await;

        report.changed_scripthashes = changed;
        report.fetched_transactions = fetched;
        report.merge = merge;
        report.tip_height = tx_cache.last_known_tip_height;
        report.confirmed_balance_sats = tx_cache.confirmed_balance();

        tracing::info!(
            wallet_id = %wallet_id,
            changed_scripthashes = changed,
            new_transactions = merge.added,
            pending = tx_cache.pending_txids.len(),
            duration_ms = duration_ms(started.elapsed()),
            "Wallet sync complete"
        );
        Ok(report)
    }

    /// Extend the gap window of both chains and mark used addresses
    ///
    /// Repeats while a chain still has a range to derive, up to
    /// `max_refresh_rounds`. A chain whose derivation yields nothing new
    /// (single keys, chain-level keys on the change chain) is not retried.
    pub async fn refresh_addresses(
        &self,
        key: &ParsedKey,
        cache: &mut WalletAddressCache,
        cancel: &CancelToken,
    ) -> Result<AddressRefresh> {
        let mut refresh = AddressRefresh::default();
        let mut exhausted: HashSet<Chain> = HashSet::new();
        let gap_limit = self.config.gap_limit;

        while refresh.rounds < self.config.max_refresh_rounds {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            refresh.rounds += 1;

            for chain in Chain::BOTH {
                if exhausted.contains(&chain) {
                    continue;
                }
                let Some(range) = get_derivation_range(cache, chain, gap_limit) else {
                    continue;
                };

                let request = DerivationRequest::chain_range(
                    cache.address_type,
                    chain,
                    range.start_index,
                    range.end_index,
                );
                let entries = self
                    .deriver
                    .derive(key, &request)?
                    .iter()
                    .map(CachedAddressEntry::from_derived)
                    .collect::<harbor_storage::Result<Vec<_>>>()?;
                let added = add_derived_addresses(cache, chain, entries);
                if added == 0 {
                    exhausted.insert(chain);
                }
                refresh.derived += added;
            }

            let unused: Vec<String> = Chain::BOTH
                .into_iter()
                .flat_map(|chain| cache.unused_addresses(chain))
                .map(|entry| entry.address.clone())
                .collect();

            let mut used = HashSet::new();
            for batch in unused.chunks(self.config.query_batch_size) {
                let answer = self.chain_index.query(batch).await?;
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                used.extend(answer.used_addresses());
            }

            let before = cache.used_addresses().len();
            let needed = mark_used(cache, &used);
            refresh.newly_used += cache.used_addresses().len() - before;
            if needed.any() {
                tracing::debug!(
                    wallet_id = %cache.wallet_id,
                    address_type = %cache.address_type,
                    chains = ?needed.chains(),
                    "Address buffer low, extending"
                );
            }

            let more = Chain::BOTH.into_iter().any(|chain| {
                !exhausted.contains(&chain) && get_derivation_range(cache, chain, gap_limit).is_some()
            });
            if !more {
                break;
            }
        }

        tracing::debug!(
            wallet_id = %cache.wallet_id,
            address_type = %cache.address_type,
            derived = refresh.derived,
            newly_used = refresh.newly_used,
            rounds = refresh.rounds,
            "Address refresh finished"
        );
        Ok(refresh)
    }

    /// Refetch changed histories and merge new or unstable transactions
    ///
    /// Returns the number of changed scripthashes, the number of fetched
    /// transactions and the merge summary.
    pub async fn refresh_transactions(
        &self,
        caches: &[WalletAddressCache],
        tx_cache: &mut TransactionCacheState,
        cancel: &CancelToken,
    ) -> Result<(usize, usize, MergeSummary)> {
        let tip_height = self.source.tip_height().await?;

        let mut seen = HashSet::new();
        let scripthashes: Vec<String> = caches
            .iter()
            .flat_map(WalletAddressCache::scripthashes)
            .filter(|scripthash| seen.insert(scripthash.clone()))
            .collect();

        let mut counts = HashMap::with_capacity(scripthashes.len());
        for batch in scripthashes.chunks(self.config.query_batch_size) {
            counts.extend(self.source.history_counts(batch).await?);
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let changed = tx_cache::get_changed_scripthashes(tx_cache, &counts);
        let mut history_txids = Vec::new();
        for batch in changed.chunks(self.config.query_batch_size) {
            for entries in self.source.history(batch).await?.into_values() {
                history_txids.extend(entries.into_iter().map(|entry| entry.tx_hash));
            }
        }

        let mut worklist = tx_cache::get_new_txids(tx_cache, &history_txids);
        let mut queued: HashSet<String> = worklist.iter().cloned().collect();
        for txid in tx_cache::unstable_txids_at(tx_cache, self.config.stability_confirmations) {
            if queued.insert(txid.clone()) {
                worklist.push(txid);
            }
        }

        let mut fetched = Vec::new();
        for batch in worklist.chunks(self.config.query_batch_size) {
            fetched.extend(self.source.transactions(batch).await?);
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let fetched_count = fetched.len();
        let summary = tx_cache::merge(tx_cache, fetched, tip_height, &counts);
        Ok((changed.len(), fetched_count, summary))
    }
}
