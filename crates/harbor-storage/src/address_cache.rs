//! Address derivation cache
//!
//! One record per wallet and address type, each holding a receiving and a
//! change chain. A chain keeps every derived address plus two cursors:
//! `last_used_index` (highest index with on-chain history) and
//! `last_derived_index` (highest index derived so far), both `-1` when empty.
//! The cache keeps `last_derived_index >= last_used_index` and never stores
//! the same index twice in one chain.

use crate::kv::KeyValueStore;
use crate::wallet_records::address_cache_key;
use crate::Result;
use chrono::{DateTime, Utc};
use harbor_core::{address_to_scripthash, AddressType, Chain, DerivedAddress, DEFAULT_GAP_LIMIT};
use harbor_params::NetworkType;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Schema version of persisted address cache records
pub const ADDRESS_CACHE_SCHEMA_VERSION: u32 = 2;

/// Remaining unused-address buffer below which a chain asks for extension
pub const EXTENSION_THRESHOLD: i64 = (DEFAULT_GAP_LIMIT / 2) as i64;

/// Highest non-hardened BIP32 child index
const MAX_CHILD_INDEX: i64 = (1 << 31) - 1;

/// Derivation cursors for one chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivationState {
    /// Highest index with history, `-1` if none
    pub last_used_index: i64,
    /// Highest index derived, `-1` if none
    pub last_derived_index: i64,
}

impl Default for DerivationState {
    fn default() -> Self {
        Self {
            last_used_index: -1,
            last_derived_index: -1,
        }
    }
}

/// One derived address with its cached scripthash and usage flag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedAddressEntry {
    pub address: String,
    pub path: String,
    pub index: u32,
    pub is_change: bool,
    #[serde(rename = "type")]
    pub address_type: AddressType,
    pub scripthash: String,
    pub is_used: bool,
}

impl CachedAddressEntry {
    /// Build an unused entry from a freshly derived address
    pub fn from_derived(derived: &DerivedAddress) -> Result<Self> {
        Ok(Self {
            scripthash: address_to_scripthash(&derived.address)?,
            address: derived.address.clone(),
            path: derived.path.clone(),
            index: derived.index,
            is_change: derived.is_change,
            address_type: derived.address_type,
            is_used: false,
        })
    }
}

/// Receiving or change chain of one cache
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainState {
    pub derivation: DerivationState,
    pub addresses: Vec<CachedAddressEntry>,
}

impl ChainState {
    /// Derived addresses beyond the last used one
    pub fn unused_buffer(&self) -> i64 {
        self.derivation.last_derived_index - self.derivation.last_used_index
    }

    fn contains_index(&self, index: u32) -> bool {
        self.addresses.iter().any(|entry| entry.index == index)
    }
}

/// Address cache for one wallet and address type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletAddressCache {
    pub schema_version: u32,
    pub wallet_id: String,
    pub network: NetworkType,
    pub address_type: AddressType,
    pub external: ChainState,
    pub internal: ChainState,
    pub last_updated: DateTime<Utc>,
}

impl WalletAddressCache {
    /// Empty cache
    pub fn new(wallet_id: impl Into<String>, network: NetworkType, address_type: AddressType) -> Self {
        Self {
            schema_version: ADDRESS_CACHE_SCHEMA_VERSION,
            wallet_id: wallet_id.into(),
            network,
            address_type,
            external: ChainState::default(),
            internal: ChainState::default(),
            last_updated: Utc::now(),
        }
    }

    pub fn chain(&self, chain: Chain) -> &ChainState {
        match chain {
            Chain::External => &self.external,
            Chain::Internal => &self.internal,
        }
    }

    pub fn chain_mut(&mut self, chain: Chain) -> &mut ChainState {
        match chain {
            Chain::External => &mut self.external,
            Chain::Internal => &mut self.internal,
        }
    }

    /// Every cached entry, receiving chain first
    pub fn entries(&self) -> impl Iterator<Item = &CachedAddressEntry> {
        self.external.addresses.iter().chain(self.internal.addresses.iter())
    }

    /// Lowest-index receiving address without history
    pub fn next_receive_address(&self) -> Option<&CachedAddressEntry> {
        self.external
            .addresses
            .iter()
            .filter(|entry| !entry.is_used)
            .min_by_key(|entry| entry.index)
    }

    /// Scripthashes of every cached address
    pub fn scripthashes(&self) -> Vec<String> {
        self.entries().map(|entry| entry.scripthash.clone()).collect()
    }

    /// Look up an entry by address
    pub fn find(&self, address: &str) -> Option<&CachedAddressEntry> {
        self.entries().find(|entry| entry.address == address)
    }

    /// Addresses known to have history
    pub fn used_addresses(&self) -> Vec<String> {
        self.entries()
            .filter(|entry| entry.is_used)
            .map(|entry| entry.address.clone())
            .collect()
    }

    /// Unused addresses of one chain, in index order
    pub fn unused_addresses(&self, chain: Chain) -> Vec<&CachedAddressEntry> {
        let mut unused: Vec<_> = self
            .chain(chain)
            .addresses
            .iter()
            .filter(|entry| !entry.is_used)
            .collect();
        unused.sort_by_key(|entry| entry.index);
        unused
    }
}

/// Inclusive index range still to derive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivationRange {
    pub start_index: u32,
    pub end_index: u32,
}

impl DerivationRange {
    /// Number of indices covered
    pub fn count(&self) -> u32 {
        self.end_index - self.start_index + 1
    }
}

/// Chains whose unused buffer dropped below [`EXTENSION_THRESHOLD`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtensionNeeded {
    pub external: bool,
    pub internal: bool,
}

impl ExtensionNeeded {
    pub fn any(&self) -> bool {
        self.external || self.internal
    }

    pub fn chains(&self) -> Vec<Chain> {
        Chain::BOTH
            .into_iter()
            .filter(|chain| match chain {
                Chain::External => self.external,
                Chain::Internal => self.internal,
            })
            .collect()
    }

    fn set(&mut self, chain: Chain) {
        match chain {
            Chain::External => self.external = true,
            Chain::Internal => self.internal = true,
        }
    }
}

/// Build an initial cache from a flat list of derived addresses
///
/// Addresses of other types are ignored. Entries whose address appears in
/// `used` start marked, and the cursors are set from the highest derived and
/// highest used index of each chain.
pub fn create_from_addresses(
    wallet_id: impl Into<String>,
    network: NetworkType,
    address_type: AddressType,
    addresses: &[DerivedAddress],
    used: &HashSet<String>,
) -> Result<WalletAddressCache> {
    let mut cache = WalletAddressCache::new(wallet_id, network, address_type);

    for chain in Chain::BOTH {
        let entries = addresses
            .iter()
            .filter(|derived| {
                derived.address_type == address_type && derived.is_change == chain.is_change()
            })
            .map(|derived| {
                let mut entry = CachedAddressEntry::from_derived(derived)?;
                entry.is_used = used.contains(&derived.address);
                Ok(entry)
            })
            .collect::<Result<Vec<_>>>()?;
        add_derived_addresses(&mut cache, chain, entries);
    }

    tracing::debug!(
        wallet_id = %cache.wallet_id,
        address_type = %address_type,
        external = cache.external.addresses.len(),
        internal = cache.internal.addresses.len(),
        "Built address cache from address list"
    );
    Ok(cache)
}

/// Next index range a chain must derive to keep `gap_limit` unused addresses
/// past its last used one, or `None` when the window is already covered
pub fn get_derivation_range(
    cache: &WalletAddressCache,
    chain: Chain,
    gap_limit: u32,
) -> Option<DerivationRange> {
    let state = cache.chain(chain).derivation;
    let window_end = (state.last_used_index + i64::from(gap_limit)).min(MAX_CHILD_INDEX);
    if state.last_derived_index >= window_end {
        return None;
    }

    let start = state.last_derived_index + 1;
    Some(DerivationRange {
        start_index: u32::try_from(start).ok()?,
        end_index: u32::try_from(window_end).ok()?,
    })
}

/// Mark cached addresses found in `used` and report chains needing extension
///
/// A chain is flagged only when this call marked at least one of its
/// addresses and its remaining buffer fell below [`EXTENSION_THRESHOLD`].
pub fn mark_used(cache: &mut WalletAddressCache, used: &HashSet<String>) -> ExtensionNeeded {
    let mut needed = ExtensionNeeded::default();
    let mut changed = false;

    for chain in Chain::BOTH {
        let state = cache.chain_mut(chain);
        let by_address: HashMap<&str, usize> = state
            .addresses
            .iter()
            .enumerate()
            .filter(|(_, entry)| !entry.is_used)
            .map(|(position, entry)| (entry.address.as_str(), position))
            .collect();

        let mut matched: Vec<usize> = used
            .iter()
            .filter_map(|address| by_address.get(address.as_str()).copied())
            .collect();
        if matched.is_empty() {
            continue;
        }
        matched.sort_unstable();

        let mut highest = state.derivation.last_used_index;
        for position in matched {
            let entry = &mut state.addresses[position];
            entry.is_used = true;
            highest = highest.max(i64::from(entry.index));
        }
        state.derivation.last_used_index = highest;
        state.derivation.last_derived_index = state.derivation.last_derived_index.max(highest);
        changed = true;

        if state.unused_buffer() < EXTENSION_THRESHOLD {
            needed.set(chain);
        }
    }

    if changed {
        cache.last_updated = Utc::now();
    }
    needed
}

/// Append derived entries to a chain, skipping indices already present
///
/// Returns the number of entries added. Entries belonging to the other chain
/// are dropped.
pub fn add_derived_addresses(
    cache: &mut WalletAddressCache,
    chain: Chain,
    entries: Vec<CachedAddressEntry>,
) -> usize {
    let state = cache.chain_mut(chain);
    let mut added = 0;

    for entry in entries {
        if entry.is_change != chain.is_change() {
            tracing::warn!(
                path = %entry.path,
                "Skipping address derived for the other chain"
            );
            continue;
        }
        if state.contains_index(entry.index) {
            continue;
        }

        let index = i64::from(entry.index);
        state.derivation.last_derived_index = state.derivation.last_derived_index.max(index);
        if entry.is_used {
            state.derivation.last_used_index = state.derivation.last_used_index.max(index);
        }
        state.addresses.push(entry);
        added += 1;
    }

    if added > 0 {
        state.addresses.sort_by_key(|entry| entry.index);
        cache.last_updated = Utc::now();
    }
    added
}

/// Loads and saves address caches on a [`KeyValueStore`]
#[derive(Clone)]
pub struct AddressCacheStore {
    store: Arc<dyn KeyValueStore>,
}

impl AddressCacheStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Load a cache; missing, stale-version or undecodable records are `None`
    pub async fn load(&self, wallet_id: &str, address_type: AddressType) -> Option<WalletAddressCache> {
        let key = address_cache_key(wallet_id, address_type);
        let raw = match self.store.get(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(wallet_id = %wallet_id, error = %e, "Address cache read failed");
                return None;
            }
        };

        decode_record(&raw, wallet_id, address_type)
    }

    /// Persist a cache, logging and swallowing write failures
    ///
    /// Returns whether the write succeeded.
    pub async fn save(&self, cache: &WalletAddressCache) -> bool {
        match self.try_save(cache).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    wallet_id = %cache.wallet_id,
                    address_type = %cache.address_type,
                    error = %e,
                    "Address cache write failed"
                );
                false
            }
        }
    }

    /// Persist a cache, propagating failures
    pub async fn try_save(&self, cache: &WalletAddressCache) -> Result<()> {
        let key = address_cache_key(&cache.wallet_id, cache.address_type);
        self.store.set(&key, serde_json::to_string(cache)?).await
    }
}

pub(crate) fn decode_record(
    raw: &str,
    wallet_id: &str,
    address_type: AddressType,
) -> Option<WalletAddressCache> {
    let version = serde_json::from_str::<serde_json::Value>(raw)
        .ok()
        .and_then(|value| value.get("schemaVersion").and_then(|v| v.as_u64()));
    if version != Some(u64::from(ADDRESS_CACHE_SCHEMA_VERSION)) {
        tracing::info!(
            wallet_id = %wallet_id,
            address_type = %address_type,
            found = ?version,
            "Discarding address cache with unexpected schema version"
        );
        return None;
    }

    match serde_json::from_str::<WalletAddressCache>(raw) {
        Ok(cache) if cache.wallet_id == wallet_id && cache.address_type == address_type => {
            Some(cache)
        }
        Ok(_) => {
            tracing::warn!(wallet_id = %wallet_id, "Address cache record belongs to another wallet");
            None
        }
        Err(e) => {
            tracing::warn!(wallet_id = %wallet_id, error = %e, "Corrupt address cache record");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStore;
    use harbor_core::{AddressDeriver, Bip32Deriver, DerivationRequest, KeyMaterial};

    fn wallet_addresses(receiving: u32, change: u32) -> Vec<DerivedAddress> {
        let key = KeyMaterial::seed(vec![7u8; 32])
            .parse(NetworkType::Mainnet)
            .unwrap();
        Bip32Deriver::new(NetworkType::Mainnet)
            .derive(
                &key,
                &DerivationRequest::counts(vec![AddressType::P2wpkh], receiving, change),
            )
            .unwrap()
    }

    fn cache_with_cursors(last_used: i64, last_derived: i64) -> WalletAddressCache {
        let mut cache = WalletAddressCache::new("w1", NetworkType::Mainnet, AddressType::P2wpkh);
        cache.external.derivation = DerivationState {
            last_used_index: last_used,
            last_derived_index: last_derived,
        };
        cache
    }

    #[test]
    fn test_range_none_when_window_covered() {
        let cache = cache_with_cursors(5, 25);
        assert_eq!(get_derivation_range(&cache, Chain::External, 20), None);
    }

    #[test]
    fn test_range_covers_missing_tail() {
        let cache = cache_with_cursors(5, 24);
        assert_eq!(
            get_derivation_range(&cache, Chain::External, 20),
            Some(DerivationRange {
                start_index: 25,
                end_index: 25
            })
        );
    }

    #[test]
    fn test_range_for_empty_chain() {
        let cache = cache_with_cursors(-1, -1);
        let range = get_derivation_range(&cache, Chain::Internal, 20).unwrap();
        assert_eq!(range.start_index, 0);
        assert_eq!(range.end_index, 19);
        assert_eq!(range.count(), 20);

        let range = get_derivation_range(&cache, Chain::External, 1).unwrap();
        assert_eq!((range.start_index, range.end_index), (0, 0));
        assert_eq!(get_derivation_range(&cache, Chain::External, 0), None);
    }

    #[test]
    fn test_create_from_addresses_sets_cursors() {
        let addresses = wallet_addresses(20, 5);
        let used: HashSet<String> = [addresses[3].address.clone()].into_iter().collect();

        let cache = create_from_addresses(
            "w1",
            NetworkType::Mainnet,
            AddressType::P2wpkh,
            &addresses,
            &used,
        )
        .unwrap();

        assert_eq!(cache.schema_version, ADDRESS_CACHE_SCHEMA_VERSION);
        assert_eq!(cache.external.addresses.len(), 20);
        assert_eq!(cache.internal.addresses.len(), 5);
        assert_eq!(cache.external.derivation.last_derived_index, 19);
        assert_eq!(cache.external.derivation.last_used_index, 3);
        assert_eq!(cache.internal.derivation.last_used_index, -1);
        assert!(cache.find(&addresses[3].address).unwrap().is_used);
        assert_eq!(cache.used_addresses(), vec![addresses[3].address.clone()]);
        assert_eq!(cache.next_receive_address().unwrap().index, 0);
    }

    #[test]
    fn test_mark_used_flags_extension() {
        let addresses = wallet_addresses(25, 0);
        let mut cache = create_from_addresses(
            "w1",
            NetworkType::Mainnet,
            AddressType::P2wpkh,
            &addresses[..25],
            &HashSet::new(),
        )
        .unwrap();
        // Cursors: used=-1, derived=24
        let used: HashSet<String> = [addresses[15].address.clone()].into_iter().collect();

        let needed = mark_used(&mut cache, &used);

        assert_eq!(cache.external.derivation.last_used_index, 15);
        assert!(needed.external);
        assert!(!needed.internal);
        assert_eq!(needed.chains(), vec![Chain::External]);
    }

    #[test]
    fn test_mark_used_without_new_matches_is_quiet() {
        let addresses = wallet_addresses(12, 0);
        let used: HashSet<String> = [addresses[11].address.clone()].into_iter().collect();
        let mut cache = create_from_addresses(
            "w1",
            NetworkType::Mainnet,
            AddressType::P2wpkh,
            &addresses,
            &used,
        )
        .unwrap();

        // Already marked addresses and strangers do not trigger extension
        let mut again = used.clone();
        again.insert("bc1qunknown".to_string());
        assert!(!mark_used(&mut cache, &again).any());
    }

    #[test]
    fn test_add_derived_skips_existing_indices() {
        let addresses = wallet_addresses(4, 0);
        let mut cache = WalletAddressCache::new("w1", NetworkType::Mainnet, AddressType::P2wpkh);
        let entries: Vec<_> = addresses
            .iter()
            .map(|a| CachedAddressEntry::from_derived(a).unwrap())
            .collect();

        assert_eq!(add_derived_addresses(&mut cache, Chain::External, entries[..3].to_vec()), 3);
        assert_eq!(add_derived_addresses(&mut cache, Chain::External, entries.clone()), 1);
        assert_eq!(add_derived_addresses(&mut cache, Chain::Internal, entries), 0);

        assert_eq!(cache.external.addresses.len(), 4);
        assert_eq!(cache.external.derivation.last_derived_index, 3);
        assert!(cache.internal.addresses.is_empty());
    }

    #[tokio::test]
    async fn test_store_roundtrip_and_version_miss() {
        let kv = Arc::new(MemoryStore::new());
        let store = AddressCacheStore::new(kv.clone());
        let cache = create_from_addresses(
            "w1",
            NetworkType::Mainnet,
            AddressType::P2wpkh,
            &wallet_addresses(3, 1),
            &HashSet::new(),
        )
        .unwrap();

        assert!(store.save(&cache).await);
        assert_eq!(store.load("w1", AddressType::P2wpkh).await, Some(cache.clone()));
        assert_eq!(store.load("w1", AddressType::P2tr).await, None);

        let mut stale = serde_json::to_value(&cache).unwrap();
        stale["schemaVersion"] = serde_json::json!(1);
        kv.set(&address_cache_key("w1", AddressType::P2wpkh), stale.to_string())
            .await
            .unwrap();
        assert_eq!(store.load("w1", AddressType::P2wpkh).await, None);

        kv.set(&address_cache_key("w1", AddressType::P2wpkh), "{not json".to_string())
            .await
            .unwrap();
        assert_eq!(store.load("w1", AddressType::P2wpkh).await, None);
    }

    #[test]
    fn test_record_uses_camel_case() {
        let cache = WalletAddressCache::new("w1", NetworkType::Testnet, AddressType::P2tr);
        let value = serde_json::to_value(&cache).unwrap();
        assert_eq!(value["schemaVersion"], 2);
        assert_eq!(value["addressType"], "p2tr");
        assert_eq!(value["external"]["derivation"]["lastUsedIndex"], -1);
    }
}
