//! Storage keys for per-wallet cache records

use crate::kv::KeyValueStore;
use crate::Result;
use harbor_core::AddressType;

const ADDRESS_CACHE_PREFIX: &str = "harbor:address_cache";
const TX_CACHE_PREFIX: &str = "harbor:tx_cache";

/// Key holding the one-shot legacy migration marker
pub const MIGRATION_MARKER_KEY: &str = "harbor:migrations:address_cache";

/// Key of the structured address cache for one wallet and address type
pub fn address_cache_key(wallet_id: &str, address_type: AddressType) -> String {
    format!("{ADDRESS_CACHE_PREFIX}:v2:{wallet_id}:{address_type}")
}

/// Key of the flat, un-typed address record written by older releases
pub fn legacy_address_cache_key(wallet_id: &str) -> String {
    format!("{ADDRESS_CACHE_PREFIX}:{wallet_id}")
}

/// Key of the transaction cache for one wallet
pub fn tx_cache_key(wallet_id: &str) -> String {
    format!("{TX_CACHE_PREFIX}:v1:{wallet_id}")
}

/// Every key a wallet may own
pub fn wallet_cache_keys(wallet_id: &str) -> Vec<String> {
    let mut keys: Vec<String> = AddressType::ALL
        .iter()
        .map(|address_type| address_cache_key(wallet_id, *address_type))
        .collect();
    keys.push(legacy_address_cache_key(wallet_id));
    keys.push(tx_cache_key(wallet_id));
    keys
}

/// Remove every cache record of a wallet in one batch
///
/// Each removal is independent and idempotent; a wallet with no records
/// purges successfully.
pub async fn delete_wallet_caches(store: &dyn KeyValueStore, wallet_id: &str) -> Result<()> {
    let keys = wallet_cache_keys(wallet_id);
    store.multi_remove(&keys).await?;
    tracing::info!(wallet_id = %wallet_id, keys = keys.len(), "Purged wallet caches");
    Ok(())
}
