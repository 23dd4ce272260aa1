//! Wallet sync integration tests
//!
//! Run full sync cycles against a fixture chain index and an in-memory
//! store, checking gap-window extension, persistence and the incremental
//! transaction worklist.

use harbor_core::keys::test_vectors::*;
use harbor_core::{
    AddressDeriver, AddressType, Bip32Deriver, DerivationRequest, KeyMaterial, ParsedKey,
};
use harbor_params::NetworkType;
use harbor_storage::tx_cache::{is_stable, CachedTransaction};
use harbor_storage::{AddressCacheStore, KeyValueStore, MemoryStore, TransactionCacheStore};
use harbor_sync::{
    CancelToken, Error, FixtureChainIndex, HistoryEntry, SyncConfig, WalletSynchronizer,
};
use std::sync::Arc;

fn abandon_key() -> ParsedKey {
    KeyMaterial::mnemonic(ABANDON_MNEMONIC, "")
        .parse(NetworkType::Mainnet)
        .unwrap()
}

fn receive_address(index: u32) -> String {
    let deriver = Bip32Deriver::new(NetworkType::Mainnet);
    let request = DerivationRequest::chain_range(
        AddressType::P2wpkh,
        harbor_core::Chain::External,
        index,
        index,
    );
    deriver.derive(&abandon_key(), &request).unwrap()[0]
        .address
        .clone()
}

fn fixture(tip_height: u64) -> FixtureChainIndex {
    FixtureChainIndex::new(tip_height)
        .with_address(
            receive_address(15),
            5_000,
            vec![HistoryEntry {
                tx_hash: "t15".to_string(),
                height: 100,
            }],
        )
        .with_transaction(CachedTransaction::confirmed("t15", 100, tip_height, 5_000))
}

fn synchronizer(index: FixtureChainIndex, store: Arc<dyn KeyValueStore>) -> WalletSynchronizer {
    let index = Arc::new(index);
    WalletSynchronizer::new(
        SyncConfig::default(),
        Arc::new(Bip32Deriver::new(NetworkType::Mainnet)),
        index.clone(),
        index,
        store,
    )
    .unwrap()
}

#[tokio::test]
async fn test_first_sync_extends_window_past_used_address() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let sync = synchronizer(fixture(103), store.clone());

    let report = sync
        .sync_wallet(
            "w1",
            NetworkType::Mainnet,
            &abandon_key(),
            &[AddressType::P2wpkh],
            &CancelToken::new(),
        )
        .await
        .unwrap();

    let (_, refresh) = report.addresses[0];
    assert_eq!(refresh.newly_used, 1);
    assert_eq!(refresh.rounds, 2);
    assert_eq!(refresh.derived, 36 + 20);

    let cache = AddressCacheStore::new(store.clone())
        .load("w1", AddressType::P2wpkh)
        .await
        .unwrap();
    assert_eq!(cache.external.derivation.last_used_index, 15);
    assert_eq!(cache.external.derivation.last_derived_index, 35);
    assert_eq!(cache.internal.derivation.last_derived_index, 19);
    assert_eq!(cache.next_receive_address().unwrap().address, ABANDON_BIP84_FIRST);
    assert_eq!(cache.used_addresses(), vec![receive_address(15)]);

    assert_eq!(report.merge.added, 1);
    assert_eq!(report.tip_height, 103);
    assert_eq!(report.confirmed_balance_sats, 5_000);
    let txs = TransactionCacheStore::new(store).load("w1").await.unwrap();
    assert_eq!(txs.transactions.len(), 1);
    assert_eq!(txs.get("t15").unwrap().confirmations, 4);
    assert!(txs.pending_txids.is_empty());
}

#[tokio::test]
async fn test_second_sync_only_rechecks_unstable() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let key = abandon_key();
    let cancel = CancelToken::new();

    synchronizer(fixture(103), store.clone())
        .sync_wallet("w1", NetworkType::Mainnet, &key, &[AddressType::P2wpkh], &cancel)
        .await
        .unwrap();

    let report = synchronizer(fixture(110), store.clone())
        .sync_wallet("w1", NetworkType::Mainnet, &key, &[AddressType::P2wpkh], &cancel)
        .await
        .unwrap();

    assert_eq!(report.addresses[0].1.derived, 0);
    assert_eq!(report.changed_scripthashes, 0);
    assert_eq!(report.fetched_transactions, 1);
    assert_eq!(report.merge.added, 0);

    let txs = TransactionCacheStore::new(store.clone()).load("w1").await.unwrap();
    let tx = txs.get("t15").unwrap();
    assert_eq!(tx.confirmations, 11);
    assert!(is_stable(tx));

    // Nothing left to recheck once the transaction is stable
    let report = synchronizer(fixture(111), store)
        .sync_wallet("w1", NetworkType::Mainnet, &key, &[AddressType::P2wpkh], &cancel)
        .await
        .unwrap();
    assert_eq!(report.fetched_transactions, 0);
    assert_eq!(report.merge.confirmations_refreshed, 1);
}

#[tokio::test]
async fn test_single_key_refresh_terminates() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let key = KeyMaterial::wif(COMPRESSED_WIF)
        .parse(NetworkType::Mainnet)
        .unwrap();

    let report = synchronizer(FixtureChainIndex::new(1), store.clone())
        .sync_wallet(
            "single",
            NetworkType::Mainnet,
            &key,
            &[AddressType::P2wpkh],
            &CancelToken::new(),
        )
        .await
        .unwrap();

    let (_, refresh) = report.addresses[0];
    assert_eq!(refresh.derived, 1);
    assert!(refresh.rounds <= 2);

    let cache = AddressCacheStore::new(store)
        .load("single", AddressType::P2wpkh)
        .await
        .unwrap();
    assert_eq!(cache.external.addresses.len(), 1);
    assert!(cache.internal.addresses.is_empty());
}

#[tokio::test]
async fn test_cancelled_sync_returns_error() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let cancel = CancelToken::new();
    cancel.cancel();

    let result = synchronizer(fixture(103), store.clone())
        .sync_wallet(
            "w1",
            NetworkType::Mainnet,
            &abandon_key(),
            &[AddressType::P2wpkh],
            &cancel,
        )
        .await;

    assert!(matches!(result, Err(Error::Cancelled)));
    assert!(TransactionCacheStore::new(store).load("w1").await.is_none());
}
