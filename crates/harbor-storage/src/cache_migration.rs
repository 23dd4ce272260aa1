//! One-shot migration of legacy flat address records
//!
//! Older releases kept a single record per wallet listing every derived
//! address with no chain separation and no address type. The migrator
//! rebuilds those into per-type [`WalletAddressCache`] records, writes them,
//! and only then deletes the legacy record. A marker key stores the migration
//! version so later startups skip the scan.

use crate::address_cache::{
    create_from_addresses, decode_record, WalletAddressCache, ADDRESS_CACHE_SCHEMA_VERSION,
};
use crate::kv::KeyValueStore;
use crate::wallet_records::{address_cache_key, legacy_address_cache_key, MIGRATION_MARKER_KEY};
use crate::Result;
use harbor_core::{AddressType, DerivedAddress, EncodedAddress};
use harbor_params::NetworkType;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Address entry of a legacy record
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyAddressEntry {
    pub address: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub is_change: Option<bool>,
    #[serde(default)]
    pub is_used: bool,
}

impl LegacyAddressEntry {
    /// Chain flag, falling back to the second-to-last path component
    fn is_change(&self) -> bool {
        self.is_change.unwrap_or_else(|| {
            let mut components = self.path.rsplit('/');
            components.next();
            components.next() == Some("1")
        })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LegacyRecord {
    Wrapped { addresses: Vec<LegacyAddressEntry> },
    Flat(Vec<LegacyAddressEntry>),
}

impl LegacyRecord {
    fn into_entries(self) -> Vec<LegacyAddressEntry> {
        match self {
            LegacyRecord::Wrapped { addresses } | LegacyRecord::Flat(addresses) => addresses,
        }
    }
}

/// Outcome of a migration run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// The marker showed the migration already ran
    pub skipped: bool,
    /// Wallets whose legacy record was converted
    pub migrated_wallets: Vec<String>,
    /// Structured records written
    pub records_written: usize,
    /// Legacy entries dropped because their address could not be decoded
    pub discarded_entries: usize,
}

/// Versioned startup step converting legacy address records
#[derive(Clone)]
pub struct CacheMigrator {
    store: Arc<dyn KeyValueStore>,
}

impl CacheMigrator {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Migration version recorded by a previous run, if any
    pub async fn completed_version(&self) -> Result<Option<u32>> {
        Ok(self
            .store
            .get(MIGRATION_MARKER_KEY)
            .await?
            .and_then(|raw| raw.trim().parse().ok()))
    }

    /// Migrate every listed wallet, then record completion
    ///
    /// The marker is written only when every wallet migrated, so a failed
    /// run is retried at the next startup.
    pub async fn run(&self, wallet_ids: &[String]) -> Result<MigrationReport> {
        if let Some(version) = self.completed_version().await? {
            if version >= ADDRESS_CACHE_SCHEMA_VERSION {
                tracing::debug!(version, "Address cache migration already complete");
                return Ok(MigrationReport {
                    skipped: true,
                    ..MigrationReport::default()
                });
            }
        }

        let mut report = MigrationReport::default();
        for wallet_id in wallet_ids {
            self.migrate_wallet(wallet_id, &mut report).await?;
        }

        self.store
            .set(MIGRATION_MARKER_KEY, ADDRESS_CACHE_SCHEMA_VERSION.to_string())
            .await?;
        tracing::info!(
            wallets = report.migrated_wallets.len(),
            records = report.records_written,
            "Address cache migration complete"
        );
        Ok(report)
    }

    async fn migrate_wallet(&self, wallet_id: &str, report: &mut MigrationReport) -> Result<()> {
        let legacy_key = legacy_address_cache_key(wallet_id);
        let Some(raw) = self.store.get(&legacy_key).await? else {
            return Ok(());
        };

        let entries = match serde_json::from_str::<LegacyRecord>(&raw) {
            Ok(record) => record.into_entries(),
            Err(e) => {
                tracing::warn!(wallet_id = %wallet_id, error = %e, "Dropping corrupt legacy address record");
                self.store.remove(&legacy_key).await?;
                return Ok(());
            }
        };

        let mut groups: BTreeMap<AddressType, (Vec<DerivedAddress>, HashSet<String>)> =
            BTreeMap::new();
        // Base58 versions are shared by testnet, signet and regtest; a bech32
        // HRP tells them apart, so it wins when present.
        let mut bech32_network: Option<NetworkType> = None;
        let mut base58_network: Option<NetworkType> = None;

        for entry in entries {
            let decoded = match EncodedAddress::parse(&entry.address) {
                Ok(decoded) => decoded,
                Err(e) => {
                    tracing::warn!(wallet_id = %wallet_id, error = %e, "Skipping undecodable legacy address");
                    report.discarded_entries += 1;
                    continue;
                }
            };
            let Some(address_type) = decoded.address_type else {
                report.discarded_entries += 1;
                continue;
            };
            match address_type {
                AddressType::P2wpkh | AddressType::P2tr => {
                    bech32_network.get_or_insert(decoded.network);
                }
                AddressType::P2pkh | AddressType::P2shP2wpkh => {
                    base58_network.get_or_insert(decoded.network);
                }
            }

            let is_change = entry.is_change();
            let (addresses, used) = groups.entry(address_type).or_default();
            if entry.is_used {
                used.insert(entry.address.clone());
            }
            addresses.push(DerivedAddress {
                address: entry.address,
                path: entry.path,
                index: entry.index,
                is_change,
                address_type,
            });
        }

        let network = bech32_network
            .or(base58_network)
            .unwrap_or(NetworkType::Mainnet);
        let mut records = Vec::new();
        for (address_type, (addresses, used)) in groups {
            let key = address_cache_key(wallet_id, address_type);
            if let Some(raw) = self.store.get(&key).await? {
                if decode_record(&raw, wallet_id, address_type).is_some() {
                    tracing::debug!(
                        wallet_id = %wallet_id,
                        address_type = %address_type,
                        "Structured record already present, keeping it"
                    );
                    continue;
                }
            }

            let cache: WalletAddressCache =
                create_from_addresses(wallet_id, network, address_type, &addresses, &used)?;
            records.push((key, serde_json::to_string(&cache)?));
        }

        let written = records.len();
        if !records.is_empty() {
            self.store.multi_set(records).await?;
        }
        self.store.remove(&legacy_key).await?;

        tracing::info!(
            wallet_id = %wallet_id,
            network = %network,
            records = written,
            "Migrated legacy address record"
        );
        report.records_written += written;
        report.migrated_wallets.push(wallet_id.to_string());
        Ok(())
    }
}
