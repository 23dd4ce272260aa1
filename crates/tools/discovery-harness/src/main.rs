//! CLI harness for derivation discovery and wallet sync
//!
//! Runs against a JSON fixture chain index so scenarios can be replayed
//! without a live server:
//! - Discovery across all schemes, optionally cancelled after a delay
//! - A full sync cycle persisted to a SQLite cache
//! - Legacy cache migration and wallet cache purge

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use harbor_core::{AddressType, Bip32Deriver, KeyMaterial};
use harbor_params::NetworkType;
use harbor_storage::{delete_wallet_caches, CacheMigrator, KeyValueStore, SqliteStore};
use harbor_sync::{
    CancelToken, DiscoveryConfig, DiscoveryEngine, FixtureChainIndex, ScanStatus, SyncConfig,
    WalletSynchronizer,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "discovery-harness")]
#[command(about = "Harbor Wallet discovery and sync harness", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan every derivation scheme for activity
    Discover {
        /// Fixture chain index (JSON)
        #[arg(short, long)]
        fixture: PathBuf,

        /// Discovery configuration (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Cancel the session after N milliseconds
        #[arg(long)]
        cancel_after_ms: Option<u64>,

        #[command(flatten)]
        key: KeyArgs,
    },

    /// Run one address and transaction sync cycle
    Sync {
        /// Fixture chain index (JSON)
        #[arg(short, long)]
        fixture: PathBuf,

        /// SQLite cache database
        #[arg(short, long)]
        db: PathBuf,

        /// Wallet identifier
        #[arg(short, long)]
        wallet_id: String,

        /// Network of the wallet
        #[arg(short, long, default_value = "mainnet")]
        network: NetworkType,

        /// Address types to sync
        #[arg(short, long, value_delimiter = ',', default_value = "p2wpkh")]
        types: Vec<AddressType>,

        /// Sync configuration (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        #[command(flatten)]
        key: KeyArgs,
    },

    /// Convert legacy address records
    Migrate {
        /// SQLite cache database
        #[arg(short, long)]
        db: PathBuf,

        /// Wallets to migrate
        #[arg(short, long, required = true)]
        wallet_id: Vec<String>,
    },

    /// Delete every cache record of a wallet
    Purge {
        /// SQLite cache database
        #[arg(short, long)]
        db: PathBuf,

        /// Wallet identifier
        #[arg(short, long)]
        wallet_id: String,
    },
}

/// Key material, exactly one kind
#[derive(Args)]
#[group(required = true, multiple = false)]
struct KeyArgs {
    /// BIP-39 mnemonic
    #[arg(long)]
    mnemonic: Option<String>,

    /// Raw seed, hex encoded
    #[arg(long)]
    seed_hex: Option<String>,

    /// Extended private key
    #[arg(long)]
    xprv: Option<String>,

    /// WIF private key
    #[arg(long)]
    wif: Option<String>,
}

/// BIP-39 passphrase used with --mnemonic
const PASSPHRASE_ENV: &str = "HARBOR_PASSPHRASE";

impl KeyArgs {
    fn into_material(self) -> anyhow::Result<KeyMaterial> {
        if let Some(phrase) = self.mnemonic {
            let passphrase = std::env::var(PASSPHRASE_ENV).unwrap_or_default();
            return Ok(KeyMaterial::mnemonic(phrase, passphrase));
        }
        if let Some(seed) = self.seed_hex {
            return Ok(KeyMaterial::seed(hex::decode(seed.trim()).context("seed is not hex")?));
        }
        if let Some(xprv) = self.xprv {
            return Ok(KeyMaterial::extended_private_key(xprv));
        }
        if let Some(wif) = self.wif {
            return Ok(KeyMaterial::wif(wif));
        }
        bail!("no key material given")
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Discover {
            fixture,
            config,
            cancel_after_ms,
            key,
        } => {
            let config: DiscoveryConfig = load_json_or_default(config.as_deref())?;
            run_discover(&fixture, config, cancel_after_ms, key.into_material()?).await?;
        }
        Commands::Sync {
            fixture,
            db,
            wallet_id,
            network,
            types,
            config,
            key,
        } => {
            let config: SyncConfig = load_json_or_default(config.as_deref())?;
            run_sync(&fixture, &db, &wallet_id, network, &types, config, key.into_material()?)
                .await?;
        }
        Commands::Migrate { db, wallet_id } => {
            let store: Arc<dyn KeyValueStore> = Arc::new(SqliteStore::open(&db)?);
            let report = CacheMigrator::new(store).run(&wallet_id).await?;
            if report.skipped {
                info!("Migration already complete");
            } else {
                info!(
                    "Migrated {} wallets, wrote {} records, discarded {} entries",
                    report.migrated_wallets.len(),
                    report.records_written,
                    report.discarded_entries
                );
            }
        }
        Commands::Purge { db, wallet_id } => {
            let store = SqliteStore::open(&db)?;
            delete_wallet_caches(&store, &wallet_id).await?;
            info!("Purged caches of {}", wallet_id);
        }
    }

    Ok(())
}

fn load_json_or_default<T>(path: Option<&Path>) -> anyhow::Result<T>
where
    T: serde::de::DeserializeOwned + Default,
{
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
        }
        None => Ok(T::default()),
    }
}

fn load_fixture(path: &Path) -> anyhow::Result<FixtureChainIndex> {
    let raw =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(FixtureChainIndex::from_json(&raw)?)
}

async fn run_discover(
    fixture: &Path,
    config: DiscoveryConfig,
    cancel_after_ms: Option<u64>,
    material: KeyMaterial,
) -> anyhow::Result<()> {
    info!("Starting discovery on {}", config.network);

    let schemes = config.schemes.len() as u64;
    let engine = Arc::new(DiscoveryEngine::new(config, Arc::new(load_fixture(fixture)?))?);
    let cancel = CancelToken::new();

    if let Some(delay) = cancel_after_ms {
        cancel.cancel_after(Duration::from_millis(delay));
    }
    watch_ctrl_c(cancel.clone());

    let pb = ProgressBar::new(schemes);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );

    let (handle, mut events) = engine.spawn(material, cancel);
    while let Some(event) = events.recv().await {
        match event.status {
            ScanStatus::Scanning => pb.set_message(format!("scanning {}", event.scheme)),
            ScanStatus::Complete | ScanStatus::Error => pb.inc(1),
            ScanStatus::Pending => {}
        }
    }

    let result = handle.await??;
    if result.is_complete {
        pb.finish_with_message("Discovery complete");
    } else {
        pb.abandon_with_message("Discovery cancelled");
    }

    match result.recommended_scheme() {
        Some(scheme) => info!("Recommended scheme: {}", scheme),
        None => info!("No activity found"),
    }
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn run_sync(
    fixture: &Path,
    db: &Path,
    wallet_id: &str,
    network: NetworkType,
    types: &[AddressType],
    config: SyncConfig,
    material: KeyMaterial,
) -> anyhow::Result<()> {
    let key = material.parse(network)?;
    let index = Arc::new(load_fixture(fixture)?);
    let store: Arc<dyn KeyValueStore> = Arc::new(SqliteStore::open(db)?);

    let sync = WalletSynchronizer::new(
        config,
        Arc::new(Bip32Deriver::new(network)),
        index.clone(),
        index,
        store,
    )?;

    let cancel = CancelToken::new();
    watch_ctrl_c(cancel.clone());
    let report = sync
        .sync_wallet(wallet_id, network, &key, types, &cancel)
        .await?;

    for (address_type, refresh) in &report.addresses {
        info!(
            "{}: derived {}, newly used {}, rounds {}",
            address_type, refresh.derived, refresh.newly_used, refresh.rounds
        );
    }
    info!(
        "Tip {}: {} changed scripthashes, {} fetched, {} new transactions",
        report.tip_height,
        report.changed_scripthashes,
        report.fetched_transactions,
        report.merge.added
    );
    info!("Confirmed balance: {} sats", report.confirmed_balance_sats);
    Ok(())
}

/// Cancel `token` on Ctrl-C; the watcher ends once the token is cancelled
fn watch_ctrl_c(token: CancelToken) {
    tokio::spawn(async move {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if signal.is_ok() {
                    warn!("Interrupted, cancelling");
                    token.cancel();
                }
            }
            _ = token.cancelled() => {}
        }
    });
}
