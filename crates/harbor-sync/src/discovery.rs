//! Derivation discovery
//!
//! Given freshly imported key material of unknown derivation scheme, scans
//! each candidate scheme's first gap-limit window of receiving addresses and
//! reports which schemes hold funds or history.
//!
//! Schemes are scanned one after another with a single chain-index query
//! each. The cancel token is checked before every scheme; a query that
//! returns after cancellation is discarded and its scheme stays scanning.

use crate::cancel::CancelToken;
use crate::chain_index::ChainIndex;
use crate::config::DiscoveryConfig;
use crate::discovery_logger::DiscoveryLogger;
use crate::progress::{DiscoveryAggregateResult, DiscoveryProgress, ScanPathResult, ScanStatus};
use crate::Result;
use harbor_core::{
    AddressDeriver, AddressType, Bip32Deriver, DerivationRequest, DerivationScheme, KeyMaterial,
    ParsedKey,
};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

/// Discovery engine
///
/// Holds no per-session state; one engine can run any number of sessions.
pub struct DiscoveryEngine {
    config: DiscoveryConfig,
    chain_index: Arc<dyn ChainIndex>,
    deriver: Arc<dyn AddressDeriver>,
}

impl DiscoveryEngine {
    /// Engine using [`Bip32Deriver`] for the configured network
    pub fn new(config: DiscoveryConfig, chain_index: Arc<dyn ChainIndex>) -> Result<Self> {
        let deriver = Arc::new(Bip32Deriver::new(config.network));
        Self::with_deriver(config, chain_index, deriver)
    }

    /// Engine with a caller-provided derivation primitive
    pub fn with_deriver(
        config: DiscoveryConfig,
        chain_index: Arc<dyn ChainIndex>,
        deriver: Arc<dyn AddressDeriver>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            chain_index,
            deriver,
        })
    }

    /// Active configuration
    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Run a session in the background, streaming progress events
    pub fn spawn(
        self: Arc<Self>,
        material: KeyMaterial,
        cancel: CancelToken,
    ) -> (
        JoinHandle<Result<DiscoveryAggregateResult>>,
        UnboundedReceiver<ScanPathResult>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move { self.discover(&material, &cancel, Some(tx)).await });
        (handle, rx)
    }

    /// Scan every configured scheme
    ///
    /// Fails only when the key material cannot be parsed; scheme-level
    /// failures end up in that scheme's result. Cancellation returns the
    /// partial aggregate with `is_complete == false`.
    pub async fn discover(
        &self,
        material: &KeyMaterial,
        cancel: &CancelToken,
        events: Option<UnboundedSender<ScanPathResult>>,
    ) -> Result<DiscoveryAggregateResult> {
        let key = material.parse(self.config.network)?;

        let schemes = &self.config.schemes;
        let progress = DiscoveryProgress::new(schemes, events);
        let mut logger = DiscoveryLogger::new();
        logger.log_started(material.kind(), schemes.len());

        let applicable = applicable_types(&key);
        for &scheme in schemes {
            if !applicable.contains(&scheme.address_type()) {
                finish_not_applicable(&key, scheme, &progress, &mut logger);
                continue;
            }
            if cancel.is_cancelled() {
                return Ok(self.stop_cancelled(&key, &progress, &mut logger));
            }

            progress.update(ScanPathResult {
                status: ScanStatus::Scanning,
                ..ScanPathResult::pending(scheme)
            });

            let Some(result) = self.scan_scheme(&key, scheme, cancel).await else {
                tracing::debug!(scheme = %scheme, "Discarding query result after cancellation");
                return Ok(self.stop_cancelled(&key, &progress, &mut logger));
            };
            logger.log_scheme_finished(&result);
            progress.update(result);
        }

        let aggregate = progress.aggregate();
        logger.log_completed(&aggregate);
        Ok(aggregate)
    }

    /// Finish the schemes that need no scan, then report the partial aggregate
    fn stop_cancelled(
        &self,
        key: &ParsedKey,
        progress: &DiscoveryProgress,
        logger: &mut DiscoveryLogger,
    ) -> DiscoveryAggregateResult {
        let applicable = applicable_types(key);
        for &scheme in &self.config.schemes {
            let untouched = progress
                .get(scheme)
                .is_some_and(|result| result.status == ScanStatus::Pending);
            if untouched && !applicable.contains(&scheme.address_type()) {
                finish_not_applicable(key, scheme, progress, logger);
            }
        }
        logger.log_cancelled(progress.finished_count());
        progress.aggregate()
    }

    /// Terminal result for one scheme, or `None` if cancelled mid-query
    async fn scan_scheme(
        &self,
        key: &ParsedKey,
        scheme: DerivationScheme,
        cancel: &CancelToken,
    ) -> Option<ScanPathResult> {
        let request = DerivationRequest::counts(vec![scheme.address_type()], self.config.gap_limit, 0);
        let addresses = match self.deriver.derive(key, &request) {
            Ok(addresses) => addresses,
            Err(e) => {
                return Some(ScanPathResult {
                    status: ScanStatus::Error,
                    error: Some(e.to_string()),
                    ..ScanPathResult::pending(scheme)
                })
            }
        };

        let first_address = addresses
            .first()
            .map(|derived| derived.address.clone())
            .unwrap_or_default();
        if addresses.is_empty() {
            return Some(ScanPathResult {
                status: ScanStatus::Complete,
                first_address,
                ..ScanPathResult::pending(scheme)
            });
        }

        let window: Vec<String> = addresses.iter().map(|derived| derived.address.clone()).collect();
        let outcome = self.chain_index.query(&window).await;
        if cancel.is_cancelled() {
            return None;
        }

        Some(match outcome {
            Ok(answer) => {
                let used: Vec<&String> = window.iter().filter(|address| answer.is_used(address)).collect();
                ScanPathResult {
                    scheme,
                    status: ScanStatus::Complete,
                    balance_sats: answer.balance.total,
                    used_address_count: u32::try_from(used.len()).unwrap_or(u32::MAX),
                    first_address,
                    first_used_address: used.first().map(|address| (*address).clone()),
                    error: None,
                }
            }
            Err(e) => ScanPathResult {
                status: ScanStatus::Error,
                first_address,
                error: Some(e.message),
                ..ScanPathResult::pending(scheme)
            },
        })
    }
}

fn applicable_types(key: &ParsedKey) -> Vec<AddressType> {
    match key {
        ParsedKey::Hd(_) => AddressType::ALL.to_vec(),
        ParsedKey::Single(single) => single.applicable_address_types().to_vec(),
    }
}

fn finish_not_applicable(
    key: &ParsedKey,
    scheme: DerivationScheme,
    progress: &DiscoveryProgress,
    logger: &mut DiscoveryLogger,
) {
    let result = ScanPathResult {
        status: ScanStatus::Complete,
        error: Some(not_applicable_reason(key, scheme)),
        ..ScanPathResult::pending(scheme)
    };
    logger.log_scheme_finished(&result);
    progress.update(result);
}

fn not_applicable_reason(key: &ParsedKey, scheme: DerivationScheme) -> String {
    match key {
        ParsedKey::Single(single) if !single.is_compressed() => {
            format!("{scheme} not applicable to an uncompressed private key")
        }
        _ => format!("{scheme} not applicable to a single private key"),
    }
}
