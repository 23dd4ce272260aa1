//! Discovery and sync configuration

use crate::{Error, Result};
use harbor_core::{DerivationScheme, DEFAULT_GAP_LIMIT, SCAN_ORDER};
use harbor_params::NetworkType;
use harbor_storage::STABLE_CONFIRMATIONS;
use serde::{Deserialize, Serialize};

/// Discovery session configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Network the key material belongs to
    pub network: NetworkType,
    /// Receiving addresses queried per scheme
    pub gap_limit: u32,
    /// Schemes to scan, in priority order
    pub schemes: Vec<DerivationScheme>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            network: NetworkType::Mainnet,
            gap_limit: DEFAULT_GAP_LIMIT,
            schemes: SCAN_ORDER.to_vec(),
        }
    }
}

impl DiscoveryConfig {
    /// Default configuration for `network`
    pub fn for_network(network: NetworkType) -> Self {
        Self {
            network,
            ..Self::default()
        }
    }

    /// Reject empty or duplicated scheme lists
    pub fn validate(&self) -> Result<()> {
        if self.schemes.is_empty() {
            return Err(Error::Config("at least one scheme is required".to_string()));
        }
        for (position, scheme) in self.schemes.iter().enumerate() {
            if self.schemes[..position].contains(scheme) {
                return Err(Error::Config(format!("scheme {scheme} listed twice")));
            }
        }
        Ok(())
    }
}

/// Steady-state sync configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Unused addresses kept derived past the last used one
    pub gap_limit: u32,
    /// Addresses or scripthashes per chain-index request
    pub query_batch_size: usize,
    /// Upper bound on derive-and-query rounds per address refresh
    pub max_refresh_rounds: u32,
    /// Confirmations after which a transaction leaves the recheck worklist
    pub stability_confirmations: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            gap_limit: DEFAULT_GAP_LIMIT,
            query_batch_size: 100,
            max_refresh_rounds: 10,
            stability_confirmations: STABLE_CONFIRMATIONS,
        }
    }
}

impl SyncConfig {
    /// Reject settings that would stall a sync
    pub fn validate(&self) -> Result<()> {
        if self.gap_limit == 0 {
            return Err(Error::Config("gap_limit must be at least 1".to_string()));
        }
        if self.query_batch_size == 0 {
            return Err(Error::Config("query_batch_size must be at least 1".to_string()));
        }
        if self.max_refresh_rounds == 0 {
            return Err(Error::Config("max_refresh_rounds must be at least 1".to_string()));
        }
        Ok(())
    }
}
