//! Discovery progress tracking
//!
//! Holds one [`ScanPathResult`] per scheme and forwards every accepted update
//! to an optional event channel. Status only moves forward:
//! pending, then scanning, then complete or error.

use harbor_core::DerivationScheme;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

/// Scan state of one scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    /// Not started
    Pending,
    /// Query in flight
    Scanning,
    /// Finished
    Complete,
    /// Finished with a scheme-local failure
    Error,
}

impl ScanStatus {
    /// Whether no further transition is allowed
    pub fn is_terminal(&self) -> bool {
        matches!(self, ScanStatus::Complete | ScanStatus::Error)
    }

    fn rank(&self) -> u8 {
        match self {
            ScanStatus::Pending => 0,
            ScanStatus::Scanning => 1,
            ScanStatus::Complete | ScanStatus::Error => 2,
        }
    }
}

/// Outcome of scanning one scheme
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanPathResult {
    pub scheme: DerivationScheme,
    pub status: ScanStatus,
    pub balance_sats: u64,
    pub used_address_count: u32,
    pub first_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_used_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ScanPathResult {
    /// Untouched scheme
    pub fn pending(scheme: DerivationScheme) -> Self {
        Self {
            scheme,
            status: ScanStatus::Pending,
            balance_sats: 0,
            used_address_count: 0,
            first_address: String::new(),
            first_used_address: None,
            error: None,
        }
    }

    /// Whether the scheme showed funds or history
    pub fn has_activity(&self) -> bool {
        self.balance_sats > 0 || self.used_address_count > 0
    }
}

/// Combined outcome of a discovery session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryAggregateResult {
    pub results: Vec<ScanPathResult>,
    pub has_activity: bool,
    pub total_balance_sats: u64,
    pub is_complete: bool,
}

impl DiscoveryAggregateResult {
    /// Aggregate per-scheme results
    pub fn from_results(results: Vec<ScanPathResult>) -> Self {
        let total_balance_sats = results
            .iter()
            .filter(|result| result.status == ScanStatus::Complete)
            .map(|result| result.balance_sats)
            .sum();
        Self {
            has_activity: results.iter().any(ScanPathResult::has_activity),
            is_complete: results.iter().all(|result| result.status.is_terminal()),
            total_balance_sats,
            results,
        }
    }

    /// Result for one scheme
    pub fn result(&self, scheme: DerivationScheme) -> Option<&ScanPathResult> {
        self.results.iter().find(|result| result.scheme == scheme)
    }

    /// First scheme, in scan order, with activity
    pub fn recommended_scheme(&self) -> Option<DerivationScheme> {
        self.results
            .iter()
            .find(|result| result.has_activity())
            .map(|result| result.scheme)
    }

    /// Every scheme with activity, in scan order
    pub fn active_schemes(&self) -> Vec<DerivationScheme> {
        self.results
            .iter()
            .filter(|result| result.has_activity())
            .map(|result| result.scheme)
            .collect()
    }
}

/// Shared progress of one discovery session
#[derive(Debug, Clone)]
pub struct DiscoveryProgress {
    results: Arc<RwLock<Vec<ScanPathResult>>>,
    events: Option<UnboundedSender<ScanPathResult>>,
}

impl DiscoveryProgress {
    /// Tracker with every scheme pending
    pub fn new(schemes: &[DerivationScheme], events: Option<UnboundedSender<ScanPathResult>>) -> Self {
        Self {
            results: Arc::new(RwLock::new(
                schemes.iter().copied().map(ScanPathResult::pending).collect(),
            )),
            events,
        }
    }

    /// Apply an update; regressions and unknown schemes are rejected
    ///
    /// Returns whether the update was accepted.
    pub fn update(&self, result: ScanPathResult) -> bool {
        {
            let mut results = self.results.write();
            let Some(slot) = results
                .iter_mut()
                .find(|slot| slot.scheme == result.scheme)
            else {
                tracing::warn!(scheme = %result.scheme, "Progress update for unknown scheme");
                return false;
            };

            if slot.status.is_terminal() || result.status.rank() < slot.status.rank() {
                tracing::warn!(
                    scheme = %result.scheme,
                    from = ?slot.status,
                    to = ?result.status,
                    "Rejected scan status regression"
                );
                return false;
            }
            *slot = result.clone();
        }

        if let Some(events) = &self.events {
            // The receiver may already be gone; progress is still tracked here.
            let _ = events.send(result);
        }
        true
    }

    /// Current result of one scheme
    pub fn get(&self, scheme: DerivationScheme) -> Option<ScanPathResult> {
        self.results
            .read()
            .iter()
            .find(|result| result.scheme == scheme)
            .cloned()
    }

    /// Every result, in scan order
    pub fn snapshot(&self) -> Vec<ScanPathResult> {
        self.results.read().clone()
    }

    /// Aggregate of the current results
    pub fn aggregate(&self) -> DiscoveryAggregateResult {
        DiscoveryAggregateResult::from_results(self.snapshot())
    }

    /// Schemes in a terminal state
    pub fn finished_count(&self) -> usize {
        self.results
            .read()
            .iter()
            .filter(|result| result.status.is_terminal())
            .count()
    }
}
