//! Structured logging for discovery sessions
//!
//! Records the lifecycle of one session as events and mirrors each one as a
//! `tracing` event. Key material never appears in the log, only its kind.

#![allow(missing_docs)]

use crate::progress::{DiscoveryAggregateResult, ScanPathResult, ScanStatus};
use harbor_core::DerivationScheme;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn, Level};

/// Discovery event type
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    /// Session started
    Started {
        key_kind: String,
        schemes: usize,
        timestamp: String,
    },
    /// One scheme reached a terminal state
    SchemeFinished {
        scheme: DerivationScheme,
        status: ScanStatus,
        balance_sats: u64,
        used_address_count: u32,
    },
    /// Session stopped by its cancel token
    Cancelled { finished_schemes: usize },
    /// Session finished every scheme
    Completed {
        total_balance_sats: u64,
        has_activity: bool,
        duration_ms: u64,
    },
}

/// Discovery session logger
pub struct DiscoveryLogger {
    events: Vec<DiscoveryEvent>,
    started: Instant,
}

impl DiscoveryLogger {
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            started: Instant::now(),
        }
    }

    pub fn log_started(&mut self, key_kind: &str, schemes: usize) {
        self.started = Instant::now();
        let timestamp = chrono::Utc::now().to_rfc3339();

        info!(
            event = "discovery_started",
            key_kind = %key_kind,
            schemes = schemes,
            timestamp = %timestamp,
            "Derivation discovery started"
        );

        self.events.push(DiscoveryEvent::Started {
            key_kind: key_kind.to_string(),
            schemes,
            timestamp,
        });
    }

    pub fn log_scheme_finished(&mut self, result: &ScanPathResult) {
        match &result.error {
            Some(error) if result.status == ScanStatus::Error => warn!(
                event = "discovery_scheme_failed",
                scheme = %result.scheme,
                error = %error,
                "Scheme scan failed"
            ),
            _ => debug!(
                event = "discovery_scheme_finished",
                scheme = %result.scheme,
                balance_sats = result.balance_sats,
                used_address_count = result.used_address_count,
                "Scheme scan finished"
            ),
        }

        self.events.push(DiscoveryEvent::SchemeFinished {
            scheme: result.scheme,
            status: result.status,
            balance_sats: result.balance_sats,
            used_address_count: result.used_address_count,
        });
    }

    pub fn log_cancelled(&mut self, finished_schemes: usize) {
        info!(
            event = "discovery_cancelled",
            finished_schemes = finished_schemes,
            "Derivation discovery cancelled"
        );

        self.events.push(DiscoveryEvent::Cancelled { finished_schemes });
    }

    pub fn log_completed(&mut self, aggregate: &DiscoveryAggregateResult) {
        let duration_ms = duration_ms(self.started.elapsed());

        info!(
            event = "discovery_completed",
            total_balance_sats = aggregate.total_balance_sats,
            has_activity = aggregate.has_activity,
            duration_ms = duration_ms,
            "Derivation discovery completed"
        );

        self.events.push(DiscoveryEvent::Completed {
            total_balance_sats: aggregate.total_balance_sats,
            has_activity: aggregate.has_activity,
            duration_ms,
        });
    }

    pub fn events(&self) -> &[DiscoveryEvent] {
        &self.events
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

impl Default for DiscoveryLogger {
    fn default() -> Self {
        Self::new()
    }
}

/// Whole milliseconds, saturating at `u64::MAX`
pub(crate) fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Install a JSON `tracing` subscriber for discovery sessions
///
/// Does nothing if a global subscriber is already set.
pub fn init_discovery_logging() {
    let installed = tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .json()
        .try_init()
        .is_ok();

    if installed {
        info!("Discovery logging initialized");
    }
}
