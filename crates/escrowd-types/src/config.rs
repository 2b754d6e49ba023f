//! Configuration types for the escrowd coordinator.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{EscrowError, Result, constants};

/// Top-level coordinator configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub ledger: LedgerConfig,
    pub reconcile: ReconcileConfig,
    pub recovery: RecoveryConfig,
    pub log: LogConfig,
}

impl CoordinatorConfig {
    /// Parse from JSON; missing sections and fields take their defaults.
    ///
    /// # Errors
    /// Returns `Serialization` on malformed JSON and `Configuration` if the
    /// parsed values fail [`CoordinatorConfig::validate`].
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall or disable reconciliation.
    ///
    /// # Errors
    /// Returns `Configuration` naming the offending field.
    pub fn validate(&self) -> Result<()> {
        let r = &self.reconcile;
        if r.interval_ms == 0 {
            return Err(EscrowError::Configuration(
                "reconcile.interval_ms must be > 0".into(),
            ));
        }
        if r.max_poll_attempts == 0 {
            return Err(EscrowError::Configuration(
                "reconcile.max_poll_attempts must be > 0".into(),
            ));
        }
        if r.batch_size == 0 {
            return Err(EscrowError::Configuration(
                "reconcile.batch_size must be > 0".into(),
            ));
        }
        if r.workers == 0 {
            return Err(EscrowError::Configuration(
                "reconcile.workers must be > 0".into(),
            ));
        }
        if r.claim_lease_ms == 0 {
            return Err(EscrowError::Configuration(
                "reconcile.claim_lease_ms must be > 0".into(),
            ));
        }
        if r.max_pending_ms == Some(0) {
            return Err(EscrowError::Configuration(
                "reconcile.max_pending_ms must be > 0 when set".into(),
            ));
        }
        if self.recovery.interval_ms == 0 {
            return Err(EscrowError::Configuration(
                "recovery.interval_ms must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Ledger client settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Bound into every signing payload.
    pub chain_id: u64,
    /// Percent added on top of the node's cost estimate.
    pub gas_headroom_pct: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            chain_id: constants::DEFAULT_CHAIN_ID,
            gas_headroom_pct: constants::DEFAULT_GAS_HEADROOM_PCT,
        }
    }
}

/// Reconciliation loop settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Time between sweeps.
    pub interval_ms: u64,
    /// A `Submitted` row is swept only once it has been submitted this long.
    pub min_age_ms: u64,
    /// Polls without a receipt before the final poll and abandonment.
    pub max_poll_attempts: u32,
    /// Optional wall-clock budget since submission, checked alongside the
    /// attempt budget.
    pub max_pending_ms: Option<u64>,
    /// Rows claimed per sweep.
    pub batch_size: usize,
    /// Claim lease; a crashed worker's rows become claimable after this.
    pub claim_lease_ms: u64,
    /// Concurrent sweep workers.
    pub workers: usize,
}

impl ReconcileConfig {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    #[must_use]
    pub fn min_age(&self) -> Duration {
        Duration::from_millis(self.min_age_ms)
    }

    #[must_use]
    pub fn claim_lease(&self) -> Duration {
        Duration::from_millis(self.claim_lease_ms)
    }

    #[must_use]
    pub fn max_pending(&self) -> Option<Duration> {
        self.max_pending_ms.map(Duration::from_millis)
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_ms: constants::DEFAULT_RECONCILE_INTERVAL_MS,
            min_age_ms: constants::DEFAULT_RECONCILE_MIN_AGE_MS,
            max_poll_attempts: constants::DEFAULT_MAX_POLL_ATTEMPTS,
            max_pending_ms: None,
            batch_size: constants::DEFAULT_SWEEP_BATCH_SIZE,
            claim_lease_ms: constants::DEFAULT_CLAIM_LEASE_MS,
            workers: constants::DEFAULT_RECONCILE_WORKERS,
        }
    }
}

/// Recovery pass settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Rows that never recorded a hash are recovered once this old.
    pub stale_unsent_ms: u64,
    /// Workers repeat the recovery pass this often, not only at start.
    pub interval_ms: u64,
}

impl RecoveryConfig {
    #[must_use]
    pub fn stale_unsent(&self) -> Duration {
        Duration::from_millis(self.stale_unsent_ms)
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            stale_unsent_ms: constants::DEFAULT_STALE_UNSENT_MS,
            interval_ms: constants::DEFAULT_RECOVERY_INTERVAL_MS,
        }
    }
}

/// Tracing output settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive used when `ESCROWD_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: constants::DEFAULT_LOG_LEVEL.to_string(),
            json: false,
        }
    }
}
