//! Restart and periodic recovery.
//!
//! The store and the ledger commit independently, and so do a terminal
//! transition and its availability release. A crash between any two of
//! those steps leaves one of two shapes behind, and this scan repairs both:
//!
//! 1. Rows that never recorded a hash (stuck in `Created`, or a finalize
//!    reserved in `Submitted`) are resolved through
//!    [`EscrowStateMachine::abandon_unsent`].
//! 2. Unsold assets still marked unavailable with no active transaction
//!    get their lock released.
//!
//! Rows in `Submitted` with a recorded hash need nothing here: the
//! reconciliation loop picks them up. The loop also repeats this scan every
//! `recovery.interval_ms`, so a row stranded by a failed write mid-run is
//! repaired without a restart.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use escrowd_store::EscrowStore;
use escrowd_types::{EscrowError, RecoveryConfig, Result};

use crate::EscrowStateMachine;

/// What one recovery pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// `Created` rows failed as abandoned.
    pub abandoned: usize,
    /// Reserved finalizes rolled back to `Confirmed`.
    pub rolled_back: usize,
    /// Orphaned availability locks released.
    pub released: usize,
}

impl RecoveryReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        *self == Self::default()
    }
}

/// Repairs rows and locks left behind by an interrupted write. Each pass
/// is idempotent and safe alongside live traffic.
pub struct RecoveryScan {
    store: Arc<dyn EscrowStore>,
    machine: Arc<EscrowStateMachine>,
    config: RecoveryConfig,
}

impl RecoveryScan {
    #[must_use]
    pub fn new(
        store: Arc<dyn EscrowStore>,
        machine: Arc<EscrowStateMachine>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            store,
            machine,
            config,
        }
    }

    /// How often a running reconciliation loop repeats the scan.
    #[must_use]
    pub fn interval(&self) -> std::time::Duration {
        self.config.interval()
    }

    /// One idempotent pass over the store.
    ///
    /// # Errors
    /// Store failures; `Configuration` if the staleness threshold does not
    /// fit a timestamp offset.
    pub fn run_once(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        let threshold = ChronoDuration::from_std(self.config.stale_unsent())
            .map_err(|e| EscrowError::Configuration(format!("recovery.stale_unsent_ms: {e}")))?;
        for tx in self.store.stale_unsent(Utc::now() - threshold)? {
            match self.machine.abandon_unsent(&tx)? {
                Some(done) if done.is_terminal() => report.abandoned += 1,
                Some(_) => report.rolled_back += 1,
                None => {}
            }
        }

        for asset_id in self.store.locked_assets_without_active_transaction()? {
            if self.machine.lock().release(asset_id)? {
                tracing::warn!(asset = %asset_id, "released orphaned availability lock");
                report.released += 1;
            }
        }

        if report.is_clean() {
            tracing::debug!("recovery scan found nothing to repair");
        } else {
            tracing::info!(
                abandoned = report.abandoned,
                rolled_back = report.rolled_back,
                released = report.released,
                "recovery scan repaired state"
            );
        }
        Ok(report)
    }
}
