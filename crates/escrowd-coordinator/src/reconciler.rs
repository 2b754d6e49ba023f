//! # Reconciliation Loop
//!
//! Background workers that re-poll in-flight transactions. Each sweep:
//!
//! 1. claims `Submitted` rows (and `Confirmed` rows with a deferred cancel)
//!    older than `min_age` that no live lease holds, leasing them to this
//!    worker for `claim_lease`,
//! 2. reconciles each claimed row through the state machine,
//! 3. drops the lease whatever the outcome.
//!
//! A crashed worker's rows become claimable again when its lease expires.
//! Several workers (or coordinator instances) can sweep the same store
//! without polling the same row at the same time.
//!
//! One worker per loop also repeats the recovery scan every
//! `recovery.interval_ms`.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use escrowd_store::{ClaimRequest, EscrowStore};
use escrowd_types::{EscrowError, ReconcileConfig, Result, TransactionState, WorkerId};
use tokio::{sync::watch, task::JoinHandle};

use crate::{EscrowStateMachine, RecoveryScan};

/// Tally of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub claimed: usize,
    /// Still waiting for a receipt.
    pub pending: usize,
    pub confirmed: usize,
    pub completed: usize,
    pub cancelled: usize,
    pub failed: usize,
    /// Rows whose reconcile returned an error (for example an unreachable
    /// node). They stay `Submitted` and are retried next sweep.
    pub errors: usize,
}

/// Sweeps in-flight rows on a fixed interval across one or more workers,
/// sharing a state machine and a recovery scan.
pub struct ReconciliationLoop {
    store: Arc<dyn EscrowStore>,
    machine: Arc<EscrowStateMachine>,
    recovery: RecoveryScan,
    config: ReconcileConfig,
}

impl ReconciliationLoop {
    #[must_use]
    pub fn new(
        store: Arc<dyn EscrowStore>,
        machine: Arc<EscrowStateMachine>,
        recovery: RecoveryScan,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            store,
            machine,
            recovery,
            config,
        }
    }

    #[must_use]
    pub fn recovery(&self) -> &RecoveryScan {
        &self.recovery
    }

    /// Claim and reconcile one batch as `worker`.
    ///
    /// # Errors
    /// Store failures while claiming, or durations that do not fit a
    /// timestamp offset. Per-row failures are counted, not returned.
    pub async fn sweep_once(&self, worker: WorkerId) -> Result<SweepReport> {
        let now = Utc::now();
        let request = ClaimRequest {
            worker,
            submitted_before: now - chrono_duration(self.config.min_age(), "min_age_ms")?,
            now,
            lease_until: now + chrono_duration(self.config.claim_lease(), "claim_lease_ms")?,
            limit: self.config.batch_size,
        };
        let claimed = self.store.claim_due(request)?;

        let mut report = SweepReport {
            claimed: claimed.len(),
            ..SweepReport::default()
        };
        for tx in claimed {
            match self.machine.reconcile(tx.id).await {
                Ok(row) => match row.state {
                    TransactionState::Confirmed => report.confirmed += 1,
                    TransactionState::Completed => report.completed += 1,
                    TransactionState::Cancelled => report.cancelled += 1,
                    TransactionState::Failed => report.failed += 1,
                    TransactionState::Created | TransactionState::Submitted => report.pending += 1,
                },
                Err(e) => {
                    tracing::warn!(tx = %tx.id, %worker, error = %e, "reconcile failed; retrying next sweep");
                    report.errors += 1;
                }
            }
            if let Err(e) = self.store.release_claim(tx.id, worker) {
                tracing::error!(tx = %tx.id, %worker, error = %e, "failed to release claim; lease will expire");
            }
        }

        if report.claimed > 0 {
            tracing::info!(
                %worker,
                claimed = report.claimed,
                pending = report.pending,
                confirmed = report.confirmed,
                completed = report.completed,
                cancelled = report.cancelled,
                failed = report.failed,
                errors = report.errors,
                "sweep finished"
            );
        }
        Ok(report)
    }

    /// Run a recovery pass, then sweep as a single worker until `shutdown`
    /// flips to `true`, repeating recovery along the way.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        self.recover();
        self.work(WorkerId::new(), true, shutdown).await;
    }

    /// Run a recovery pass, then spawn `config.workers` sweeping tasks. The
    /// first of them also repeats recovery.
    #[must_use]
    pub fn spawn_workers(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        self.recover();
        (0..self.config.workers)
            .map(|i| {
                let this = Arc::clone(&self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { this.work(WorkerId::new(), i == 0, shutdown).await })
            })
            .collect()
    }

    fn recover(&self) {
        if let Err(e) = self.recovery.run_once() {
            tracing::error!(error = %e, "recovery scan failed; continuing with reconciliation");
        }
    }

    async fn work(&self, worker: WorkerId, rescan: bool, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval());
        let period = self.recovery.interval();
        let mut rescan_ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        tracing::info!(%worker, interval_ms = self.config.interval_ms, rescan, "reconciliation worker started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once(worker).await {
                        tracing::error!(%worker, error = %e, "sweep failed");
                    }
                }
                _ = rescan_ticker.tick(), if rescan => self.recover(),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!(%worker, "reconciliation worker stopped");
    }
}

fn chrono_duration(d: std::time::Duration, field: &str) -> Result<ChronoDuration> {
    ChronoDuration::from_std(d)
        .map_err(|e| EscrowError::Configuration(format!("reconcile.{field}: {e}")))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use escrowd_ledger::{Keyring, LedgerClient, SimulatedLedger};
    use escrowd_store::MemoryStore;
    use escrowd_types::{
        LedgerCall, LedgerConfig, NewAsset, RecoveryConfig, TransactionDraft, TransactionId,
        WalletAddress, Wei,
    };

    use super::*;

    struct Harness {
        store: Arc<MemoryStore>,
        ledger: Arc<SimulatedLedger>,
        machine: Arc<EscrowStateMachine>,
        reconciler: Arc<ReconciliationLoop>,
        submitted: Vec<TransactionId>,
    }

    async fn harness(purchases: usize, config: ReconcileConfig) -> Harness {
        harness_with_recovery(purchases, config, RecoveryConfig::default()).await
    }

    async fn harness_with_recovery(
        purchases: usize,
        config: ReconcileConfig,
        recovery: RecoveryConfig,
    ) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(SimulatedLedger::new());
        let keyring = Arc::new(Keyring::new());
        let seller = keyring.generate().unwrap();
        let buyer = keyring.generate().unwrap();
        let client = Arc::new(LedgerClient::new(ledger.clone(), keyring, LedgerConfig::default()));
        let machine = Arc::new(EscrowStateMachine::new(store.clone(), client.clone(), config.clone()));
        let recovery = RecoveryScan::new(store.clone(), machine.clone(), recovery);
        let reconciler = Arc::new(ReconciliationLoop::new(
            store.clone(),
            machine.clone(),
            recovery,
            config,
        ));

        let mut listed = Vec::new();
        for i in 0..purchases {
            let asset = store
                .insert_asset(NewAsset::new(format!("cat-{i}"), seller, Wei(10)))
                .unwrap();
            let call = LedgerCall::ListAsset {
                asset_id: asset.id,
                price: Wei(10),
            };
            let cost = client.estimate_cost(seller, &call).await.unwrap();
            client.send(seller, &call, cost).await.unwrap();
            listed.push(asset.id);
        }
        ledger.mine();

        let mut submitted = Vec::new();
        for asset_id in listed {
            let tx = machine.create(TransactionDraft { asset_id, buyer }).unwrap();
            submitted.push(machine.submit(tx.id).await.unwrap().id);
        }
        Harness {
            store,
            ledger,
            machine,
            reconciler,
            submitted,
        }
    }

    fn immediate() -> ReconcileConfig {
        ReconcileConfig {
            min_age_ms: 0,
            interval_ms: 10,
            ..ReconcileConfig::default()
        }
    }

    #[tokio::test]
    async fn sweep_confirms_mined_and_counts_pending() {
        let h = harness(3, immediate()).await;
        let report = h.reconciler.sweep_once(WorkerId::new()).await.unwrap();
        assert_eq!(report.claimed, 3);
        assert_eq!(report.pending, 3);

        h.ledger.mine();
        let report = h.reconciler.sweep_once(WorkerId::new()).await.unwrap();
        assert_eq!(report.confirmed, 3);

        let report = h.reconciler.sweep_once(WorkerId::new()).await.unwrap();
        assert_eq!(report.claimed, 0, "confirmed rows are not swept");
    }

    #[tokio::test]
    async fn young_rows_are_not_claimed() {
        let h = harness(
            1,
            ReconcileConfig {
                min_age_ms: 60_000,
                ..ReconcileConfig::default()
            },
        )
        .await;
        let report = h.reconciler.sweep_once(WorkerId::new()).await.unwrap();
        assert_eq!(report, SweepReport::default());
    }

    #[tokio::test]
    async fn unreachable_node_counts_errors_and_keeps_rows() {
        let h = harness(2, immediate()).await;
        h.ledger.set_unreachable(true);
        let report = h.reconciler.sweep_once(WorkerId::new()).await.unwrap();
        assert_eq!(report.errors, 2);

        h.ledger.set_unreachable(false);
        let report = h.reconciler.sweep_once(WorkerId::new()).await.unwrap();
        assert_eq!(report.claimed, 2, "claims were released after the failed sweep");
    }

    #[tokio::test]
    async fn batch_size_limits_claims() {
        let h = harness(
            5,
            ReconcileConfig {
                batch_size: 2,
                ..immediate()
            },
        )
        .await;
        let report = h.reconciler.sweep_once(WorkerId::new()).await.unwrap();
        assert_eq!(report.claimed, 2);
    }

    #[tokio::test]
    async fn workers_run_until_shutdown() {
        let h = harness(
            4,
            ReconcileConfig {
                workers: 2,
                ..immediate()
            },
        )
        .await;
        h.ledger.mine();

        let (stop, shutdown) = watch::channel(false);
        let handles = Arc::clone(&h.reconciler).spawn_workers(shutdown);
        assert_eq!(handles.len(), 2);

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let done = h.submitted.iter().all(|id| {
                    h.store.transaction(*id).unwrap().unwrap().state == TransactionState::Confirmed
                });
                if done {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        stop.send(true).unwrap();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }

    #[tokio::test]
    async fn running_workers_abandon_stale_created_rows() {
        let h = harness_with_recovery(
            0,
            ReconcileConfig {
                workers: 2,
                ..immediate()
            },
            RecoveryConfig {
                stale_unsent_ms: 1,
                interval_ms: 10,
            },
        )
        .await;
        let (stop, shutdown) = watch::channel(false);
        let handles = Arc::clone(&h.reconciler).spawn_workers(shutdown);

        let asset = h
            .store
            .insert_asset(NewAsset::new("late", WalletAddress::random(), Wei(10)))
            .unwrap();
        let tx = h
            .machine
            .create(TransactionDraft {
                asset_id: asset.id,
                buyer: WalletAddress::random(),
            })
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while h.store.transaction(tx.id).unwrap().unwrap().state != TransactionState::Failed {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(h.machine.lock().is_available(asset.id).unwrap());

        stop.send(true).unwrap();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
