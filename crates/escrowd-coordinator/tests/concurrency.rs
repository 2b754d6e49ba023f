//! Racing callers against one coordinator.
//!
//! Exercises the availability lock and the finalize reservation under a
//! multi-threaded runtime: however the tasks interleave, an asset has at
//! most one active transaction and a confirmed escrow is finalized once.
//!
//! The later tests hold ledger calls open at chosen points through
//! [`GatedNode`] so a specific interleaving is forced rather than hoped for.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use escrowd_coordinator::{DevStack, EscrowStateMachine, ReconciliationLoop, RecoveryScan};
use escrowd_ledger::{EscrowStatus, Keyring, LedgerClient, LedgerNode, SimulatedLedger};
use escrowd_store::{EscrowStore, MemoryStore};
use escrowd_types::*;
use tokio::{sync::watch, task::JoinSet};

fn stack() -> Arc<DevStack> {
    Arc::new(DevStack::new(&CoordinatorConfig::default()).expect("default config is valid"))
}

/// Register and list an asset owned by a fresh seller.
async fn listed(stack: &DevStack, price: u128) -> Asset {
    let seller = stack.keyring.generate().unwrap();
    let asset = stack
        .coordinator
        .register_asset("Nyan", seller, Wei(price))
        .unwrap();
    stack.coordinator.list_asset(asset.id, Wei(price)).await.unwrap();
    stack.ledger.mine();
    asset
}

fn active_for(stack: &DevStack, asset_id: AssetId) -> usize {
    stack
        .coordinator
        .transactions(0, usize::MAX)
        .unwrap()
        .iter()
        .filter(|tx| tx.asset_id == asset_id && tx.state.is_active())
        .count()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_purchases_admit_exactly_one() {
    let stack = stack();
    let asset = listed(&stack, 500).await;
    let asset_id = asset.id;

    let mut set = JoinSet::new();
    for _ in 0..16 {
        let stack = Arc::clone(&stack);
        let buyer = stack.keyring.generate().unwrap();
        set.spawn(async move { stack.coordinator.purchase(asset_id, buyer).await });
    }

    let mut admitted = Vec::new();
    let mut refused = 0;
    while let Some(joined) = set.join_next().await {
        match joined.unwrap() {
            Ok(tx) => admitted.push(tx),
            Err(EscrowError::AssetUnavailable(id)) => {
                assert_eq!(id, asset.id);
                refused += 1;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(admitted.len(), 1);
    assert_eq!(refused, 15);
    assert_eq!(admitted[0].state, TransactionState::Submitted);
    assert_eq!(stack.coordinator.transactions(0, 100).unwrap().len(), 1);
    assert_eq!(active_for(&stack, asset.id), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_complete_and_cancel_finalize_once() {
    let stack = stack();
    let asset = listed(&stack, 500).await;
    let buyer = stack.keyring.generate().unwrap();
    let tx = stack.coordinator.purchase(asset.id, buyer).await.unwrap();
    stack.ledger.mine();
    let tx = stack.coordinator.reconcile_one(tx.id).await.unwrap();
    assert_eq!(tx.state, TransactionState::Confirmed);
    let id = tx.id;

    let completer = {
        let stack = Arc::clone(&stack);
        tokio::spawn(async move { stack.coordinator.complete(id).await })
    };
    let canceller = {
        let stack = Arc::clone(&stack);
        tokio::spawn(async move { stack.coordinator.cancel(id).await })
    };
    let results = [completer.await.unwrap(), canceller.await.unwrap()];

    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1, "exactly one finalizer proceeds: {results:?}");
    assert!(
        results
            .iter()
            .any(|r| matches!(r, Err(EscrowError::InvalidState { .. })))
    );
    assert_eq!(stack.ledger.pending_count(), 1, "only one call reached the ledger");

    let winner = winners[0].pending_call;
    stack.ledger.mine();
    let tx = stack.coordinator.reconcile_one(id).await.unwrap();
    let expected = match winner {
        CallKind::Complete => TransactionState::Completed,
        CallKind::Cancel => TransactionState::Cancelled,
        CallKind::Purchase => unreachable!("finalize never reserves a purchase"),
    };
    assert_eq!(tx.state, expected);
    assert_eq!(active_for(&stack, asset.id), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn churn_never_overlaps_active_transactions() {
    let stack = stack();
    let asset = listed(&stack, 10).await;
    let asset_id = asset.id;
    let buyers: Vec<_> = (0..4).map(|_| stack.keyring.generate().unwrap()).collect();

    for round in 0..5 {
        let mut set = JoinSet::new();
        for buyer in &buyers {
            let stack = Arc::clone(&stack);
            let buyer = *buyer;
            set.spawn(async move { stack.coordinator.purchase(asset_id, buyer).await });
        }
        let mut winner = None;
        while let Some(joined) = set.join_next().await {
            if let Ok(tx) = joined.unwrap() {
                assert!(winner.replace(tx).is_none(), "round {round}: two purchases admitted");
            }
            assert!(active_for(&stack, asset.id) <= 1);
        }
        let tx = winner.expect("one purchase per round");

        stack.ledger.mine();
        stack.coordinator.reconcile_one(tx.id).await.unwrap();
        stack.coordinator.cancel(tx.id).await.unwrap();
        stack.ledger.mine();
        let tx = stack.coordinator.reconcile_one(tx.id).await.unwrap();
        assert_eq!(tx.state, TransactionState::Cancelled);
        assert!(stack.coordinator.asset(asset.id).unwrap().available);
    }
    assert_eq!(stack.coordinator.transactions(0, 100).unwrap().len(), 5);
}

// ---------------------------------------------------------------------
// Gated ledger
// ---------------------------------------------------------------------

/// Blocks callers while closed and counts how many are parked.
struct Gate {
    open: watch::Sender<bool>,
    waiting: AtomicUsize,
}

impl Gate {
    fn new() -> Self {
        Self {
            open: watch::channel(true).0,
            waiting: AtomicUsize::new(0),
        }
    }

    fn set(&self, open: bool) {
        self.open.send_replace(open);
    }

    fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    async fn pass(&self) {
        let mut open = self.open.subscribe();
        if *open.borrow_and_update() {
            return;
        }
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let _ = open.wait_for(|open| *open).await;
        self.waiting.fetch_sub(1, Ordering::SeqCst);
    }

    async fn until_waiting(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.waiting() < n {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("callers reached the gate");
    }
}

/// A simulated ledger whose receipt polls, `Complete` submissions and
/// `Cancel` estimates can each be held.
struct GatedNode {
    sim: Arc<SimulatedLedger>,
    polls: Gate,
    complete_submits: Gate,
    cancel_estimates: Gate,
}

#[async_trait]
impl LedgerNode for GatedNode {
    async fn estimate_cost(&self, from: WalletAddress, call: &LedgerCall) -> Result<Cost> {
        if matches!(call, LedgerCall::Cancel { .. }) {
            self.cancel_estimates.pass().await;
        }
        self.sim.estimate_cost(from, call).await
    }

    async fn next_nonce(&self, address: WalletAddress) -> Result<u64> {
        self.sim.next_nonce(address).await
    }

    async fn submit(&self, call: &SignedCall) -> Result<TxHash> {
        if matches!(call.unsigned.call, LedgerCall::Complete { .. }) {
            self.complete_submits.pass().await;
        }
        self.sim.submit(call).await
    }

    async fn receipt(&self, hash: &TxHash) -> Result<Option<LedgerReceipt>> {
        self.polls.pass().await;
        self.sim.receipt(hash).await
    }
}

struct Rig {
    sim: Arc<SimulatedLedger>,
    node: Arc<GatedNode>,
    store: Arc<MemoryStore>,
    client: Arc<LedgerClient>,
    machine: Arc<EscrowStateMachine>,
    config: ReconcileConfig,
    seller: WalletAddress,
    buyer: WalletAddress,
}

fn rig(config: ReconcileConfig) -> Rig {
    let sim = Arc::new(SimulatedLedger::new());
    let node = Arc::new(GatedNode {
        sim: sim.clone(),
        polls: Gate::new(),
        complete_submits: Gate::new(),
        cancel_estimates: Gate::new(),
    });
    let keyring = Arc::new(Keyring::new());
    let seller = keyring.generate().unwrap();
    let buyer = keyring.generate().unwrap();
    let store = Arc::new(MemoryStore::new());
    let client = Arc::new(LedgerClient::new(node.clone(), keyring, LedgerConfig::default()));
    let machine = Arc::new(EscrowStateMachine::new(store.clone(), client.clone(), config.clone()));
    Rig {
        sim,
        node,
        store,
        client,
        machine,
        config,
        seller,
        buyer,
    }
}

impl Rig {
    fn recovery(&self, stale_unsent_ms: u64) -> RecoveryScan {
        RecoveryScan::new(
            self.store.clone(),
            self.machine.clone(),
            RecoveryConfig {
                stale_unsent_ms,
                ..RecoveryConfig::default()
            },
        )
    }

    /// Register and list `count` assets, mined in one block.
    async fn listed_assets(&self, count: usize) -> Vec<AssetId> {
        let mut ids = Vec::new();
        for i in 0..count {
            let asset = self
                .store
                .insert_asset(NewAsset::new(format!("cat-{i}"), self.seller, Wei(10)))
                .unwrap();
            let call = LedgerCall::ListAsset {
                asset_id: asset.id,
                price: Wei(10),
            };
            let cost = self.client.estimate_cost(self.seller, &call).await.unwrap();
            self.client.send(self.seller, &call, cost).await.unwrap();
            ids.push(asset.id);
        }
        self.sim.mine();
        ids
    }

    async fn submitted_purchase(&self, asset_id: AssetId) -> Transaction {
        let tx = self
            .machine
            .create(TransactionDraft {
                asset_id,
                buyer: self.buyer,
            })
            .unwrap();
        self.machine.submit(tx.id).await.unwrap()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sweeps_poll_each_row_once_per_round() {
    const ROWS: usize = 12;
    const WORKERS: usize = 4;
    let rig = rig(ReconcileConfig {
        min_age_ms: 0,
        max_poll_attempts: 100,
        batch_size: ROWS / WORKERS,
        ..ReconcileConfig::default()
    });
    let mut ids = Vec::new();
    for asset_id in rig.listed_assets(ROWS).await {
        ids.push(rig.submitted_purchase(asset_id).await.id);
    }
    let reconciler = Arc::new(ReconciliationLoop::new(
        rig.store.clone(),
        rig.machine.clone(),
        rig.recovery(60_000),
        rig.config.clone(),
    ));

    for round in 1..=2u32 {
        rig.node.polls.set(false);
        let handles: Vec<_> = (0..WORKERS)
            .map(|_| {
                let reconciler = Arc::clone(&reconciler);
                tokio::spawn(async move { reconciler.sweep_once(WorkerId::new()).await })
            })
            .collect();

        // Every worker holds its claims before any of them can release one.
        rig.node.polls.until_waiting(WORKERS).await;
        assert!(
            ids.iter()
                .all(|id| rig.store.transaction(*id).unwrap().unwrap().claim.is_some())
        );
        rig.node.polls.set(true);

        let mut claimed = 0;
        for handle in handles {
            let report = handle.await.unwrap().unwrap();
            assert_eq!(report.errors, 0);
            claimed += report.claimed;
        }
        assert_eq!(claimed, ROWS, "round {round}");
        for id in &ids {
            let tx = rig.store.transaction(*id).unwrap().unwrap();
            assert_eq!(tx.poll_attempts, round, "round {round}: {id}");
            assert_eq!(tx.state, TransactionState::Submitted);
            assert!(tx.claim.is_none());
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn superseded_finalize_does_not_record_its_hash() {
    let rig = rig(ReconcileConfig {
        min_age_ms: 0,
        ..ReconcileConfig::default()
    });
    let assets = rig.listed_assets(1).await;
    let tx = rig.submitted_purchase(assets[0]).await;
    rig.sim.mine();
    let tx = rig.machine.reconcile(tx.id).await.unwrap();
    assert_eq!(tx.state, TransactionState::Confirmed);
    let escrow_id = tx.escrow_id.unwrap();
    let id = tx.id;

    // The complete call is reserved and estimated, then held at submission.
    rig.node.complete_submits.set(false);
    let completer = {
        let machine = rig.machine.clone();
        tokio::spawn(async move { machine.finalize(id, Outcome::Complete).await })
    };
    rig.node.complete_submits.until_waiting(1).await;

    // Recovery takes the hashless reservation back to CONFIRMED.
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(rig.recovery(1).run_once().unwrap().rolled_back, 1);

    // A cancel reserves the same row and is held at estimation, so the row
    // is SUBMITTED without a hash again.
    rig.node.cancel_estimates.set(false);
    let canceller = {
        let machine = rig.machine.clone();
        tokio::spawn(async move { machine.finalize(id, Outcome::Cancel).await })
    };
    rig.node.cancel_estimates.until_waiting(1).await;

    rig.node.complete_submits.set(true);
    let row = completer.await.unwrap().unwrap();
    assert_eq!(row.state, TransactionState::Submitted);
    assert_eq!(row.pending_call, CallKind::Cancel);
    assert_eq!(row.tx_hash, None);

    rig.sim.mine();
    assert_eq!(rig.sim.escrow(escrow_id).unwrap().status, EscrowStatus::Completed);

    rig.node.cancel_estimates.set(true);
    let row = canceller.await.unwrap().unwrap();
    assert_eq!(row.state, TransactionState::Confirmed);
    assert!(matches!(row.last_error, Some(FailureReason::Estimation { .. })));
    assert!(!rig.store.asset(row.asset_id).unwrap().unwrap().available);
    assert_eq!(rig.sim.escrow(escrow_id).unwrap().status, EscrowStatus::Completed);
}
