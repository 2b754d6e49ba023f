//! # Escrow State Machine
//!
//! Owns every mutation of a transaction row. Each step reads the row, talks
//! to the ledger if it must, then writes through a compare-and-update
//! guarded by the state and hash it read. A writer whose view went stale
//! loses the compare and re-reads; it never overwrites.
//!
//! ```text
//! create ──▶ CREATED ──submit──▶ SUBMITTED(purchase) ──reconcile──▶ CONFIRMED
//!                │                     │                               │
//!                │ estimate/send fail  │ revert / malformed / timeout  │ finalize
//!                ▼                     ▼                               ▼
//!              FAILED ◀──────────── FAILED              SUBMITTED(complete|cancel)
//!                                                              │ reconcile
//!                                                              ▼
//!                                                   COMPLETED | CANCELLED
//! ```
//!
//! Leaving the active states always ends with an availability release, and
//! the release only takes effect once no active row references the asset.
//!
//! A cancel that arrives while the purchase is in flight is recorded on the
//! row and acted on by `reconcile`: a confirmed purchase is refunded through
//! an on-ledger cancel, and a purchase that reverts or times out ends
//! `CANCELLED` instead of `FAILED`.

use std::sync::Arc;

use chrono::Utc;
use escrowd_ledger::LedgerClient;
use escrowd_store::EscrowStore;
use escrowd_types::{
    CallKind, EscrowError, EscrowId, FailureReason, LedgerEvent, LedgerReceipt, Outcome,
    PollStatus, ReconcileConfig, Result, Transaction, TransactionDraft, TransactionId,
    TransactionState, TransactionUpdate, TxHash,
};

use crate::AvailabilityLock;

/// Drives rows through their lifecycle. Every write goes through the
/// store's guarded compare-and-update, so any number of callers may share
/// one machine.
pub struct EscrowStateMachine {
    store: Arc<dyn EscrowStore>,
    ledger: Arc<LedgerClient>,
    lock: AvailabilityLock,
    config: ReconcileConfig,
}

impl EscrowStateMachine {
    #[must_use]
    pub fn new(
        store: Arc<dyn EscrowStore>,
        ledger: Arc<LedgerClient>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            lock: AvailabilityLock::new(Arc::clone(&store)),
            store,
            ledger,
            config,
        }
    }

    #[must_use]
    pub fn lock(&self) -> &AvailabilityLock {
        &self.lock
    }

    fn load(&self, id: TransactionId) -> Result<Transaction> {
        self.store
            .transaction(id)?
            .ok_or(EscrowError::TransactionNotFound(id))
    }

    // -----------------------------------------------------------------
    // create / submit
    // -----------------------------------------------------------------

    /// Insert a `Created` transaction, taking the asset's lock in the same
    /// store step. Seller and price are copied from the asset.
    ///
    /// # Errors
    /// `AssetNotFound`, `AssetUnavailable`, `SelfPurchase`.
    pub fn create(&self, draft: TransactionDraft) -> Result<Transaction> {
        let tx = self.lock.acquire_for(draft)?;
        tracing::info!(tx = %tx.id, asset = %tx.asset_id, price = %tx.price, state = %tx.state, "transaction created");
        Ok(tx)
    }

    /// Estimate, sign and send the purchase of a `Created` transaction.
    /// Returns once the ledger accepted the call (`Submitted`) or the
    /// attempt was rolled back (`Failed`, lock released, reason in
    /// `last_error`). Never waits for confirmation.
    ///
    /// # Errors
    /// `InvalidState` unless the row is `Created`; store failures.
    pub async fn submit(&self, id: TransactionId) -> Result<Transaction> {
        let tx = self.load(id)?;
        if tx.state != TransactionState::Created {
            return Err(EscrowError::InvalidState {
                id,
                expected: "CREATED",
                actual: tx.state,
            });
        }

        let call = tx.ledger_call()?;
        let signer = tx.signer();
        let cost = match self.ledger.estimate_cost(signer, &call).await {
            Ok(cost) => cost,
            Err(e) => return self.abort_purchase(&tx, failure_before_acceptance(e)),
        };
        let hash = match self.ledger.send(signer, &call, cost).await {
            Ok(hash) => hash,
            Err(e) => return self.abort_purchase(&tx, failure_before_acceptance(e)),
        };

        let update = TransactionUpdate::transition(TransactionState::Submitted).with_tx_hash(hash);
        match self.store.compare_and_update(id, tx.guard(), &update)? {
            Some(tx) => {
                tracing::info!(tx = %id, call = %tx.pending_call, hash = %hash.short(), "transaction submitted");
                Ok(tx)
            }
            None => {
                let current = self.load(id)?;
                tracing::error!(
                    tx = %id,
                    hash = %hash,
                    state = %current.state,
                    escalate = true,
                    "purchase accepted by the ledger but the row moved before its hash was recorded"
                );
                Ok(current)
            }
        }
    }

    fn abort_purchase(&self, tx: &Transaction, reason: FailureReason) -> Result<Transaction> {
        let update = TransactionUpdate::transition(TransactionState::Failed).with_error(reason.clone());
        let Some(failed) = self.store.compare_and_update(tx.id, tx.guard(), &update)? else {
            return self.load(tx.id);
        };
        tracing::warn!(tx = %tx.id, asset = %tx.asset_id, %reason, "purchase aborted before acceptance");
        self.lock.release(tx.asset_id)?;
        Ok(failed)
    }

    // -----------------------------------------------------------------
    // reconcile
    // -----------------------------------------------------------------

    /// Poll the ledger for the recorded hash and fold the outcome in.
    ///
    /// - Terminal rows, and rows with nothing in flight, are returned as is.
    /// - No receipt: the attempt is counted. Once the budget is spent, one
    ///   final poll runs before the row fails with `ReconciliationTimeout`.
    /// - Receipt: see [`EscrowStateMachine::apply_receipt`].
    /// - A `Confirmed` row with a deferred cancel gets its cancel sent.
    ///
    /// Safe to call repeatedly and concurrently; only one caller's write
    /// lands for a given hash.
    ///
    /// # Errors
    /// `TransactionNotFound`; `LedgerUnavailable` when the node cannot be
    /// polled (the attempt is not counted); store failures.
    pub async fn reconcile(&self, id: TransactionId) -> Result<Transaction> {
        let tx = self.poll_in_flight(id).await?;
        if tx.state == TransactionState::Confirmed && tx.cancel_requested {
            tracing::info!(tx = %id, escrow = ?tx.escrow_id, "purchase settled; sending deferred cancel");
            return match self.finalize(id, Outcome::Cancel).await {
                Err(EscrowError::InvalidState { .. }) => self.load(id),
                other => other,
            };
        }
        Ok(tx)
    }

    async fn poll_in_flight(&self, id: TransactionId) -> Result<Transaction> {
        let tx = self.load(id)?;
        let Some(hash) = tx.tx_hash.filter(|_| tx.state == TransactionState::Submitted) else {
            tracing::trace!(tx = %id, state = %tx.state, "nothing in flight");
            return Ok(tx);
        };

        match self.ledger.poll(&hash).await? {
            PollStatus::Receipt(receipt) => self.apply_receipt(&tx, hash, &receipt),
            PollStatus::Pending => {
                let Some(tx) = self.store.record_poll_attempt(id, tx.guard())? else {
                    return self.load(id);
                };
                tracing::debug!(tx = %id, hash = %hash.short(), attempts = tx.poll_attempts, "receipt pending");
                if !self.budget_spent(&tx) {
                    return Ok(tx);
                }
                match self.ledger.poll(&hash).await? {
                    PollStatus::Receipt(receipt) => self.apply_receipt(&tx, hash, &receipt),
                    PollStatus::Pending => self.time_out(&tx, hash),
                }
            }
        }
    }

    fn budget_spent(&self, tx: &Transaction) -> bool {
        if tx.poll_attempts >= self.config.max_poll_attempts {
            return true;
        }
        match (self.config.max_pending(), tx.submitted_at) {
            (Some(budget), Some(at)) => (Utc::now() - at).to_std().is_ok_and(|age| age >= budget),
            _ => false,
        }
    }

    fn time_out(&self, tx: &Transaction, hash: TxHash) -> Result<Transaction> {
        let reason = FailureReason::ReconciliationTimeout {
            attempts: tx.poll_attempts,
        };
        let update = TransactionUpdate::transition(unsettled_state(tx)).with_error(reason);
        let Some(failed) = self.store.compare_and_update(tx.id, tx.guard(), &update)? else {
            return self.load(tx.id);
        };
        tracing::error!(
            tx = %tx.id,
            hash = %hash,
            call = %tx.pending_call,
            attempts = tx.poll_attempts,
            escalate = true,
            "no receipt after final poll; the call may still land"
        );
        self.lock.release(tx.asset_id)?;
        Ok(failed)
    }

    /// Fold a receipt for `hash` into the row.
    ///
    /// - Reverted: `Failed` (`Cancelled` for a purchase with a deferred
    ///   cancel), lock released.
    /// - Purchase succeeded: `Confirmed` with the ledger's escrow id.
    /// - Complete succeeded: ownership moves to the buyer, `Completed`.
    /// - Cancel succeeded: `Cancelled`, lock released.
    /// - Succeeded but the events do not prove the expected outcome:
    ///   `Failed` as a malformed receipt, lock released, escalated.
    fn apply_receipt(
        &self,
        tx: &Transaction,
        hash: TxHash,
        receipt: &LedgerReceipt,
    ) -> Result<Transaction> {
        if !receipt.success {
            let reason = FailureReason::Reverted {
                call: tx.pending_call,
            };
            tracing::warn!(tx = %tx.id, hash = %hash.short(), call = %tx.pending_call, block = receipt.block_number, "call reverted");
            return self.finish(tx, unsettled_state(tx), Some(reason));
        }

        let outcome = match expected_event(tx, receipt) {
            Ok(outcome) => outcome,
            Err(reason) => {
                tracing::error!(tx = %tx.id, hash = %hash, %reason, escalate = true, "receipt succeeded but did not decode");
                return self.finish(
                    tx,
                    TransactionState::Failed,
                    Some(FailureReason::MalformedReceipt { reason }),
                );
            }
        };

        match outcome {
            Settled::Purchased(escrow_id) => {
                let update = TransactionUpdate::transition(TransactionState::Confirmed)
                    .with_escrow_id(escrow_id)
                    .clearing_error();
                match self.store.compare_and_update(tx.id, tx.guard(), &update)? {
                    Some(confirmed) => {
                        tracing::info!(tx = %tx.id, escrow = %escrow_id, block = receipt.block_number, "purchase confirmed");
                        Ok(confirmed)
                    }
                    None => self.load(tx.id),
                }
            }
            Settled::Completed => {
                self.store.transfer_ownership(tx.asset_id, tx.buyer)?;
                self.finish(tx, TransactionState::Completed, None)
            }
            Settled::Cancelled => self.finish(tx, TransactionState::Cancelled, None),
        }
    }

    /// Move to a terminal state, then release the asset.
    fn finish(
        &self,
        tx: &Transaction,
        state: TransactionState,
        reason: Option<FailureReason>,
    ) -> Result<Transaction> {
        let mut update = TransactionUpdate::transition(state);
        if let Some(reason) = reason {
            update = update.with_error(reason);
        }
        let Some(done) = self.store.compare_and_update(tx.id, tx.guard(), &update)? else {
            return self.load(tx.id);
        };
        tracing::info!(tx = %done.id, asset = %done.asset_id, state = %done.state, "transaction finished");
        self.lock.release(done.asset_id)?;
        Ok(done)
    }

    // -----------------------------------------------------------------
    // finalize / cancel
    // -----------------------------------------------------------------

    /// Settle a `Confirmed` escrow: `complete` pays the seller, `cancel`
    /// refunds the buyer.
    ///
    /// The row leaves `Confirmed` before anything is sent, so of two racing
    /// finalizers exactly one proceeds and the other gets `InvalidState`.
    /// Returns the `Submitted` row once the ledger accepted the call. If
    /// estimation or sending fails, the row goes back to `Confirmed` with
    /// the reason in `last_error` and is returned as such.
    ///
    /// # Errors
    /// `InvalidState` unless the row is `Confirmed`, or for `Complete` once
    /// a cancel was requested; `TransactionNotFound`.
    pub async fn finalize(&self, id: TransactionId, outcome: Outcome) -> Result<Transaction> {
        let tx = self.load(id)?;
        if tx.state != TransactionState::Confirmed {
            return Err(EscrowError::InvalidState {
                id,
                expected: "CONFIRMED",
                actual: tx.state,
            });
        }
        if outcome == Outcome::Complete && tx.cancel_requested {
            return Err(EscrowError::InvalidState {
                id,
                expected: "CONFIRMED without a pending cancel",
                actual: tx.state,
            });
        }

        let mut projected = tx.clone();
        projected.pending_call = outcome.call_kind();
        let call = projected.ledger_call()?;
        let signer = projected.signer();

        let reserve = TransactionUpdate::transition(TransactionState::Submitted)
            .with_pending_call(outcome.call_kind())
            .clearing_tx_hash()
            .clearing_error();
        let Some(reserved) = self.store.compare_and_update(id, tx.guard(), &reserve)? else {
            let current = self.load(id)?;
            return Err(EscrowError::InvalidState {
                id,
                expected: "CONFIRMED",
                actual: current.state,
            });
        };
        tracing::info!(tx = %id, call = %reserved.pending_call, "finalize reserved");

        let cost = match self.ledger.estimate_cost(signer, &call).await {
            Ok(cost) => cost,
            Err(e) => return self.roll_back_finalize(&reserved, failure_before_acceptance(e)),
        };
        let hash = match self.ledger.send(signer, &call, cost).await {
            Ok(hash) => hash,
            Err(e) => return self.roll_back_finalize(&reserved, failure_before_acceptance(e)),
        };

        let update = TransactionUpdate::transition(TransactionState::Submitted).with_tx_hash(hash);
        match self.store.compare_and_update(id, reserved.guard(), &update)? {
            Some(tx) => {
                tracing::info!(tx = %id, call = %tx.pending_call, hash = %hash.short(), "transaction submitted");
                Ok(tx)
            }
            None => {
                let current = self.load(id)?;
                tracing::error!(
                    tx = %id,
                    hash = %hash,
                    state = %current.state,
                    escalate = true,
                    "finalize accepted by the ledger but the row moved before its hash was recorded"
                );
                Ok(current)
            }
        }
    }

    fn roll_back_finalize(&self, reserved: &Transaction, reason: FailureReason) -> Result<Transaction> {
        let update = TransactionUpdate::transition(TransactionState::Confirmed).with_error(reason.clone());
        let Some(tx) = self.store.compare_and_update(reserved.id, reserved.guard(), &update)? else {
            return self.load(reserved.id);
        };
        tracing::warn!(tx = %tx.id, call = %reserved.pending_call, %reason, "finalize not sent; back to CONFIRMED");
        Ok(tx)
    }

    /// Call off a sale.
    ///
    /// - `Created`: nothing is on the ledger yet; cancelled locally and the
    ///   asset released.
    /// - `Submitted` purchase: the request is recorded and the row returned
    ///   as is; `reconcile` carries it out once the purchase settles.
    /// - `Confirmed`: refunded on-ledger through
    ///   [`EscrowStateMachine::finalize`].
    ///
    /// # Errors
    /// `InvalidState` while a complete or cancel call is in flight or once
    /// terminal.
    pub async fn cancel(&self, id: TransactionId) -> Result<Transaction> {
        loop {
            let tx = self.load(id)?;
            match tx.state {
                TransactionState::Confirmed => return self.finalize(id, Outcome::Cancel).await,
                TransactionState::Created => {
                    let update = TransactionUpdate::transition(TransactionState::Cancelled);
                    if let Some(cancelled) = self.store.compare_and_update(id, tx.guard(), &update)? {
                        tracing::info!(tx = %id, asset = %tx.asset_id, "cancelled before submission");
                        self.lock.release(tx.asset_id)?;
                        return Ok(cancelled);
                    }
                }
                TransactionState::Submitted if tx.pending_call == CallKind::Purchase => {
                    if tx.cancel_requested {
                        return Ok(tx);
                    }
                    let update = TransactionUpdate::requesting_cancel();
                    if let Some(marked) = self.store.compare_and_update(id, tx.guard(), &update)? {
                        tracing::info!(tx = %id, asset = %tx.asset_id, "cancel deferred until the purchase settles");
                        return Ok(marked);
                    }
                }
                actual => {
                    return Err(EscrowError::InvalidState {
                        id,
                        expected: "CREATED, CONFIRMED or a SUBMITTED purchase",
                        actual,
                    });
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // recovery hooks
    // -----------------------------------------------------------------

    /// Resolve a row that never recorded a hash: a `Created` row fails, a
    /// reserved finalize goes back to `Confirmed`. Both are escalated since
    /// the call may have been accepted just before a crash.
    ///
    /// # Errors
    /// Store failures.
    pub fn abandon_unsent(&self, tx: &Transaction) -> Result<Option<Transaction>> {
        let (state, label) = match (tx.state, tx.tx_hash) {
            (TransactionState::Created, _) => (TransactionState::Failed, "purchase"),
            (TransactionState::Submitted, None) => (TransactionState::Confirmed, "finalize"),
            _ => return Ok(None),
        };
        let update = TransactionUpdate::transition(state).with_error(FailureReason::Abandoned);
        let Some(done) = self.store.compare_and_update(tx.id, tx.guard(), &update)? else {
            return Ok(None);
        };
        tracing::error!(
            tx = %tx.id,
            asset = %tx.asset_id,
            call = label,
            state = %done.state,
            escalate = true,
            "abandoned a row that never recorded a hash"
        );
        if done.is_terminal() {
            self.lock.release(done.asset_id)?;
        }
        Ok(Some(done))
    }
}

/// Where a purchase that never settled ends up.
fn unsettled_state(tx: &Transaction) -> TransactionState {
    if tx.cancel_requested && tx.pending_call == CallKind::Purchase {
        TransactionState::Cancelled
    } else {
        TransactionState::Failed
    }
}

/// What a successful receipt proved.
enum Settled {
    Purchased(EscrowId),
    Completed,
    Cancelled,
}

/// Find the event proving the pending call's effect. The `Err` string
/// describes why the receipt is unusable.
fn expected_event(tx: &Transaction, receipt: &LedgerReceipt) -> std::result::Result<Settled, String> {
    let events = receipt.events().map_err(|e| e.to_string())?;
    let found = events.iter().find_map(|event| match (tx.pending_call, *event) {
        (
            CallKind::Purchase,
            LedgerEvent::AssetPurchased {
                escrow_id,
                asset_id,
                buyer,
                ..
            },
        ) if asset_id == tx.asset_id && buyer == tx.buyer => Some(Settled::Purchased(escrow_id)),
        (CallKind::Complete, LedgerEvent::TransactionCompleted { escrow_id })
            if Some(escrow_id) == tx.escrow_id =>
        {
            Some(Settled::Completed)
        }
        (CallKind::Cancel, LedgerEvent::TransactionCancelled { escrow_id })
            if Some(escrow_id) == tx.escrow_id =>
        {
            Some(Settled::Cancelled)
        }
        _ => None,
    });
    found.ok_or_else(|| format!("no event for the {} call of {}", tx.pending_call, tx.id))
}

fn failure_before_acceptance(e: EscrowError) -> FailureReason {
    match e {
        EscrowError::EstimationError { reason } => FailureReason::Estimation { reason },
        other => FailureReason::Send {
            reason: other.to_string(),
        },
    }
}
