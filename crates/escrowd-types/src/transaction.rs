//! # Transaction: one escrowed sale of one asset
//!
//! ## State Machine
//!
//! ```text
//!   ┌─────────┐ send ok  ┌───────────┐ receipt ok ┌───────────┐
//!   │ CREATED ├─────────▶│ SUBMITTED ├───────────▶│ CONFIRMED │
//!   └──┬───┬──┘          └─┬───┬───┬─┘            └─────┬─────┘
//!      │   │ send failed   │   │   │   finalize          │
//!      │   ▼               │   │   ◀────────────────────┘
//!      │ ┌────────┐ revert │   │ receipt ok (complete / cancel call)
//!      │ │ FAILED │◀───────┘   ▼
//!      │ └────────┘        ┌───────────┐   ┌───────────┐
//!      └──── cancel ──────▶│ CANCELLED │   │ COMPLETED │
//!                          └───────────┘   └───────────┘
//! ```
//!
//! `SUBMITTED` with a `Complete`/`Cancel` pending call is the *finalizing*
//! sub-state. `COMPLETED`, `CANCELLED` and `FAILED` are terminal and retained
//! forever as the audit trail.
//!
//! Every mutation goes through a compare-and-update: a [`TransactionGuard`]
//! (expected state, external hash and row version) plus a
//! [`TransactionUpdate`]. A stale writer, such as a reconciler holding an old
//! hash or a finalizer whose reservation was rolled back and re-taken,
//! simply loses the compare.
//!
//! A cancel requested while the purchase is in flight is recorded in
//! `cancel_requested` and carried out once the purchase settles.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    AssetId, EscrowError, EscrowId, LedgerCall, Result, TransactionId, TxHash, WalletAddress,
    Wei, WorkerId,
};

/// The lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionState {
    /// Record inserted and asset locked; nothing sent to the ledger yet.
    Created,
    /// A call was accepted into the ledger's pending pool; awaiting its receipt.
    Submitted,
    /// The purchase landed on-ledger; funds sit in escrow.
    Confirmed,
    /// The escrow paid out to the seller; the asset belongs to the buyer.
    Completed,
    /// The sale was called off; the asset is available again.
    Cancelled,
    /// The sale could not be carried out; the asset is available again.
    Failed,
}

impl TransactionState {
    /// No transition ever leaves a terminal state.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    /// Active transactions hold the asset's availability lock.
    #[must_use]
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// Can a transaction move from this state to `target`?
    #[must_use]
    pub fn can_transition_to(self, target: Self) -> bool {
        matches!(
            (self, target),
            (
                Self::Created,
                Self::Submitted | Self::Failed | Self::Cancelled
            ) | (
                Self::Submitted,
                Self::Confirmed | Self::Completed | Self::Cancelled | Self::Failed
            ) | (
                Self::Confirmed,
                Self::Submitted | Self::Completed | Self::Cancelled
            )
        )
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "CREATED"),
            Self::Submitted => write!(f, "SUBMITTED"),
            Self::Confirmed => write!(f, "CONFIRMED"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Cancelled => write!(f, "CANCELLED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Which escrow contract call the current (or most recent) submission is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallKind {
    /// Buyer pays the price into a new escrow.
    Purchase,
    /// Buyer releases the escrow to the seller.
    Complete,
    /// Seller refunds the escrow to the buyer.
    Cancel,
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Purchase => write!(f, "purchase"),
            Self::Complete => write!(f, "complete"),
            Self::Cancel => write!(f, "cancel"),
        }
    }
}

/// How a confirmed escrow is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    Complete,
    Cancel,
}

impl Outcome {
    #[must_use]
    pub fn call_kind(self) -> CallKind {
        match self {
            Self::Complete => CallKind::Complete,
            Self::Cancel => CallKind::Cancel,
        }
    }
}

/// Why the last submission of a transaction did not go through.
///
/// Recorded on the row so that a timeout (the call may yet land) stays
/// distinguishable from a revert (the call definitely did not).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// Pre-flight estimation said the call would revert; nothing was sent.
    Estimation { reason: String },
    /// The node was unreachable or refused the call.
    Send { reason: String },
    /// The call was mined and reverted.
    Reverted { call: CallKind },
    /// The receipt reported success but its events did not decode to the
    /// expected outcome.
    MalformedReceipt { reason: String },
    /// No receipt within the attempt budget, including the final poll.
    ReconciliationTimeout { attempts: u32 },
    /// Found without a recorded hash long after it was last touched; the
    /// send never completed, or completed without being recorded.
    Abandoned,
}

impl FailureReason {
    /// Cases where the on-ledger outcome is uncertain and an operator must look.
    #[must_use]
    pub fn needs_escalation(&self) -> bool {
        matches!(
            self,
            Self::ReconciliationTimeout { .. } | Self::MalformedReceipt { .. } | Self::Abandoned
        )
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Estimation { reason } => write!(f, "estimation failed: {reason}"),
            Self::Send { reason } => write!(f, "send failed: {reason}"),
            Self::Reverted { call } => write!(f, "{call} call reverted"),
            Self::MalformedReceipt { reason } => write!(f, "malformed receipt: {reason}"),
            Self::ReconciliationTimeout { attempts } => {
                write!(f, "no receipt after {attempts} polls")
            }
            Self::Abandoned => write!(f, "abandoned before a hash was recorded"),
        }
    }
}

/// A reconciliation worker's lease on a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub worker: WorkerId,
    pub expires_at: DateTime<Utc>,
}

impl Claim {
    #[must_use]
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// An escrowed sale of one asset from seller to buyer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub asset_id: AssetId,
    pub buyer: WalletAddress,
    pub seller: WalletAddress,
    /// Copied from the asset at creation; later price edits never reach it.
    pub price: Wei,
    pub state: TransactionState,
    pub pending_call: CallKind,
    /// Hash of the most recent accepted submission.
    pub tx_hash: Option<TxHash>,
    /// Assigned by the ledger once the purchase is confirmed.
    pub escrow_id: Option<EscrowId>,
    /// Polls without a receipt for the current `tx_hash`.
    pub poll_attempts: u32,
    pub last_error: Option<FailureReason>,
    /// A cooperative cancel arrived while the purchase was in flight.
    #[serde(default)]
    pub cancel_requested: bool,
    pub claim: Option<Claim>,
    /// Bumped by every write to the row; claim leases do not count.
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
}

impl Transaction {
    /// Build a fresh `Created` record. The store assigns `id`.
    #[must_use]
    pub fn new(
        id: TransactionId,
        asset_id: AssetId,
        buyer: WalletAddress,
        seller: WalletAddress,
        price: Wei,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            asset_id,
            buyer,
            seller,
            price,
            state: TransactionState::Created,
            pending_call: CallKind::Purchase,
            tx_hash: None,
            escrow_id: None,
            poll_attempts: 0,
            last_error: None,
            cancel_requested: false,
            claim: None,
            version: 0,
            created_at: now,
            updated_at: now,
            submitted_at: None,
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// The compare half of a compare-and-update against this snapshot.
    #[must_use]
    pub fn guard(&self) -> TransactionGuard {
        TransactionGuard {
            state: self.state,
            tx_hash: self.tx_hash,
            version: self.version,
        }
    }

    /// The party whose key signs the pending call: the buyer pays and
    /// releases, the seller refunds.
    #[must_use]
    pub fn signer(&self) -> WalletAddress {
        match self.pending_call {
            CallKind::Purchase | CallKind::Complete => self.buyer,
            CallKind::Cancel => self.seller,
        }
    }

    /// The escrow contract call for the pending submission.
    ///
    /// # Errors
    /// Returns `Internal` for a complete/cancel call without an escrow id,
    /// which only a confirmed purchase can provide.
    pub fn ledger_call(&self) -> Result<LedgerCall> {
        match self.pending_call {
            CallKind::Purchase => Ok(LedgerCall::Purchase {
                asset_id: self.asset_id,
                price: self.price,
            }),
            CallKind::Complete => Ok(LedgerCall::Complete {
                escrow_id: self.require_escrow_id()?,
            }),
            CallKind::Cancel => Ok(LedgerCall::Cancel {
                escrow_id: self.require_escrow_id()?,
            }),
        }
    }

    fn require_escrow_id(&self) -> Result<EscrowId> {
        self.escrow_id.ok_or_else(|| {
            EscrowError::Internal(format!(
                "{} has a {} call pending but no escrow id",
                self.id, self.pending_call
            ))
        })
    }
}

/// Fields supplied by the caller of `create`. Seller and price are copied
/// from the asset row inside the same atomic step that locks it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionDraft {
    pub asset_id: AssetId,
    pub buyer: WalletAddress,
}

/// Expected current values for a compare-and-update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionGuard {
    pub state: TransactionState,
    pub tx_hash: Option<TxHash>,
    pub version: u64,
}

impl TransactionGuard {
    /// State and hash alone repeat (a rolled-back reservation looks like a
    /// fresh one), so the version decides.
    #[must_use]
    pub fn matches(&self, tx: &Transaction) -> bool {
        tx.version == self.version && tx.state == self.state && tx.tx_hash == self.tx_hash
    }
}

/// The set half of a compare-and-update. Unset fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionUpdate {
    pub state: Option<TransactionState>,
    pub pending_call: Option<CallKind>,
    pub tx_hash: Option<TxHash>,
    pub clear_tx_hash: bool,
    pub escrow_id: Option<EscrowId>,
    pub last_error: Option<FailureReason>,
    pub clear_last_error: bool,
    pub request_cancel: bool,
}

impl TransactionUpdate {
    /// An update that moves the row to `state`.
    #[must_use]
    pub fn transition(state: TransactionState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_pending_call(mut self, call: CallKind) -> Self {
        self.pending_call = Some(call);
        self
    }

    #[must_use]
    pub fn with_tx_hash(mut self, hash: TxHash) -> Self {
        self.tx_hash = Some(hash);
        self
    }

    #[must_use]
    pub fn clearing_tx_hash(mut self) -> Self {
        self.clear_tx_hash = true;
        self
    }

    #[must_use]
    pub fn with_escrow_id(mut self, escrow_id: EscrowId) -> Self {
        self.escrow_id = Some(escrow_id);
        self
    }

    #[must_use]
    pub fn with_error(mut self, reason: FailureReason) -> Self {
        self.last_error = Some(reason);
        self
    }

    #[must_use]
    pub fn clearing_error(mut self) -> Self {
        self.clear_last_error = true;
        self
    }

    /// Leaves the state alone and marks a deferred cancel.
    #[must_use]
    pub fn requesting_cancel() -> Self {
        Self {
            request_cancel: true,
            ..Self::default()
        }
    }

    /// Apply to `tx`. A new external hash resets the poll counter and stamps
    /// `submitted_at`. The row version always moves forward.
    ///
    /// # Errors
    /// Returns `InvalidState` if the state change is not a legal transition.
    pub fn apply(&self, tx: &mut Transaction, now: DateTime<Utc>) -> Result<()> {
        if let Some(target) = self.state {
            if target != tx.state && !tx.state.can_transition_to(target) {
                return Err(EscrowError::InvalidState {
                    id: tx.id,
                    expected: "a state that can reach the target",
                    actual: tx.state,
                });
            }
            tx.state = target;
        }
        if let Some(call) = self.pending_call {
            tx.pending_call = call;
        }
        if self.clear_tx_hash {
            tx.tx_hash = None;
            tx.poll_attempts = 0;
        }
        if let Some(hash) = self.tx_hash {
            tx.tx_hash = Some(hash);
            tx.poll_attempts = 0;
            tx.submitted_at = Some(now);
        }
        if let Some(escrow_id) = self.escrow_id {
            tx.escrow_id = Some(escrow_id);
        }
        if self.clear_last_error {
            tx.last_error = None;
        }
        if let Some(reason) = &self.last_error {
            tx.last_error = Some(reason.clone());
        }
        if self.request_cancel {
            tx.cancel_requested = true;
        }
        tx.version = tx.version.wrapping_add(1);
        tx.updated_at = now;
        Ok(())
    }
}

/// Dummy transactions for tests. **Never use in production.**
#[cfg(any(test, feature = "test-helpers"))]
impl Transaction {
    pub fn dummy(state: TransactionState) -> Self {
        let mut tx = Self::new(
            TransactionId(rand::random::<u32>().into()),
            AssetId(1),
            WalletAddress::random(),
            WalletAddress::random(),
            Wei(500),
            Utc::now(),
        );
        tx.state = state;
        tx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions_valid() {
        use TransactionState::*;
        assert!(Created.can_transition_to(Submitted));
        assert!(Created.can_transition_to(Failed));
        assert!(Created.can_transition_to(Cancelled));
        assert!(Submitted.can_transition_to(Confirmed));
        assert!(Submitted.can_transition_to(Failed));
        assert!(Confirmed.can_transition_to(Submitted));
        assert!(Confirmed.can_transition_to(Completed));
    }

    #[test]
    fn terminal_states_never_move() {
        use TransactionState::*;
        for terminal in [Completed, Cancelled, Failed] {
            assert!(terminal.is_terminal());
            for target in [Created, Submitted, Confirmed, Completed, Cancelled, Failed] {
                assert!(
                    !terminal.can_transition_to(target),
                    "{terminal} -> {target} must be illegal"
                );
            }
        }
    }

    #[test]
    fn nothing_returns_to_created() {
        use TransactionState::*;
        for from in [Created, Submitted, Confirmed] {
            assert!(!from.can_transition_to(Created));
        }
    }

    #[test]
    fn confirmed_cannot_fail_directly() {
        assert!(!TransactionState::Confirmed.can_transition_to(TransactionState::Failed));
    }

    #[test]
    fn guard_matches_state_and_hash() {
        let mut tx = Transaction::dummy(TransactionState::Submitted);
        tx.tx_hash = Some(TxHash([1; 32]));
        let guard = tx.guard();
        assert!(guard.matches(&tx));

        tx.tx_hash = Some(TxHash([2; 32]));
        assert!(!guard.matches(&tx), "a new hash must invalidate the guard");
    }

    #[test]
    fn rolled_back_reservation_does_not_match_old_guard() {
        let mut tx = Transaction::dummy(TransactionState::Confirmed);
        let now = Utc::now();
        let reserve = TransactionUpdate::transition(TransactionState::Submitted)
            .with_pending_call(CallKind::Complete)
            .clearing_tx_hash();
        reserve.apply(&mut tx, now).unwrap();
        let first = tx.guard();

        TransactionUpdate::transition(TransactionState::Confirmed)
            .apply(&mut tx, now)
            .unwrap();
        TransactionUpdate::transition(TransactionState::Submitted)
            .with_pending_call(CallKind::Cancel)
            .clearing_tx_hash()
            .apply(&mut tx, now)
            .unwrap();

        assert_eq!((tx.state, tx.tx_hash), (first.state, first.tx_hash));
        assert!(!first.matches(&tx));
        assert!(tx.guard().matches(&tx));
    }

    #[test]
    fn cancel_request_keeps_state() {
        let mut tx = Transaction::dummy(TransactionState::Submitted);
        TransactionUpdate::requesting_cancel()
            .apply(&mut tx, Utc::now())
            .unwrap();
        assert_eq!(tx.state, TransactionState::Submitted);
        assert!(tx.cancel_requested);
        assert_eq!(tx.version, 1);
    }

    #[test]
    fn update_with_hash_resets_attempts() {
        let mut tx = Transaction::dummy(TransactionState::Created);
        tx.poll_attempts = 4;
        let now = Utc::now();
        TransactionUpdate::transition(TransactionState::Submitted)
            .with_tx_hash(TxHash([9; 32]))
            .apply(&mut tx, now)
            .unwrap();
        assert_eq!(tx.state, TransactionState::Submitted);
        assert_eq!(tx.poll_attempts, 0);
        assert_eq!(tx.submitted_at, Some(now));
    }

    #[test]
    fn update_rejects_illegal_transition() {
        let mut tx = Transaction::dummy(TransactionState::Failed);
        let err = TransactionUpdate::transition(TransactionState::Confirmed)
            .apply(&mut tx, Utc::now())
            .unwrap_err();
        assert!(matches!(err, EscrowError::InvalidState { .. }));
        assert_eq!(tx.state, TransactionState::Failed);
    }

    #[test]
    fn signer_follows_pending_call() {
        let mut tx = Transaction::dummy(TransactionState::Confirmed);
        assert_eq!(tx.signer(), tx.buyer);
        tx.pending_call = CallKind::Complete;
        assert_eq!(tx.signer(), tx.buyer);
        tx.pending_call = CallKind::Cancel;
        assert_eq!(tx.signer(), tx.seller);
    }

    #[test]
    fn finalize_call_requires_escrow_id() {
        let mut tx = Transaction::dummy(TransactionState::Submitted);
        tx.pending_call = CallKind::Complete;
        assert!(matches!(tx.ledger_call(), Err(EscrowError::Internal(_))));

        tx.escrow_id = Some(EscrowId(12));
        assert_eq!(
            tx.ledger_call().unwrap(),
            LedgerCall::Complete {
                escrow_id: EscrowId(12)
            }
        );
    }

    #[test]
    fn timeout_needs_escalation_but_revert_does_not() {
        assert!(FailureReason::ReconciliationTimeout { attempts: 3 }.needs_escalation());
        assert!(
            !FailureReason::Reverted {
                call: CallKind::Purchase
            }
            .needs_escalation()
        );
    }

    #[test]
    fn serde_roundtrip() {
        let tx = Transaction::dummy(TransactionState::Submitted);
        let json = serde_json::to_string(&tx).unwrap();
        let back: Transaction = serde_json::from_str(&json).unwrap();
        assert_eq!(tx, back);
    }
}
