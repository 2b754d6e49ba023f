//! The durable-store interface the coordinator consumes.
//!
//! Every method is one short atomic step against the store (a single
//! statement or a single store-side transaction in a relational backend).
//! Methods are synchronous on purpose: they never suspend, so no caller can
//! hold one open across a ledger round-trip.

use chrono::{DateTime, Utc};
use escrowd_types::{
    Asset, AssetId, NewAsset, Result, Transaction, TransactionDraft, TransactionGuard,
    TransactionId, TransactionUpdate, WalletAddress, Wei, WorkerId,
};

/// Parameters of a reconciliation claim: "select rows due for a poll and
/// mark them as mine until `lease_until`", in one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimRequest {
    pub worker: WorkerId,
    /// Only rows submitted at or before this instant are due.
    pub submitted_before: DateTime<Utc>,
    /// Rows whose existing claim expired before this instant are claimable again.
    pub now: DateTime<Utc>,
    pub lease_until: DateTime<Utc>,
    pub limit: usize,
}

/// Storage operations used by the availability lock, state machine,
/// reconciliation loop and recovery scan.
pub trait EscrowStore: Send + Sync {
    // -----------------------------------------------------------------
    // Assets
    // -----------------------------------------------------------------

    /// Insert a new, available asset. The store assigns the id.
    fn insert_asset(&self, asset: NewAsset) -> Result<Asset>;

    fn asset(&self, id: AssetId) -> Result<Option<Asset>>;

    /// Change the asking price. Existing transactions keep their copied price.
    fn update_asset_price(&self, id: AssetId, price: Wei) -> Result<Asset>;

    /// Flip `available` from `expected` to `new` only if it currently equals
    /// `expected`. Returns whether the flip happened.
    fn compare_and_set_availability(&self, id: AssetId, expected: bool, new: bool) -> Result<bool>;

    /// Make the asset available again only if it is unsold and no active
    /// transaction references it. Returns whether the asset is available
    /// after the call; repeating it is harmless.
    fn release_if_idle(&self, id: AssetId) -> Result<bool>;

    /// Hand the asset to `new_owner` and mark it sold, permanently unavailable.
    fn transfer_ownership(&self, id: AssetId, new_owner: WalletAddress) -> Result<Asset>;

    /// Unsold, unavailable assets with no active transaction: locks left
    /// behind by a crash between a terminal transition and its release.
    fn locked_assets_without_active_transaction(&self) -> Result<Vec<AssetId>>;

    // -----------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------

    /// Insert a `Created` transaction and take the asset's availability lock
    /// in the same step, copying seller and price from the asset row.
    ///
    /// # Errors
    /// `AssetNotFound`, `AssetUnavailable` (already locked or sold),
    /// `SelfPurchase` (buyer owns the asset). Nothing is written on error.
    fn create_transaction_locking_asset(&self, draft: TransactionDraft) -> Result<Transaction>;

    fn transaction(&self, id: TransactionId) -> Result<Option<Transaction>>;

    /// Page through all transactions in id order.
    fn transactions(&self, offset: usize, limit: usize) -> Result<Vec<Transaction>>;

    /// Transactions where `party` is the buyer or the seller, in id order.
    fn transactions_for_party(&self, party: WalletAddress) -> Result<Vec<Transaction>>;

    /// Non-terminal transactions referencing the asset. At most one, always.
    fn active_transactions_for_asset(&self, asset_id: AssetId) -> Result<Vec<Transaction>>;

    /// Apply `update` only if the row still matches `guard`. Returns the
    /// updated row, or `None` if the guard no longer matches.
    ///
    /// # Errors
    /// `TransactionNotFound`; `InvalidState` if the update is an illegal move.
    fn compare_and_update(
        &self,
        id: TransactionId,
        guard: TransactionGuard,
        update: &TransactionUpdate,
    ) -> Result<Option<Transaction>>;

    /// Atomically increment `poll_attempts` (and the row version) if the row
    /// still matches `guard`.
    fn record_poll_attempt(
        &self,
        id: TransactionId,
        guard: TransactionGuard,
    ) -> Result<Option<Transaction>>;

    /// Claim rows that are due and not held by a live claim: `Submitted`
    /// rows with a recorded hash, and `Confirmed` rows whose deferred cancel
    /// has not been sent. Claimed rows are returned oldest first.
    fn claim_due(&self, request: ClaimRequest) -> Result<Vec<Transaction>>;

    /// Drop `worker`'s claim on the row. A claim held by another worker is
    /// left alone.
    fn release_claim(&self, id: TransactionId, worker: WorkerId) -> Result<()>;

    /// Rows stuck before a hash was recorded, last touched at or before
    /// `updated_before`: `Created` rows, and `Submitted` rows reserved by a
    /// finalize that never stored its hash.
    fn stale_unsent(&self, updated_before: DateTime<Utc>) -> Result<Vec<Transaction>>;
}
