//! Transport to a ledger node.

use async_trait::async_trait;
use escrowd_types::{Cost, LedgerCall, LedgerReceipt, Result, SignedCall, TxHash, WalletAddress};

/// The raw operations a ledger node exposes. [`crate::LedgerClient`] layers
/// signing, nonce serialization and cost headroom on top.
///
/// Implementations report failures as:
/// - `EstimationError` when a dry run of the call would revert,
/// - `SendError` when the node rejects a submission,
/// - `LedgerUnavailable` when the node cannot be reached at all.
#[async_trait]
pub trait LedgerNode: Send + Sync {
    /// Dry-run `call` as `from` and report the resources it would consume.
    async fn estimate_cost(&self, from: WalletAddress, call: &LedgerCall) -> Result<Cost>;

    /// The next nonce the node expects from `address`, counting calls
    /// already waiting in its pending pool.
    async fn next_nonce(&self, address: WalletAddress) -> Result<u64>;

    /// Accept a signed call into the pending pool. Returns the node's hash
    /// for it, which must equal [`SignedCall::hash`].
    async fn submit(&self, call: &SignedCall) -> Result<TxHash>;

    /// The receipt for `hash`, or `None` while it is not mined.
    async fn receipt(&self, hash: &TxHash) -> Result<Option<LedgerReceipt>>;
}
