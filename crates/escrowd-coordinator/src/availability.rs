//! Per-asset availability lock.
//!
//! An asset has at most one active transaction. The lock is the asset row's
//! `available` flag, flipped only through conditional store updates, so it
//! holds across coordinator instances sharing one store. Acquire and release
//! are single non-suspending store steps and are never held across a ledger
//! round-trip.

use std::sync::Arc;

use escrowd_store::EscrowStore;
use escrowd_types::{AssetId, EscrowError, Result, Transaction, TransactionDraft};

pub struct AvailabilityLock {
    store: Arc<dyn EscrowStore>,
}

impl AvailabilityLock {
    #[must_use]
    pub fn new(store: Arc<dyn EscrowStore>) -> Self {
        Self { store }
    }

    /// Flip the asset from available to unavailable in one conditional
    /// update. Exactly one of any number of concurrent callers gets `true`.
    ///
    /// # Errors
    /// `AssetNotFound`, or a store failure.
    pub fn acquire(&self, asset_id: AssetId) -> Result<bool> {
        let acquired = self.store.compare_and_set_availability(asset_id, true, false)?;
        tracing::debug!(asset = %asset_id, acquired, "availability lock acquire");
        Ok(acquired)
    }

    /// Take the lock and insert the transaction holding it in the same step.
    ///
    /// # Errors
    /// `AssetUnavailable` when another transaction holds the lock or the
    /// asset is sold; `AssetNotFound`; `SelfPurchase`.
    pub fn acquire_for(&self, draft: TransactionDraft) -> Result<Transaction> {
        match self.store.create_transaction_locking_asset(draft) {
            Ok(tx) => {
                tracing::info!(asset = %draft.asset_id, tx = %tx.id, buyer = %draft.buyer, "availability lock acquired");
                Ok(tx)
            }
            Err(e @ EscrowError::AssetUnavailable(_)) => {
                tracing::debug!(asset = %draft.asset_id, buyer = %draft.buyer, "asset already locked");
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Make the asset available again if nothing active references it and
    /// it has not been sold. Idempotent. Returns whether the asset is
    /// available afterwards.
    ///
    /// # Errors
    /// `AssetNotFound`, or a store failure.
    pub fn release(&self, asset_id: AssetId) -> Result<bool> {
        let available = self.store.release_if_idle(asset_id)?;
        if available {
            tracing::info!(asset = %asset_id, "availability lock released");
        } else {
            tracing::debug!(asset = %asset_id, "availability lock kept (sold or still active)");
        }
        Ok(available)
    }

    /// # Errors
    /// `AssetNotFound`, or a store failure.
    pub fn is_available(&self, asset_id: AssetId) -> Result<bool> {
        self.store
            .asset(asset_id)?
            .map(|a| a.available)
            .ok_or(EscrowError::AssetNotFound(asset_id))
    }
}

#[cfg(test)]
mod tests {
    use escrowd_store::MemoryStore;
    use escrowd_types::{NewAsset, TransactionState, TransactionUpdate, WalletAddress, Wei};

    use super::*;

    fn setup() -> (Arc<MemoryStore>, AvailabilityLock, AssetId) {
        let store = Arc::new(MemoryStore::new());
        let asset = store
            .insert_asset(NewAsset::new("Pepe", WalletAddress::random(), Wei(500)))
            .unwrap();
        let lock = AvailabilityLock::new(store.clone());
        (store, lock, asset.id)
    }

    #[test]
    fn acquire_is_exclusive() {
        let (_, lock, asset) = setup();
        assert!(lock.acquire(asset).unwrap());
        assert!(!lock.acquire(asset).unwrap());
        assert!(!lock.is_available(asset).unwrap());
    }

    #[test]
    fn release_is_idempotent() {
        let (_, lock, asset) = setup();
        lock.acquire(asset).unwrap();
        assert!(lock.release(asset).unwrap());
        assert!(lock.release(asset).unwrap());
        assert!(lock.acquire(asset).unwrap());
    }

    #[test]
    fn release_keeps_lock_of_active_transaction() {
        let (store, lock, asset) = setup();
        let tx = lock
            .acquire_for(TransactionDraft {
                asset_id: asset,
                buyer: WalletAddress::random(),
            })
            .unwrap();

        assert!(!lock.release(asset).unwrap());
        assert!(!lock.is_available(asset).unwrap());

        store
            .compare_and_update(
                tx.id,
                tx.guard(),
                &TransactionUpdate::transition(TransactionState::Cancelled),
            )
            .unwrap()
            .unwrap();
        assert!(lock.release(asset).unwrap());
    }

    #[test]
    fn acquire_for_rejects_second_buyer() {
        let (_, lock, asset) = setup();
        let draft = |buyer| TransactionDraft {
            asset_id: asset,
            buyer,
        };
        lock.acquire_for(draft(WalletAddress::random())).unwrap();
        assert!(matches!(
            lock.acquire_for(draft(WalletAddress::random())),
            Err(EscrowError::AssetUnavailable(_))
        ));
    }

    #[test]
    fn unknown_asset_is_not_found() {
        let (_, lock, _) = setup();
        assert!(matches!(
            lock.is_available(AssetId(404)),
            Err(EscrowError::AssetNotFound(_))
        ));
        assert!(lock.acquire(AssetId(404)).is_err());
    }
}
