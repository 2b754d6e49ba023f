//! In-memory [`EscrowStore`].
//!
//! All tables sit behind one mutex, so each trait method is a serializable
//! transaction: the availability check and flip in
//! `create_transaction_locking_asset` cannot interleave with another
//! purchaser's. The mutex is never held across an await.

use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard},
};

use chrono::{DateTime, Utc};
use escrowd_types::{
    Asset, AssetId, Claim, EscrowError, NewAsset, Result, Transaction, TransactionDraft,
    TransactionGuard, TransactionId, TransactionState, TransactionUpdate, WalletAddress, Wei,
    WorkerId,
};

use crate::store::{ClaimRequest, EscrowStore};

#[derive(Default)]
struct Tables {
    assets: BTreeMap<AssetId, Asset>,
    transactions: BTreeMap<TransactionId, Transaction>,
    next_asset: u64,
    next_transaction: u64,
}

impl Tables {
    fn asset_mut(&mut self, id: AssetId) -> Result<&mut Asset> {
        self.assets.get_mut(&id).ok_or(EscrowError::AssetNotFound(id))
    }

    fn has_active_transaction(&self, asset_id: AssetId) -> bool {
        self.transactions
            .values()
            .any(|tx| tx.asset_id == asset_id && tx.state.is_active())
    }
}

/// Reference store keeping every table in memory.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| EscrowError::Storage("store mutex poisoned".into()))
    }
}

impl EscrowStore for MemoryStore {
    fn insert_asset(&self, asset: NewAsset) -> Result<Asset> {
        let mut tables = self.lock()?;
        tables.next_asset += 1;
        let now = Utc::now();
        let row = Asset {
            id: AssetId(tables.next_asset),
            name: asset.name,
            owner: asset.owner,
            price: asset.price,
            available: true,
            sold: false,
            created_at: now,
            updated_at: now,
        };
        tables.assets.insert(row.id, row.clone());
        Ok(row)
    }

    fn asset(&self, id: AssetId) -> Result<Option<Asset>> {
        Ok(self.lock()?.assets.get(&id).cloned())
    }

    fn update_asset_price(&self, id: AssetId, price: Wei) -> Result<Asset> {
        let mut tables = self.lock()?;
        let asset = tables.asset_mut(id)?;
        asset.price = price;
        asset.updated_at = Utc::now();
        Ok(asset.clone())
    }

    fn compare_and_set_availability(&self, id: AssetId, expected: bool, new: bool) -> Result<bool> {
        let mut tables = self.lock()?;
        let asset = tables.asset_mut(id)?;
        if asset.available != expected || (new && asset.sold) {
            return Ok(false);
        }
        asset.available = new;
        asset.updated_at = Utc::now();
        Ok(true)
    }

    fn release_if_idle(&self, id: AssetId) -> Result<bool> {
        let mut tables = self.lock()?;
        let busy = tables.has_active_transaction(id);
        let asset = tables.asset_mut(id)?;
        if asset.available {
            return Ok(true);
        }
        if asset.sold || busy {
            return Ok(false);
        }
        asset.available = true;
        asset.updated_at = Utc::now();
        tracing::debug!(asset = %id, "availability lock released");
        Ok(true)
    }

    fn transfer_ownership(&self, id: AssetId, new_owner: WalletAddress) -> Result<Asset> {
        let mut tables = self.lock()?;
        let asset = tables.asset_mut(id)?;
        asset.owner = new_owner;
        asset.sold = true;
        asset.available = false;
        asset.updated_at = Utc::now();
        Ok(asset.clone())
    }

    fn locked_assets_without_active_transaction(&self) -> Result<Vec<AssetId>> {
        let tables = self.lock()?;
        Ok(tables
            .assets
            .values()
            .filter(|a| !a.available && !a.sold && !tables.has_active_transaction(a.id))
            .map(|a| a.id)
            .collect())
    }

    fn create_transaction_locking_asset(&self, draft: TransactionDraft) -> Result<Transaction> {
        let mut tables = self.lock()?;
        let asset = tables
            .assets
            .get(&draft.asset_id)
            .ok_or(EscrowError::AssetNotFound(draft.asset_id))?;
        if !asset.available || asset.sold {
            return Err(EscrowError::AssetUnavailable(draft.asset_id));
        }
        if asset.owner == draft.buyer {
            return Err(EscrowError::SelfPurchase {
                asset: draft.asset_id,
                buyer: draft.buyer,
            });
        }
        let (seller, price) = (asset.owner, asset.price);

        let now = Utc::now();
        tables.next_transaction += 1;
        let tx = Transaction::new(
            TransactionId(tables.next_transaction),
            draft.asset_id,
            draft.buyer,
            seller,
            price,
            now,
        );
        let asset = tables.asset_mut(draft.asset_id)?;
        asset.available = false;
        asset.updated_at = now;
        tables.transactions.insert(tx.id, tx.clone());
        tracing::debug!(tx = %tx.id, asset = %tx.asset_id, "asset locked for new transaction");
        Ok(tx)
    }

    fn transaction(&self, id: TransactionId) -> Result<Option<Transaction>> {
        Ok(self.lock()?.transactions.get(&id).cloned())
    }

    fn transactions(&self, offset: usize, limit: usize) -> Result<Vec<Transaction>> {
        Ok(self
            .lock()?
            .transactions
            .values()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    fn transactions_for_party(&self, party: WalletAddress) -> Result<Vec<Transaction>> {
        Ok(self
            .lock()?
            .transactions
            .values()
            .filter(|tx| tx.buyer == party || tx.seller == party)
            .cloned()
            .collect())
    }

    fn active_transactions_for_asset(&self, asset_id: AssetId) -> Result<Vec<Transaction>> {
        Ok(self
            .lock()?
            .transactions
            .values()
            .filter(|tx| tx.asset_id == asset_id && tx.state.is_active())
            .cloned()
            .collect())
    }

    fn compare_and_update(
        &self,
        id: TransactionId,
        guard: TransactionGuard,
        update: &TransactionUpdate,
    ) -> Result<Option<Transaction>> {
        let mut tables = self.lock()?;
        let tx = tables
            .transactions
            .get_mut(&id)
            .ok_or(EscrowError::TransactionNotFound(id))?;
        if !guard.matches(tx) {
            return Ok(None);
        }
        // Apply to a copy so a rejected update leaves the row untouched.
        let mut next = tx.clone();
        update.apply(&mut next, Utc::now())?;
        *tx = next.clone();
        Ok(Some(next))
    }

    fn record_poll_attempt(
        &self,
        id: TransactionId,
        guard: TransactionGuard,
    ) -> Result<Option<Transaction>> {
        let mut tables = self.lock()?;
        let tx = tables
            .transactions
            .get_mut(&id)
            .ok_or(EscrowError::TransactionNotFound(id))?;
        if !guard.matches(tx) {
            return Ok(None);
        }
        tx.poll_attempts = tx.poll_attempts.saturating_add(1);
        tx.version = tx.version.wrapping_add(1);
        tx.updated_at = Utc::now();
        Ok(Some(tx.clone()))
    }

    fn claim_due(&self, request: ClaimRequest) -> Result<Vec<Transaction>> {
        let mut tables = self.lock()?;
        let mut due: Vec<&mut Transaction> = tables
            .transactions
            .values_mut()
            .filter(|tx| {
                let in_flight = tx.state == TransactionState::Submitted && tx.tx_hash.is_some();
                let cancel_pending = tx.state == TransactionState::Confirmed && tx.cancel_requested;
                (in_flight || cancel_pending)
                    && tx
                        .submitted_at
                        .is_some_and(|at| at <= request.submitted_before)
                    && !tx.claim.is_some_and(|c| c.is_live(request.now))
            })
            .collect();
        due.sort_by_key(|tx| tx.submitted_at);

        let claim = Claim {
            worker: request.worker,
            expires_at: request.lease_until,
        };
        Ok(due
            .into_iter()
            .take(request.limit)
            .map(|tx| {
                tx.claim = Some(claim);
                tx.clone()
            })
            .collect())
    }

    fn release_claim(&self, id: TransactionId, worker: WorkerId) -> Result<()> {
        let mut tables = self.lock()?;
        let tx = tables
            .transactions
            .get_mut(&id)
            .ok_or(EscrowError::TransactionNotFound(id))?;
        if tx.claim.is_some_and(|c| c.worker == worker) {
            tx.claim = None;
        }
        Ok(())
    }

    fn stale_unsent(&self, updated_before: DateTime<Utc>) -> Result<Vec<Transaction>> {
        Ok(self
            .lock()?
            .transactions
            .values()
            .filter(|tx| {
                let unsent = tx.state == TransactionState::Created
                    || (tx.state == TransactionState::Submitted && tx.tx_hash.is_none());
                unsent && tx.updated_at <= updated_before
            })
            .cloned()
            .collect())
    }
}
