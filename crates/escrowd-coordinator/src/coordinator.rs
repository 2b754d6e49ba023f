//! # Coordinator Facade
//!
//! The public entry point. An API layer calls these methods and nothing
//! else; every mutation funnels into the availability lock and the state
//! machine underneath.
//!
//! `purchase` and `finalize` return as soon as the ledger accepted the call
//! (or the attempt was rolled back). Confirmation arrives later through the
//! reconciliation loop or an explicit `reconcile_one`.

use std::sync::Arc;

use escrowd_ledger::{Keyring, LedgerClient, SimulatedLedger};
use escrowd_store::{EscrowStore, MemoryStore};
use escrowd_types::{
    Asset, AssetId, CoordinatorConfig, EscrowError, LedgerCall, NewAsset, Outcome, Result,
    Transaction, TransactionDraft, TransactionId, TxHash, WalletAddress, Wei,
};

use crate::{EscrowStateMachine, ReconciliationLoop, RecoveryReport, RecoveryScan};

/// Owns the state machine and the reconciliation loop over one store and
/// one ledger client.
pub struct Coordinator {
    store: Arc<dyn EscrowStore>,
    ledger: Arc<LedgerClient>,
    machine: Arc<EscrowStateMachine>,
    reconciler: Arc<ReconciliationLoop>,
}

impl Coordinator {
    /// Wire the components over `store` and `ledger`.
    ///
    /// # Errors
    /// `Configuration` if `config` fails validation.
    pub fn new(
        store: Arc<dyn EscrowStore>,
        ledger: Arc<LedgerClient>,
        config: &CoordinatorConfig,
    ) -> Result<Self> {
        config.validate()?;
        let machine = Arc::new(EscrowStateMachine::new(
            Arc::clone(&store),
            Arc::clone(&ledger),
            config.reconcile.clone(),
        ));
        let recovery = RecoveryScan::new(
            Arc::clone(&store),
            Arc::clone(&machine),
            config.recovery.clone(),
        );
        let reconciler = Arc::new(ReconciliationLoop::new(
            Arc::clone(&store),
            Arc::clone(&machine),
            recovery,
            config.reconcile.clone(),
        ));
        Ok(Self {
            store,
            ledger,
            machine,
            reconciler,
        })
    }

    // -----------------------------------------------------------------
    // Assets
    // -----------------------------------------------------------------

    /// Record a new asset, available for purchase.
    ///
    /// # Errors
    /// Store failures.
    pub fn register_asset(
        &self,
        name: impl Into<String>,
        owner: WalletAddress,
        price: Wei,
    ) -> Result<Asset> {
        let asset = self.store.insert_asset(NewAsset::new(name, owner, price))?;
        tracing::info!(asset = %asset.id, owner = %asset.owner, price = %asset.price, "asset registered");
        Ok(asset)
    }

    /// # Errors
    /// `AssetNotFound`.
    pub fn asset(&self, asset_id: AssetId) -> Result<Asset> {
        self.store
            .asset(asset_id)?
            .ok_or(EscrowError::AssetNotFound(asset_id))
    }

    /// Offer the asset on the ledger at `price`, signed by its owner, and
    /// record the price once the ledger accepted the listing. Not part of
    /// the purchase state machine; the listing's receipt is not tracked.
    ///
    /// # Errors
    /// `AssetNotFound`; `AssetUnavailable` while a sale is active or once
    /// sold; `SignerNotFound`; `EstimationError` / `SendError`.
    pub async fn list_asset(&self, asset_id: AssetId, price: Wei) -> Result<TxHash> {
        let asset = self.asset(asset_id)?;
        if !asset.available || asset.sold {
            return Err(EscrowError::AssetUnavailable(asset_id));
        }
        let call = LedgerCall::ListAsset { asset_id, price };
        let cost = self.ledger.estimate_cost(asset.owner, &call).await?;
        let hash = self.ledger.send(asset.owner, &call, cost).await?;
        self.store.update_asset_price(asset_id, price)?;
        tracing::info!(asset = %asset_id, %price, hash = %hash.short(), "listing submitted");
        Ok(hash)
    }

    // -----------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------

    /// Start a purchase: lock the asset, record the transaction, send the
    /// payment into escrow. The returned row is `Submitted` on acceptance
    /// or `Failed` (lock released, reason in `last_error`) if the call
    /// could not be sent.
    ///
    /// # Errors
    /// `SignerNotFound` for a buyer with no signer; `AssetNotFound`,
    /// `AssetUnavailable`, `SelfPurchase`. None of these leave a record.
    pub async fn purchase(&self, asset_id: AssetId, buyer: WalletAddress) -> Result<Transaction> {
        self.ledger.ensure_signer(&buyer)?;
        let tx = self.machine.create(TransactionDraft { asset_id, buyer })?;
        self.machine.submit(tx.id).await
    }

    /// Force one reconciliation of the transaction now.
    ///
    /// # Errors
    /// `TransactionNotFound`; `LedgerUnavailable`.
    pub async fn reconcile_one(&self, id: TransactionId) -> Result<Transaction> {
        self.machine.reconcile(id).await
    }

    /// # Errors
    /// `InvalidState` unless the transaction is `Confirmed`.
    pub async fn finalize(&self, id: TransactionId, outcome: Outcome) -> Result<Transaction> {
        self.machine.finalize(id, outcome).await
    }

    /// Release the escrow to the seller.
    ///
    /// # Errors
    /// `InvalidState` unless the transaction is `Confirmed`.
    pub async fn complete(&self, id: TransactionId) -> Result<Transaction> {
        self.finalize(id, Outcome::Complete).await
    }

    /// Refund a confirmed escrow, or drop a sale that was never sent. A
    /// purchase still in flight is marked instead and cancelled once it
    /// settles.
    ///
    /// # Errors
    /// `InvalidState` while a complete or cancel call is in flight or once
    /// terminal.
    pub async fn cancel(&self, id: TransactionId) -> Result<Transaction> {
        self.machine.cancel(id).await
    }

    /// # Errors
    /// `TransactionNotFound`.
    pub fn get_transaction(&self, id: TransactionId) -> Result<Transaction> {
        self.store
            .transaction(id)?
            .ok_or(EscrowError::TransactionNotFound(id))
    }

    /// # Errors
    /// Store failures.
    pub fn transactions(&self, offset: usize, limit: usize) -> Result<Vec<Transaction>> {
        self.store.transactions(offset, limit)
    }

    /// # Errors
    /// Store failures.
    pub fn transactions_for_party(&self, party: WalletAddress) -> Result<Vec<Transaction>> {
        self.store.transactions_for_party(party)
    }

    // -----------------------------------------------------------------
    // Background
    // -----------------------------------------------------------------

    /// Run one restart-recovery pass now.
    ///
    /// # Errors
    /// Store failures.
    pub fn recover(&self) -> Result<RecoveryReport> {
        self.reconciler.recovery().run_once()
    }

    /// The reconciliation loop, for [`ReconciliationLoop::spawn_workers`]
    /// or manual sweeps.
    #[must_use]
    pub fn reconciliation_loop(&self) -> Arc<ReconciliationLoop> {
        Arc::clone(&self.reconciler)
    }
}

// ---------------------------------------------------------------------------
// Development stack
// ---------------------------------------------------------------------------

/// A coordinator over [`MemoryStore`] and [`SimulatedLedger`], with a
/// [`Keyring`] for the parties. Used by the demo binary and tests.
pub struct DevStack {
    pub coordinator: Coordinator,
    pub ledger: Arc<SimulatedLedger>,
    pub keyring: Arc<Keyring>,
}

impl DevStack {
    /// # Errors
    /// `Configuration` if `config` fails validation.
    pub fn new(config: &CoordinatorConfig) -> Result<Self> {
        let ledger = Arc::new(SimulatedLedger::with_chain_id(config.ledger.chain_id));
        let keyring = Arc::new(Keyring::new());
        let client = Arc::new(LedgerClient::new(
            ledger.clone(),
            keyring.clone(),
            config.ledger.clone(),
        ));
        let coordinator = Coordinator::new(Arc::new(MemoryStore::new()), client, config)?;
        Ok(Self {
            coordinator,
            ledger,
            keyring,
        })
    }
}
