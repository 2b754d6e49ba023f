//! # SimulatedLedger: in-process development ledger
//!
//! Models the escrow contract the coordinator drives:
//!
//! - `listAsset(assetId, price)`: the caller offers an asset. Re-listing is
//!   allowed for the current owner only.
//! - `purchaseAsset(assetId)` with `value == price`: opens an escrow holding
//!   the payment and takes the listing off sale.
//! - `completeTransaction(escrowId)`: the buyer releases the payment to the
//!   seller; the asset changes hands.
//! - `cancelTransaction(escrowId)`: the seller refunds the buyer; the asset
//!   goes back on sale.
//!
//! Submissions are checked (signature, chain id, nonce) on acceptance and
//! executed only when [`SimulatedLedger::mine`] runs, so tests control
//! confirmation latency exactly. Faults can be injected for every failure
//! path the coordinator handles.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use escrowd_types::{
    AssetId, Cost, EscrowError, EscrowId, EventArg, EventLog, LedgerCall, LedgerEvent,
    LedgerReceipt, Result, SignedCall, TxHash, WalletAddress, Wei, constants,
};
use tokio::{sync::watch, task::JoinHandle};

use crate::LedgerNode;

const GAS_LIST: u64 = 60_000;
const GAS_PURCHASE: u64 = 120_000;
const GAS_FINALIZE: u64 = 55_000;

/// On-ledger state of one escrow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscrowStatus {
    Open,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscrowRecord {
    pub asset_id: AssetId,
    pub buyer: WalletAddress,
    pub seller: WalletAddress,
    pub price: Wei,
    pub status: EscrowStatus,
}

#[derive(Debug, Clone, Copy)]
struct Listing {
    owner: WalletAddress,
    price: Wei,
    for_sale: bool,
}

#[derive(Default)]
struct Faults {
    unreachable: bool,
    fail_next_submit: Option<String>,
    reject_next_estimate: Option<String>,
    revert: HashSet<TxHash>,
    malformed: HashSet<TxHash>,
    withheld: HashSet<TxHash>,
}

#[derive(Default)]
struct Chain {
    chain_id: u64,
    listings: HashMap<AssetId, Listing>,
    escrows: BTreeMap<EscrowId, EscrowRecord>,
    next_escrow: u64,
    nonces: HashMap<WalletAddress, u64>,
    balances: HashMap<WalletAddress, u128>,
    pool: Vec<(TxHash, SignedCall)>,
    receipts: HashMap<TxHash, LedgerReceipt>,
    block: u64,
    faults: Faults,
}

impl Chain {
    fn reachable(&self) -> Result<()> {
        if self.faults.unreachable {
            return Err(EscrowError::LedgerUnavailable {
                reason: "node unreachable".into(),
            });
        }
        Ok(())
    }

    /// Validate `call` against current state without changing it. Returns
    /// the gas it needs or the revert reason.
    fn check(&self, from: WalletAddress, call: &LedgerCall) -> std::result::Result<u64, String> {
        match *call {
            LedgerCall::ListAsset { asset_id, .. } => match self.listings.get(&asset_id) {
                Some(l) if l.owner != from => Err(format!("{from} does not own {asset_id}")),
                Some(l) if !l.for_sale && self.in_escrow(asset_id) => {
                    Err(format!("{asset_id} is held in escrow"))
                }
                _ => Ok(GAS_LIST),
            },
            LedgerCall::Purchase { asset_id, price } => {
                let listing = self
                    .listings
                    .get(&asset_id)
                    .ok_or_else(|| format!("{asset_id} is not listed"))?;
                if !listing.for_sale {
                    return Err(format!("{asset_id} is not for sale"));
                }
                if listing.owner == from {
                    return Err("seller cannot buy own asset".into());
                }
                if listing.price != price {
                    return Err(format!("value {price} does not match price {}", listing.price));
                }
                Ok(GAS_PURCHASE)
            }
            LedgerCall::Complete { escrow_id } => {
                let escrow = self.open_escrow(escrow_id)?;
                if escrow.buyer != from {
                    return Err("only the buyer can complete".into());
                }
                Ok(GAS_FINALIZE)
            }
            LedgerCall::Cancel { escrow_id } => {
                let escrow = self.open_escrow(escrow_id)?;
                if escrow.seller != from {
                    return Err("only the seller can cancel".into());
                }
                Ok(GAS_FINALIZE)
            }
        }
    }

    fn open_escrow(&self, id: EscrowId) -> std::result::Result<&EscrowRecord, String> {
        match self.escrows.get(&id) {
            Some(e) if e.status == EscrowStatus::Open => Ok(e),
            Some(_) => Err(format!("{id} is already settled")),
            None => Err(format!("{id} does not exist")),
        }
    }

    fn in_escrow(&self, asset_id: AssetId) -> bool {
        self.escrows
            .values()
            .any(|e| e.asset_id == asset_id && e.status == EscrowStatus::Open)
    }

    /// Execute a mined call. Returns the emitted event, or the revert reason.
    fn execute(&mut self, signed: &SignedCall) -> std::result::Result<LedgerEvent, String> {
        let from = signed.unsigned.from;
        let call = &signed.unsigned.call;
        let needed = self.check(from, call)?;
        if signed.unsigned.cost.gas_limit < needed {
            return Err(format!(
                "out of gas: limit {} < {needed}",
                signed.unsigned.cost.gas_limit
            ));
        }

        match *call {
            LedgerCall::ListAsset { asset_id, price } => {
                self.listings.insert(
                    asset_id,
                    Listing {
                        owner: from,
                        price,
                        for_sale: true,
                    },
                );
                Ok(LedgerEvent::AssetListed {
                    asset_id,
                    owner: from,
                    price,
                })
            }
            LedgerCall::Purchase { asset_id, price } => {
                let listing = self
                    .listings
                    .get_mut(&asset_id)
                    .ok_or_else(|| format!("{asset_id} is not listed"))?;
                listing.for_sale = false;
                let seller = listing.owner;
                self.next_escrow += 1;
                let escrow_id = EscrowId(self.next_escrow);
                self.escrows.insert(
                    escrow_id,
                    EscrowRecord {
                        asset_id,
                        buyer: from,
                        seller,
                        price,
                        status: EscrowStatus::Open,
                    },
                );
                Ok(LedgerEvent::AssetPurchased {
                    escrow_id,
                    asset_id,
                    buyer: from,
                    seller,
                    price,
                })
            }
            LedgerCall::Complete { escrow_id } => {
                let escrow = self.settle(escrow_id, EscrowStatus::Completed)?;
                self.credit(escrow.seller, escrow.price);
                if let Some(listing) = self.listings.get_mut(&escrow.asset_id) {
                    listing.owner = escrow.buyer;
                }
                Ok(LedgerEvent::TransactionCompleted { escrow_id })
            }
            LedgerCall::Cancel { escrow_id } => {
                let escrow = self.settle(escrow_id, EscrowStatus::Cancelled)?;
                self.credit(escrow.buyer, escrow.price);
                if let Some(listing) = self.listings.get_mut(&escrow.asset_id) {
                    listing.for_sale = true;
                }
                Ok(LedgerEvent::TransactionCancelled { escrow_id })
            }
        }
    }

    /// Pay out of escrow. Balances saturate rather than wrap.
    fn credit(&mut self, to: WalletAddress, amount: Wei) {
        let balance = self.balances.entry(to).or_default();
        *balance = balance.saturating_add(amount.0);
    }

    fn settle(
        &mut self,
        id: EscrowId,
        status: EscrowStatus,
    ) -> std::result::Result<EscrowRecord, String> {
        let escrow = self
            .escrows
            .get_mut(&id)
            .ok_or_else(|| format!("{id} does not exist"))?;
        escrow.status = status;
        Ok(*escrow)
    }
}

/// An in-process ledger node with an escrow contract.
pub struct SimulatedLedger {
    chain: Mutex<Chain>,
}

impl Default for SimulatedLedger {
    fn default() -> Self {
        Self::with_chain_id(constants::DEFAULT_CHAIN_ID)
    }
}

impl SimulatedLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A ledger that only accepts calls signed for `chain_id`.
    #[must_use]
    pub fn with_chain_id(chain_id: u64) -> Self {
        Self {
            chain: Mutex::new(Chain {
                chain_id,
                ..Chain::default()
            }),
        }
    }

    fn chain(&self) -> MutexGuard<'_, Chain> {
        self.chain.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -----------------------------------------------------------------
    // Mining
    // -----------------------------------------------------------------

    /// Mine one block containing every pooled call that is not withheld.
    /// Returns how many calls were mined.
    pub fn mine(&self) -> usize {
        let mut chain = self.chain();
        let pool = std::mem::take(&mut chain.pool);
        let (held, ready): (Vec<_>, Vec<_>) = pool
            .into_iter()
            .partition(|(hash, _)| chain.faults.withheld.contains(hash));
        chain.pool = held;
        if ready.is_empty() {
            return 0;
        }

        chain.block += 1;
        let block_number = chain.block;
        let mined = ready.len();
        for (hash, signed) in ready {
            let receipt = if chain.faults.revert.remove(&hash) {
                tracing::debug!(hash = %hash.short(), "forced revert");
                LedgerReceipt {
                    tx_hash: hash,
                    success: false,
                    block_number,
                    logs: Vec::new(),
                }
            } else {
                match chain.execute(&signed) {
                    Ok(event) => {
                        let logs = if chain.faults.malformed.remove(&hash) {
                            vec![garble(event.to_log())]
                        } else {
                            vec![event.to_log()]
                        };
                        LedgerReceipt {
                            tx_hash: hash,
                            success: true,
                            block_number,
                            logs,
                        }
                    }
                    Err(reason) => {
                        tracing::debug!(hash = %hash.short(), %reason, "call reverted");
                        LedgerReceipt {
                            tx_hash: hash,
                            success: false,
                            block_number,
                            logs: Vec::new(),
                        }
                    }
                }
            };
            chain.receipts.insert(hash, receipt);
        }
        tracing::debug!(block = block_number, mined, "block mined");
        mined
    }

    /// Mine every `interval` until `shutdown` flips to `true`.
    pub fn spawn_miner(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.mine();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    // -----------------------------------------------------------------
    // Fault injection
    // -----------------------------------------------------------------

    /// Every node call fails with `LedgerUnavailable` while set.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.chain().faults.unreachable = unreachable;
    }

    /// The next submission is refused with `SendError`.
    pub fn fail_next_submit(&self, reason: impl Into<String>) {
        self.chain().faults.fail_next_submit = Some(reason.into());
    }

    /// The next estimation is refused with `EstimationError`.
    pub fn reject_next_estimate(&self, reason: impl Into<String>) {
        self.chain().faults.reject_next_estimate = Some(reason.into());
    }

    /// `hash` reverts when mined regardless of contract state.
    pub fn revert_on_mine(&self, hash: TxHash) {
        self.chain().faults.revert.insert(hash);
    }

    /// `hash` executes but its receipt carries an undecodable log.
    pub fn malformed_on_mine(&self, hash: TxHash) {
        self.chain().faults.malformed.insert(hash);
    }

    /// Keep `hash` in the pool across [`SimulatedLedger::mine`] calls.
    pub fn withhold(&self, hash: TxHash) {
        self.chain().faults.withheld.insert(hash);
    }

    /// Let a withheld call be mined again.
    pub fn release(&self, hash: TxHash) {
        self.chain().faults.withheld.remove(&hash);
    }

    // -----------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.chain().pool.len()
    }

    #[must_use]
    pub fn block_number(&self) -> u64 {
        self.chain().block
    }

    #[must_use]
    pub fn escrow(&self, id: EscrowId) -> Option<EscrowRecord> {
        self.chain().escrows.get(&id).copied()
    }

    /// Funds paid out of escrow to `address`.
    #[must_use]
    pub fn balance(&self, address: WalletAddress) -> Wei {
        Wei(self.chain().balances.get(&address).copied().unwrap_or(0))
    }

    /// Current on-ledger owner of a listed asset.
    #[must_use]
    pub fn owner_of(&self, asset_id: AssetId) -> Option<WalletAddress> {
        self.chain().listings.get(&asset_id).map(|l| l.owner)
    }
}

/// Drop the first argument so the log no longer decodes.
fn garble(mut log: EventLog) -> EventLog {
    if let Some(first) = log.args.keys().next().cloned() {
        log.args.remove(&first);
    } else {
        log.args.insert(constants::ARG_PRICE.into(), EventArg::Uint(0));
    }
    log
}

#[async_trait]
impl LedgerNode for SimulatedLedger {
    async fn estimate_cost(&self, from: WalletAddress, call: &LedgerCall) -> Result<Cost> {
        let mut chain = self.chain();
        chain.reachable()?;
        if let Some(reason) = chain.faults.reject_next_estimate.take() {
            return Err(EscrowError::EstimationError { reason });
        }
        chain
            .check(from, call)
            .map(|gas_limit| Cost { gas_limit })
            .map_err(|reason| EscrowError::EstimationError { reason })
    }

    async fn next_nonce(&self, address: WalletAddress) -> Result<u64> {
        let chain = self.chain();
        chain.reachable()?;
        Ok(chain.nonces.get(&address).copied().unwrap_or(0))
    }

    async fn submit(&self, call: &SignedCall) -> Result<TxHash> {
        let mut chain = self.chain();
        chain.reachable()?;
        if let Some(reason) = chain.faults.fail_next_submit.take() {
            return Err(EscrowError::SendError { reason });
        }

        let from = call.unsigned.from;
        call.verify().map_err(|e| EscrowError::SendError {
            reason: e.to_string(),
        })?;
        if call.unsigned.chain_id != chain.chain_id {
            return Err(EscrowError::SendError {
                reason: format!(
                    "chain id {} does not match {}",
                    call.unsigned.chain_id, chain.chain_id
                ),
            });
        }
        let expected = chain.nonces.get(&from).copied().unwrap_or(0);
        if call.unsigned.nonce != expected {
            return Err(EscrowError::SendError {
                reason: format!("nonce {} for {from}, expected {expected}", call.unsigned.nonce),
            });
        }

        let hash = call.hash();
        if chain.receipts.contains_key(&hash) || chain.pool.iter().any(|(h, _)| *h == hash) {
            return Err(EscrowError::SendError {
                reason: format!("{hash} already known"),
            });
        }
        chain.nonces.insert(from, expected + 1);
        chain.pool.push((hash, call.clone()));
        Ok(hash)
    }

    async fn receipt(&self, hash: &TxHash) -> Result<Option<LedgerReceipt>> {
        let chain = self.chain();
        chain.reachable()?;
        Ok(chain.receipts.get(hash).cloned())
    }
}
