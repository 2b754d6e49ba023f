//! Ledger receipts and escrow contract events.
//!
//! A receipt is transient: it drives exactly one state transition and the
//! facts it carries (escrow id, outcome) are folded into the transaction row.
//! Event arguments stay typed integers and addresses end to end.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{AssetId, EscrowError, EscrowId, Result, TxHash, WalletAddress, Wei, constants};

/// A decoded event argument value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventArg {
    Uint(u128),
    Address(WalletAddress),
}

/// One event emitted by a mined call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLog {
    pub name: String,
    pub args: BTreeMap<String, EventArg>,
}

impl EventLog {
    fn uint(&self, arg: &str) -> Result<u128> {
        match self.args.get(arg) {
            Some(EventArg::Uint(v)) => Ok(*v),
            Some(EventArg::Address(_)) => Err(decode_error(&self.name, arg, "expected uint")),
            None => Err(decode_error(&self.name, arg, "missing")),
        }
    }

    fn id(&self, arg: &str) -> Result<u64> {
        u64::try_from(self.uint(arg)?).map_err(|_| decode_error(&self.name, arg, "out of range"))
    }

    fn address(&self, arg: &str) -> Result<WalletAddress> {
        match self.args.get(arg) {
            Some(EventArg::Address(a)) => Ok(*a),
            Some(EventArg::Uint(_)) => Err(decode_error(&self.name, arg, "expected address")),
            None => Err(decode_error(&self.name, arg, "missing")),
        }
    }
}

fn decode_error(event: &str, arg: &str, what: &str) -> EscrowError {
    EscrowError::Serialization(format!("{event}.{arg}: {what}"))
}

/// Escrow contract events the coordinator understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEvent {
    AssetListed {
        asset_id: AssetId,
        owner: WalletAddress,
        price: Wei,
    },
    AssetPurchased {
        escrow_id: EscrowId,
        asset_id: AssetId,
        buyer: WalletAddress,
        seller: WalletAddress,
        price: Wei,
    },
    TransactionCompleted {
        escrow_id: EscrowId,
    },
    TransactionCancelled {
        escrow_id: EscrowId,
    },
}

impl LedgerEvent {
    /// Decode a raw event log.
    ///
    /// # Errors
    /// Returns `Serialization` for unknown event names and for missing,
    /// mistyped or out-of-range arguments.
    pub fn decode(log: &EventLog) -> Result<Self> {
        match log.name.as_str() {
            constants::EVENT_ASSET_LISTED => Ok(Self::AssetListed {
                asset_id: AssetId(log.id(constants::ARG_ASSET_ID)?),
                owner: log.address(constants::ARG_OWNER)?,
                price: Wei(log.uint(constants::ARG_PRICE)?),
            }),
            constants::EVENT_ASSET_PURCHASED => Ok(Self::AssetPurchased {
                escrow_id: EscrowId(log.id(constants::ARG_TRANSACTION_ID)?),
                asset_id: AssetId(log.id(constants::ARG_ASSET_ID)?),
                buyer: log.address(constants::ARG_BUYER)?,
                seller: log.address(constants::ARG_SELLER)?,
                price: Wei(log.uint(constants::ARG_PRICE)?),
            }),
            constants::EVENT_TRANSACTION_COMPLETED => Ok(Self::TransactionCompleted {
                escrow_id: EscrowId(log.id(constants::ARG_TRANSACTION_ID)?),
            }),
            constants::EVENT_TRANSACTION_CANCELLED => Ok(Self::TransactionCancelled {
                escrow_id: EscrowId(log.id(constants::ARG_TRANSACTION_ID)?),
            }),
            other => Err(EscrowError::Serialization(format!("unknown event {other}"))),
        }
    }

    /// Encode as a raw log, the way the contract emits it.
    #[must_use]
    pub fn to_log(&self) -> EventLog {
        let (name, args) = match *self {
            Self::AssetListed {
                asset_id,
                owner,
                price,
            } => (
                constants::EVENT_ASSET_LISTED,
                vec![
                    (constants::ARG_ASSET_ID, EventArg::Uint(asset_id.0.into())),
                    (constants::ARG_OWNER, EventArg::Address(owner)),
                    (constants::ARG_PRICE, EventArg::Uint(price.0)),
                ],
            ),
            Self::AssetPurchased {
                escrow_id,
                asset_id,
                buyer,
                seller,
                price,
            } => (
                constants::EVENT_ASSET_PURCHASED,
                vec![
                    (constants::ARG_TRANSACTION_ID, EventArg::Uint(escrow_id.0.into())),
                    (constants::ARG_ASSET_ID, EventArg::Uint(asset_id.0.into())),
                    (constants::ARG_BUYER, EventArg::Address(buyer)),
                    (constants::ARG_SELLER, EventArg::Address(seller)),
                    (constants::ARG_PRICE, EventArg::Uint(price.0)),
                ],
            ),
            Self::TransactionCompleted { escrow_id } => (
                constants::EVENT_TRANSACTION_COMPLETED,
                vec![(constants::ARG_TRANSACTION_ID, EventArg::Uint(escrow_id.0.into()))],
            ),
            Self::TransactionCancelled { escrow_id } => (
                constants::EVENT_TRANSACTION_CANCELLED,
                vec![(constants::ARG_TRANSACTION_ID, EventArg::Uint(escrow_id.0.into()))],
            ),
        };
        EventLog {
            name: name.to_string(),
            args: args
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        }
    }
}

/// The ledger's confirmation record for a submitted call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerReceipt {
    pub tx_hash: TxHash,
    /// `false` when the call reverted.
    pub success: bool,
    pub block_number: u64,
    pub logs: Vec<EventLog>,
}

impl LedgerReceipt {
    /// Decode every log. Fails on the first log that does not decode.
    ///
    /// # Errors
    /// Propagates [`LedgerEvent::decode`] failures.
    pub fn events(&self) -> Result<Vec<LedgerEvent>> {
        self.logs.iter().map(LedgerEvent::decode).collect()
    }
}

/// Result of a non-blocking receipt check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    /// Not mined yet (or unknown to the node).
    Pending,
    Receipt(LedgerReceipt),
}
