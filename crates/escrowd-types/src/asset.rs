//! Asset model and the fixed-point price type.
//!
//! Prices are integers in the ledger's smallest unit ([`Wei`]). Decimal ether
//! amounts only appear at the edges and are converted exactly, never through
//! floating point.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{AssetId, EscrowError, Result, WalletAddress, constants};

/// A price in the ledger's smallest currency unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Default, Serialize, Deserialize)]
pub struct Wei(pub u128);

impl Wei {
    pub const ZERO: Self = Self(0);

    /// Convert a decimal ether amount to wei.
    ///
    /// # Errors
    /// Returns `Configuration` if the amount is negative, finer than one wei,
    /// or too large to represent.
    pub fn from_ether(ether: Decimal) -> Result<Self> {
        if ether.is_sign_negative() {
            return Err(EscrowError::Configuration(format!(
                "negative price: {ether}"
            )));
        }
        let scaled = ether
            .checked_mul(Decimal::from(10u64.pow(constants::WEI_DECIMALS)))
            .ok_or_else(|| EscrowError::Configuration(format!("price overflow: {ether}")))?;
        if !scaled.fract().is_zero() {
            return Err(EscrowError::Configuration(format!(
                "price {ether} has sub-wei precision"
            )));
        }
        // An integral value normalizes to scale 0, so the mantissa is the value.
        u128::try_from(scaled.normalize().mantissa())
            .map(Self)
            .map_err(|_| EscrowError::Configuration(format!("price overflow: {ether}")))
    }

    /// Convert back to a decimal ether amount.
    ///
    /// # Errors
    /// Returns `Serialization` if the value exceeds decimal's 96-bit mantissa.
    pub fn to_ether(self) -> Result<Decimal> {
        let raw = i128::try_from(self.0)
            .map_err(|_| EscrowError::Serialization(format!("{} wei out of range", self.0)))?;
        Decimal::try_from_i128_with_scale(raw, constants::WEI_DECIMALS)
            .map(|d| d.normalize())
            .map_err(|e| EscrowError::Serialization(e.to_string()))
    }
}

impl fmt::Display for Wei {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} wei", self.0)
    }
}

/// A uniquely identified digital asset offered for sale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub id: AssetId,
    pub name: String,
    /// Current owner; the seller of any new transaction.
    pub owner: WalletAddress,
    /// Asking price. Transactions copy it at creation time.
    pub price: Wei,
    /// `true` iff no active transaction references this asset.
    pub available: bool,
    /// Set once a transaction completes. A sold asset never becomes available again.
    pub sold: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields supplied when registering a new asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAsset {
    pub name: String,
    pub owner: WalletAddress,
    pub price: Wei,
}

impl NewAsset {
    #[must_use]
    pub fn new(name: impl Into<String>, owner: WalletAddress, price: Wei) -> Self {
        Self {
            name: name.into(),
            owner,
            price,
        }
    }
}
