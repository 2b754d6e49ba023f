//! Escrow contract calls and their signed envelopes.
//!
//! A [`SignedCall`] is what travels to the ledger node. Its hash is derived
//! locally from the signed bytes, so the coordinator knows the external hash
//! before the node answers and can persist it durably.

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{AssetId, EscrowError, EscrowId, Result, TxHash, WalletAddress, Wei};

/// A call to the escrow contract, with typed arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerCall {
    /// Owner offers an asset at a price.
    ListAsset { asset_id: AssetId, price: Wei },
    /// Buyer pays `price` into a new escrow for the asset.
    Purchase { asset_id: AssetId, price: Wei },
    /// Buyer releases an escrow to the seller.
    Complete { escrow_id: EscrowId },
    /// Seller refunds an escrow to the buyer.
    Cancel { escrow_id: EscrowId },
}

impl LedgerCall {
    /// Contract function name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::ListAsset { .. } => "listAsset",
            Self::Purchase { .. } => "purchaseAsset",
            Self::Complete { .. } => "completeTransaction",
            Self::Cancel { .. } => "cancelTransaction",
        }
    }

    /// Value transferred with the call. Only a purchase moves funds.
    #[must_use]
    pub fn value(&self) -> Wei {
        match self {
            Self::Purchase { price, .. } => *price,
            _ => Wei::ZERO,
        }
    }

    fn encode_args(&self, out: &mut Vec<u8>) {
        match self {
            Self::ListAsset { asset_id, price } | Self::Purchase { asset_id, price } => {
                out.extend_from_slice(&asset_id.0.to_le_bytes());
                out.extend_from_slice(&price.0.to_le_bytes());
            }
            Self::Complete { escrow_id } | Self::Cancel { escrow_id } => {
                out.extend_from_slice(&escrow_id.0.to_le_bytes());
            }
        }
    }
}

/// Resource budget for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cost {
    pub gas_limit: u64,
}

impl Cost {
    /// Add `pct` percent of headroom on top of an estimate.
    #[must_use]
    pub fn with_headroom(self, pct: u64) -> Self {
        Self {
            gas_limit: self
                .gas_limit
                .saturating_add(self.gas_limit.saturating_mul(pct) / 100),
        }
    }
}

/// Everything the signer commits to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedCall {
    pub chain_id: u64,
    pub from: WalletAddress,
    pub nonce: u64,
    pub cost: Cost,
    pub call: LedgerCall,
}

impl UnsignedCall {
    /// Canonical signing payload.
    ///
    /// Format: `"escrowd:call:v1:" || chain_id || from || nonce || gas_limit || value || name || args`
    #[must_use]
    pub fn signing_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(128);
        payload.extend_from_slice(b"escrowd:call:v1:");
        payload.extend_from_slice(&self.chain_id.to_le_bytes());
        payload.extend_from_slice(self.from.as_bytes());
        payload.extend_from_slice(&self.nonce.to_le_bytes());
        payload.extend_from_slice(&self.cost.gas_limit.to_le_bytes());
        payload.extend_from_slice(&self.call.value().0.to_le_bytes());
        payload.extend_from_slice(self.call.name().as_bytes());
        self.call.encode_args(&mut payload);
        payload
    }
}

/// A call signed by the `from` account's key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedCall {
    pub unsigned: UnsignedCall,
    /// Ed25519 public key whose derived address must equal `unsigned.from`.
    pub public_key: [u8; 32],
    /// Ed25519 signature over [`UnsignedCall::signing_payload`].
    pub signature: Vec<u8>,
}

impl SignedCall {
    /// External hash: `SHA-256("escrowd:tx:v1:" || payload || signature)`.
    #[must_use]
    pub fn hash(&self) -> TxHash {
        let mut hasher = Sha256::new();
        hasher.update(b"escrowd:tx:v1:");
        hasher.update(self.unsigned.signing_payload());
        hasher.update(&self.signature);
        TxHash(hasher.finalize().into())
    }

    /// Check that the key controls `from` and the signature covers the payload.
    ///
    /// # Errors
    /// Returns `SigningFailed` describing the first check that failed.
    pub fn verify(&self) -> Result<()> {
        if WalletAddress::from_public_key(&self.public_key) != self.unsigned.from {
            return Err(EscrowError::SigningFailed(format!(
                "key does not control {}",
                self.unsigned.from
            )));
        }
        let key = VerifyingKey::from_bytes(&self.public_key)
            .map_err(|e| EscrowError::SigningFailed(e.to_string()))?;
        let signature = Signature::from_slice(&self.signature)
            .map_err(|e| EscrowError::SigningFailed(e.to_string()))?;
        key.verify(&self.unsigned.signing_payload(), &signature)
            .map_err(|e| EscrowError::SigningFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    fn signed(nonce: u64) -> SignedCall {
        let key = SigningKey::from_bytes(&[42u8; 32]);
        let public_key = key.verifying_key().to_bytes();
        let unsigned = UnsignedCall {
            chain_id: 1337,
            from: WalletAddress::from_public_key(&public_key),
            nonce,
            cost: Cost { gas_limit: 21_000 },
            call: LedgerCall::Purchase {
                asset_id: AssetId(1),
                price: Wei(500),
            },
        };
        let signature = key.sign(&unsigned.signing_payload()).to_bytes().to_vec();
        SignedCall {
            unsigned,
            public_key,
            signature,
        }
    }

    #[test]
    fn only_purchase_carries_value() {
        let purchase = LedgerCall::Purchase {
            asset_id: AssetId(1),
            price: Wei(500),
        };
        let list = LedgerCall::ListAsset {
            asset_id: AssetId(1),
            price: Wei(500),
        };
        assert_eq!(purchase.value(), Wei(500));
        assert_eq!(list.value(), Wei::ZERO);
        assert_eq!(LedgerCall::Complete { escrow_id: EscrowId(1) }.value(), Wei::ZERO);
    }

    #[test]
    fn headroom_adds_percentage() {
        assert_eq!(Cost { gas_limit: 100_000 }.with_headroom(20).gas_limit, 120_000);
        assert_eq!(Cost { gas_limit: u64::MAX }.with_headroom(20).gas_limit, u64::MAX);
    }

    #[test]
    fn payload_differs_by_nonce() {
        assert_ne!(
            signed(1).unsigned.signing_payload(),
            signed(2).unsigned.signing_payload()
        );
    }

    #[test]
    fn hash_is_deterministic_and_nonce_bound() {
        assert_eq!(signed(1).hash(), signed(1).hash());
        assert_ne!(signed(1).hash(), signed(2).hash());
    }

    #[test]
    fn valid_signature_verifies() {
        signed(0).verify().unwrap();
    }

    #[test]
    fn tampered_call_fails_verification() {
        let mut call = signed(0);
        call.unsigned.call = LedgerCall::Purchase {
            asset_id: AssetId(1),
            price: Wei(1),
        };
        assert!(matches!(call.verify(), Err(EscrowError::SigningFailed(_))));
    }

    #[test]
    fn foreign_sender_fails_verification() {
        let mut call = signed(0);
        call.unsigned.from = WalletAddress([3; 20]);
        assert!(matches!(call.verify(), Err(EscrowError::SigningFailed(_))));
    }
}
