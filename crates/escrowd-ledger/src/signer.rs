//! Signer resolution.
//!
//! The coordinator never holds keys itself. It asks a [`SignerResolver`] for
//! the [`Signer`] behind a wallet identity and hands it an [`UnsignedCall`].
//! Custody lives wherever the resolver is implemented.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use ed25519_dalek::{Signer as _, SigningKey};
use escrowd_types::{EscrowError, Result, SignedCall, UnsignedCall, WalletAddress};
use rand::rngs::OsRng;

/// Produces signatures for one wallet identity.
pub trait Signer: Send + Sync {
    fn address(&self) -> WalletAddress;

    /// Sign `call`.
    ///
    /// # Errors
    /// `SigningFailed` if `call.from` is not this signer's address or the
    /// signature cannot be produced.
    fn sign(&self, call: UnsignedCall) -> Result<SignedCall>;
}

/// Maps a wallet identity to the signer that acts for it.
pub trait SignerResolver: Send + Sync {
    /// # Errors
    /// `SignerNotFound` if no signer is registered for `address`.
    fn resolve(&self, address: &WalletAddress) -> Result<Arc<dyn Signer>>;
}

// ---------------------------------------------------------------------------
// LocalKeySigner
// ---------------------------------------------------------------------------

/// Ed25519 key held in process memory.
pub struct LocalKeySigner {
    key: SigningKey,
    address: WalletAddress,
}

impl LocalKeySigner {
    #[must_use]
    pub fn new(key: SigningKey) -> Self {
        let address = WalletAddress::from_public_key(&key.verifying_key().to_bytes());
        Self { key, address }
    }

    /// Fresh key from the OS RNG.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(SigningKey::generate(&mut OsRng))
    }
}

impl Signer for LocalKeySigner {
    fn address(&self) -> WalletAddress {
        self.address
    }

    fn sign(&self, call: UnsignedCall) -> Result<SignedCall> {
        if call.from != self.address {
            return Err(EscrowError::SigningFailed(format!(
                "signer {} asked to sign for {}",
                self.address, call.from
            )));
        }
        let signature = self.key.sign(&call.signing_payload());
        Ok(SignedCall {
            public_key: self.key.verifying_key().to_bytes(),
            signature: signature.to_bytes().to_vec(),
            unsigned: call,
        })
    }
}

impl std::fmt::Debug for LocalKeySigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalKeySigner")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Keyring
// ---------------------------------------------------------------------------

/// In-memory [`SignerResolver`] keyed by address.
#[derive(Default)]
pub struct Keyring {
    signers: RwLock<HashMap<WalletAddress, Arc<dyn Signer>>>,
}

impl Keyring {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `signer` under its own address, replacing any previous one.
    ///
    /// # Errors
    /// `Internal` if the keyring lock is poisoned.
    pub fn insert(&self, signer: Arc<dyn Signer>) -> Result<WalletAddress> {
        let address = signer.address();
        self.signers
            .write()
            .map_err(|_| EscrowError::Internal("keyring lock poisoned".into()))?
            .insert(address, signer);
        tracing::debug!(address = %address, "signer registered");
        Ok(address)
    }

    /// Generate and register a fresh local key. Returns its address.
    ///
    /// # Errors
    /// `Internal` if the keyring lock is poisoned.
    pub fn generate(&self) -> Result<WalletAddress> {
        self.insert(Arc::new(LocalKeySigner::generate()))
    }
}

impl SignerResolver for Keyring {
    fn resolve(&self, address: &WalletAddress) -> Result<Arc<dyn Signer>> {
        self.signers
            .read()
            .map_err(|_| EscrowError::Internal("keyring lock poisoned".into()))?
            .get(address)
            .cloned()
            .ok_or(EscrowError::SignerNotFound(*address))
    }
}

#[cfg(test)]
mod tests {
    use escrowd_types::{AssetId, Cost, LedgerCall, Wei};

    use super::*;

    fn unsigned(from: WalletAddress) -> UnsignedCall {
        UnsignedCall {
            chain_id: 1337,
            from,
            nonce: 0,
            cost: Cost { gas_limit: 50_000 },
            call: LedgerCall::Purchase {
                asset_id: AssetId(1),
                price: Wei(500),
            },
        }
    }

    #[test]
    fn local_signer_produces_verifiable_call() {
        let signer = LocalKeySigner::new(SigningKey::from_bytes(&[7u8; 32]));
        let signed = signer.sign(unsigned(signer.address())).unwrap();
        signed.verify().unwrap();
    }

    #[test]
    fn signer_refuses_foreign_address() {
        let signer = LocalKeySigner::generate();
        let err = signer.sign(unsigned(WalletAddress::random())).unwrap_err();
        assert!(matches!(err, EscrowError::SigningFailed(_)));
    }

    #[test]
    fn keyring_resolves_registered_signers_only() {
        let keyring = Keyring::new();
        let address = keyring.generate().unwrap();

        assert_eq!(keyring.resolve(&address).unwrap().address(), address);
        let other = WalletAddress::random();
        assert!(matches!(
            keyring.resolve(&other),
            Err(EscrowError::SignerNotFound(a)) if a == other
        ));
    }
}
