//! Per-signer nonce serialization.
//!
//! Each signer address owns one async slot. A send takes the slot as a
//! [`NonceLease`], picks the nonce (cached, or read from the node when the
//! cache is empty), and keeps the lease until the node has accepted or
//! rejected the call. Two sends from the same signer therefore never race
//! for the same nonce; sends from different signers never wait on each
//! other.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use escrowd_types::{EscrowError, Result, WalletAddress};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Slot = Arc<AsyncMutex<Option<u64>>>;

/// Serialization point for nonce assignment, one slot per signer.
#[derive(Default)]
pub struct NonceManager {
    slots: Mutex<HashMap<WalletAddress, Slot>>,
}

impl NonceManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive use of `address`'s nonce slot.
    ///
    /// # Errors
    /// `Internal` if the slot table lock is poisoned.
    pub async fn lease(&self, address: WalletAddress) -> Result<NonceLease> {
        let slot = {
            let mut slots = self
                .slots
                .lock()
                .map_err(|_| EscrowError::Internal("nonce table poisoned".into()))?;
            Arc::clone(slots.entry(address).or_default())
        };
        Ok(NonceLease {
            address,
            guard: slot.lock_owned().await,
            committed: false,
        })
    }
}

/// Exclusive hold on one signer's next nonce.
///
/// Dropping a lease without [`NonceLease::commit`] forgets the cached value,
/// so the next send re-reads the nonce from the node.
pub struct NonceLease {
    address: WalletAddress,
    guard: OwnedMutexGuard<Option<u64>>,
    committed: bool,
}

impl NonceLease {
    /// The next nonce, if known locally.
    #[must_use]
    pub fn cached(&self) -> Option<u64> {
        *self.guard
    }

    /// Record that `used` was accepted by the node.
    pub fn commit(mut self, used: u64) {
        *self.guard = Some(used.saturating_add(1));
        self.committed = true;
        tracing::trace!(address = %self.address, nonce = used, "nonce committed");
    }
}

impl Drop for NonceLease {
    fn drop(&mut self) {
        if !self.committed {
            *self.guard = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn commit_advances_cache() {
        let nonces = NonceManager::new();
        let addr = WalletAddress::random();

        let lease = nonces.lease(addr).await.unwrap();
        assert_eq!(lease.cached(), None);
        lease.commit(4);

        assert_eq!(nonces.lease(addr).await.unwrap().cached(), Some(5));
    }

    #[tokio::test]
    async fn dropped_lease_forgets_cache() {
        let nonces = NonceManager::new();
        let addr = WalletAddress::random();
        nonces.lease(addr).await.unwrap().commit(0);

        drop(nonces.lease(addr).await.unwrap());
        assert_eq!(nonces.lease(addr).await.unwrap().cached(), None);
    }

    #[tokio::test]
    async fn same_signer_waits_other_signer_does_not() {
        let nonces = Arc::new(NonceManager::new());
        let (a, b) = (WalletAddress::random(), WalletAddress::random());

        let held = nonces.lease(a).await.unwrap();

        let other = tokio::time::timeout(Duration::from_millis(100), nonces.lease(b)).await;
        assert!(other.is_ok(), "a different signer must not block");

        let same = tokio::time::timeout(Duration::from_millis(50), nonces.lease(a)).await;
        assert!(same.is_err(), "the same signer must wait");

        held.commit(0);
        assert_eq!(nonces.lease(a).await.unwrap().cached(), Some(1));
    }
}
