//! # Ledger Client
//!
//! The only component that talks to the ledger. Three operations:
//!
//! - [`LedgerClient::estimate_cost`]: dry run plus configured headroom.
//! - [`LedgerClient::send`]: resolve signer, take the signer's nonce slot,
//!   sign, submit, return the external hash as soon as the node accepts.
//! - [`LedgerClient::poll`]: non-blocking receipt check.
//!
//! `send` and `poll` are deliberately separate. The hash returned by `send`
//! is persisted before anything waits on it, so a restarted coordinator
//! resumes polling instead of re-submitting.

use std::sync::Arc;

use escrowd_types::{
    Cost, EscrowError, LedgerCall, LedgerConfig, PollStatus, Result, TxHash, UnsignedCall,
    WalletAddress,
};

use crate::{LedgerNode, NonceManager, SignerResolver};

pub struct LedgerClient {
    node: Arc<dyn LedgerNode>,
    signers: Arc<dyn SignerResolver>,
    nonces: NonceManager,
    config: LedgerConfig,
}

impl LedgerClient {
    #[must_use]
    pub fn new(
        node: Arc<dyn LedgerNode>,
        signers: Arc<dyn SignerResolver>,
        config: LedgerConfig,
    ) -> Self {
        Self {
            node,
            signers,
            nonces: NonceManager::new(),
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Fail fast if no signer acts for `address`.
    ///
    /// # Errors
    /// `SignerNotFound`.
    pub fn ensure_signer(&self, address: &WalletAddress) -> Result<()> {
        self.signers.resolve(address).map(|_| ())
    }

    /// Size the resource budget for `call`.
    ///
    /// # Errors
    /// `EstimationError` if the call would revert; `SendError` if the node
    /// cannot be reached.
    pub async fn estimate_cost(&self, from: WalletAddress, call: &LedgerCall) -> Result<Cost> {
        match self.node.estimate_cost(from, call).await {
            Ok(cost) => {
                let cost = cost.with_headroom(self.config.gas_headroom_pct);
                tracing::debug!(call = call.name(), from = %from, gas = cost.gas_limit, "cost estimated");
                Ok(cost)
            }
            Err(e @ EscrowError::EstimationError { .. }) => {
                tracing::warn!(call = call.name(), from = %from, error = %e, "estimation rejected call");
                Err(e)
            }
            Err(e) => Err(EscrowError::SendError {
                reason: e.to_string(),
            }),
        }
    }

    /// Sign and submit `call` as `from`. Returns once the node has accepted
    /// the call into its pending pool.
    ///
    /// The signer's nonce slot is held from nonce selection until the node
    /// answers. A rejected submission drops the cached nonce so the next
    /// send re-reads it from the node.
    ///
    /// # Errors
    /// `SignerNotFound` / `SigningFailed` from the signer, `SendError` for
    /// every node-side failure before acceptance.
    pub async fn send(&self, from: WalletAddress, call: &LedgerCall, cost: Cost) -> Result<TxHash> {
        let signer = self.signers.resolve(&from)?;
        let lease = self.nonces.lease(from).await?;

        let nonce = match lease.cached() {
            Some(nonce) => nonce,
            None => self.node.next_nonce(from).await.map_err(as_send_error)?,
        };

        let signed = signer.sign(UnsignedCall {
            chain_id: self.config.chain_id,
            from,
            nonce,
            cost,
            call: call.clone(),
        })?;
        let local_hash = signed.hash();

        let hash = self.node.submit(&signed).await.map_err(|e| {
            tracing::warn!(call = call.name(), from = %from, nonce, error = %e, "submission rejected");
            as_send_error(e)
        })?;
        lease.commit(nonce);

        if hash != local_hash {
            tracing::warn!(
                local = %local_hash,
                node = %hash,
                "node reported a different hash than the signed payload"
            );
        }
        tracing::info!(call = call.name(), from = %from, nonce, hash = %hash.short(), "call submitted");
        Ok(hash)
    }

    /// Check whether `hash` has been mined.
    ///
    /// # Errors
    /// `LedgerUnavailable` if the node cannot be reached.
    pub async fn poll(&self, hash: &TxHash) -> Result<PollStatus> {
        match self.node.receipt(hash).await {
            Ok(Some(receipt)) => Ok(PollStatus::Receipt(receipt)),
            Ok(None) => Ok(PollStatus::Pending),
            Err(e @ EscrowError::LedgerUnavailable { .. }) => Err(e),
            Err(e) => Err(EscrowError::LedgerUnavailable {
                reason: e.to_string(),
            }),
        }
    }
}

fn as_send_error(e: EscrowError) -> EscrowError {
    match e {
        EscrowError::SendError { .. } => e,
        other => EscrowError::SendError {
            reason: other.to_string(),
        },
    }
}
