//! Error types for the escrowd coordinator.
//!
//! All errors use the `ESC_ERR_` prefix convention for easy grepping in logs.
//! Error codes are grouped by subsystem:
//! - 1xx: Asset errors
//! - 2xx: Transaction / state machine errors
//! - 3xx: Ledger errors
//! - 4xx: Signer errors
//! - 9xx: General / internal errors

use thiserror::Error;

use crate::{AssetId, TransactionId, TransactionState, TxHash, WalletAddress};

/// Central error enum for all escrowd operations.
#[derive(Debug, Error)]
pub enum EscrowError {
    // =================================================================
    // Asset Errors (1xx)
    // =================================================================
    /// The asset does not exist in the durable store.
    #[error("ESC_ERR_100: Asset not found: {0}")]
    AssetNotFound(AssetId),

    /// The asset already has an active transaction, or has been sold.
    #[error("ESC_ERR_101: Asset unavailable: {0}")]
    AssetUnavailable(AssetId),

    /// The buyer already owns the asset.
    #[error("ESC_ERR_102: Self-purchase blocked: {buyer} already owns {asset}")]
    SelfPurchase { asset: AssetId, buyer: WalletAddress },

    // =================================================================
    // Transaction Errors (2xx)
    // =================================================================
    /// The requested transaction was not found.
    #[error("ESC_ERR_200: Transaction not found: {0}")]
    TransactionNotFound(TransactionId),

    /// The transition is not legal from the transaction's current state.
    #[error("ESC_ERR_201: Invalid state for {id}: expected {expected}, got {actual}")]
    InvalidState {
        id: TransactionId,
        expected: &'static str,
        actual: TransactionState,
    },

    // =================================================================
    // Ledger Errors (3xx)
    // =================================================================
    /// Pre-flight estimation says the call would fail on-ledger.
    #[error("ESC_ERR_300: Cost estimation failed: {reason}")]
    EstimationError { reason: String },

    /// The node could not be reached or refused the call before acceptance.
    #[error("ESC_ERR_301: Send failed: {reason}")]
    SendError { reason: String },

    /// The call was mined but reverted, or its receipt could not be decoded.
    #[error("ESC_ERR_302: Receipt failure for {hash}: {reason}")]
    ReceiptFailure { hash: TxHash, reason: String },

    /// No receipt arrived within the reconciliation attempt budget.
    #[error("ESC_ERR_303: No receipt for {hash} after {attempts} polls")]
    ReconciliationTimeout { hash: TxHash, attempts: u32 },

    /// The node could not be reached while polling for a receipt.
    #[error("ESC_ERR_304: Ledger unavailable: {reason}")]
    LedgerUnavailable { reason: String },

    // =================================================================
    // Signer Errors (4xx)
    // =================================================================
    /// No signer is registered for the wallet identity.
    #[error("ESC_ERR_400: No signer for {0}")]
    SignerNotFound(WalletAddress),

    /// The signer refused or failed to produce a signature.
    #[error("ESC_ERR_401: Signing failed: {0}")]
    SigningFailed(String),

    /// A wallet address could not be parsed.
    #[error("ESC_ERR_402: Invalid address: {0}")]
    InvalidAddress(String),

    // =================================================================
    // General / Internal (9xx)
    // =================================================================
    /// Unrecoverable internal error.
    #[error("ESC_ERR_900: Internal error: {0}")]
    Internal(String),

    /// Serialization / deserialization error.
    #[error("ESC_ERR_901: Serialization error: {0}")]
    Serialization(String),

    /// Configuration error (invalid config file, out-of-range values, etc.).
    #[error("ESC_ERR_902: Configuration error: {0}")]
    Configuration(String),

    /// The durable store failed to execute an operation.
    #[error("ESC_ERR_903: Storage error: {0}")]
    Storage(String),
}

impl EscrowError {
    /// Request-time validation errors: surfaced synchronously, never retried.
    #[must_use]
    pub fn is_request_error(&self) -> bool {
        matches!(
            self,
            Self::AssetNotFound(_)
                | Self::AssetUnavailable(_)
                | Self::SelfPurchase { .. }
                | Self::TransactionNotFound(_)
                | Self::InvalidState { .. }
                | Self::SignerNotFound(_)
        )
    }
}

/// Crate-wide `Result` alias.
pub type Result<T> = std::result::Result<T, EscrowError>;

impl From<serde_json::Error> for EscrowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
