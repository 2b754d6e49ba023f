//! # escrowd-types
//!
//! Shared types, errors, and configuration for the **escrowd** coordinator.
//!
//! This crate is the leaf dependency of the workspace; every other crate
//! depends on it. It defines:
//!
//! - **Identifiers**: [`AssetId`], [`TransactionId`], [`EscrowId`], [`WalletAddress`], [`TxHash`], [`WorkerId`]
//! - **Asset model**: [`Asset`], [`NewAsset`], [`Wei`]
//! - **Transaction model**: [`Transaction`], [`TransactionState`], [`CallKind`], [`Outcome`], [`FailureReason`]
//! - **Compare-and-update**: [`TransactionGuard`], [`TransactionUpdate`], [`TransactionDraft`], [`Claim`]
//! - **Ledger calls**: [`LedgerCall`], [`Cost`], [`UnsignedCall`], [`SignedCall`]
//! - **Receipts**: [`LedgerReceipt`], [`PollStatus`], [`EventLog`], [`LedgerEvent`]
//! - **Configuration**: [`CoordinatorConfig`], [`LedgerConfig`], [`ReconcileConfig`], [`RecoveryConfig`], [`LogConfig`]
//! - **Errors**: [`EscrowError`] with `ESC_ERR_` prefix codes
//! - **Constants**: defaults and contract event names

pub mod asset;
pub mod call;
pub mod config;
pub mod constants;
pub mod error;
pub mod ids;
pub mod receipt;
pub mod transaction;

// Re-export all primary types at crate root for ergonomic imports:
//   use escrowd_types::{Transaction, TransactionState, LedgerCall, ...};

pub use asset::*;
pub use call::*;
pub use config::*;
pub use error::*;
pub use ids::*;
pub use receipt::*;
pub use transaction::*;

// Constants are accessed via `escrowd_types::constants::FOO`
// (not re-exported to avoid name collisions).
