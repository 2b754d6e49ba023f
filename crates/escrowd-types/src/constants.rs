//! System-wide constants for the escrowd coordinator.

/// Fractional digits between one ether and one wei.
pub const WEI_DECIMALS: u32 = 18;

/// Default chain id (local development chain).
pub const DEFAULT_CHAIN_ID: u64 = 1337;

/// Extra gas on top of the node's estimate, in percent.
pub const DEFAULT_GAS_HEADROOM_PCT: u64 = 20;

/// Default interval between reconciliation sweeps in milliseconds.
pub const DEFAULT_RECONCILE_INTERVAL_MS: u64 = 5_000;

/// Minimum age of a `Submitted` row before a sweep picks it up, in milliseconds.
pub const DEFAULT_RECONCILE_MIN_AGE_MS: u64 = 1_000;

/// Polls without a receipt before a transaction is abandoned.
pub const DEFAULT_MAX_POLL_ATTEMPTS: u32 = 30;

/// Rows claimed per sweep.
pub const DEFAULT_SWEEP_BATCH_SIZE: usize = 64;

/// How long a worker's claim on a row stays valid, in milliseconds.
pub const DEFAULT_CLAIM_LEASE_MS: u64 = 60_000;

/// Concurrent reconciliation workers.
pub const DEFAULT_RECONCILE_WORKERS: usize = 1;

/// A row still without a recorded hash after this long is recovered.
pub const DEFAULT_STALE_UNSENT_MS: u64 = 600_000;

/// Period of the recovery pass while reconciliation workers run.
pub const DEFAULT_RECOVERY_INTERVAL_MS: u64 = 60_000;

/// Default tracing level when `ESCROWD_LOG` is unset.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Environment variable consulted for the tracing filter.
pub const LOG_ENV_VAR: &str = "ESCROWD_LOG";

/// Escrow contract event names.
pub const EVENT_ASSET_LISTED: &str = "AssetListed";
pub const EVENT_ASSET_PURCHASED: &str = "AssetPurchased";
pub const EVENT_TRANSACTION_COMPLETED: &str = "TransactionCompleted";
pub const EVENT_TRANSACTION_CANCELLED: &str = "TransactionCancelled";

/// Escrow contract event argument names.
pub const ARG_ASSET_ID: &str = "assetId";
pub const ARG_TRANSACTION_ID: &str = "transactionId";
pub const ARG_OWNER: &str = "owner";
pub const ARG_BUYER: &str = "buyer";
pub const ARG_SELLER: &str = "seller";
pub const ARG_PRICE: &str = "price";

/// Version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
