//! # escrowd-coordinator
//!
//! Turns a purchase intent into a safely sequenced ledger operation, tracks
//! its confirmation, and folds the result back into the durable store.
//!
//! ## Components (leaves first)
//!
//! - [`AvailabilityLock`]: at most one active transaction per asset
//! - [`EscrowStateMachine`]: `create`, `submit`, `reconcile`, `finalize`, `cancel`
//! - [`ReconciliationLoop`]: background re-polling of in-flight transactions
//! - [`RecoveryScan`]: restart repair of rows and locks a crash left behind
//! - [`Coordinator`]: the facade an API layer calls
//!
//! ## Data flow
//!
//! ```text
//! Coordinator ─▶ AvailabilityLock ─▶ EscrowStateMachine ─▶ LedgerClient (send)
//!                                          ▲
//! ReconciliationLoop ─────────────────────┘  LedgerClient (poll) ─▶ receipt ─▶ release
//! ```

pub mod availability;
pub mod coordinator;
pub mod reconciler;
pub mod recovery;
pub mod state_machine;
pub mod telemetry;

pub use availability::AvailabilityLock;
pub use coordinator::{Coordinator, DevStack};
pub use reconciler::{ReconciliationLoop, SweepReport};
pub use recovery::{RecoveryReport, RecoveryScan};
pub use state_machine::EscrowStateMachine;
