//! # escrowd-store
//!
//! The durable-store seam of the coordinator. [`EscrowStore`] lists the
//! atomic steps the availability lock, state machine and reconciliation
//! loop need; [`MemoryStore`] implements them behind a single mutex.
//!
//! A relational backend maps each method onto one conditional statement
//! (`UPDATE .. WHERE state = $expected AND tx_hash = $expected_hash`) or one
//! short store-side transaction.

pub mod memory;
pub mod store;

pub use memory::MemoryStore;
pub use store::{ClaimRequest, EscrowStore};
