//! # escrowd-ledger
//!
//! Everything between the coordinator and the external ledger:
//!
//! - [`Signer`] / [`SignerResolver`]: wallet identity to signing key, with
//!   [`LocalKeySigner`] and the in-memory [`Keyring`]
//! - [`NonceManager`]: one serialization point per signer
//! - [`LedgerNode`]: the raw node transport
//! - [`LedgerClient`]: `estimate_cost`, `send`, `poll`
//! - [`SimulatedLedger`]: an in-process node running the escrow contract,
//!   with fault injection

pub mod client;
pub mod node;
pub mod nonce;
pub mod signer;
pub mod sim;

pub use client::LedgerClient;
pub use node::LedgerNode;
pub use nonce::{NonceLease, NonceManager};
pub use signer::{Keyring, LocalKeySigner, Signer, SignerResolver};
pub use sim::{EscrowRecord, EscrowStatus, SimulatedLedger};
