//! Drive one sale end to end against the simulated ledger.
//!
//! ```text
//! escrowd-sim [config.json]
//! ```
//!
//! Registers an asset, lists it, buys it, waits for the escrow to confirm,
//! releases it to the seller, and prints the final transaction as JSON.

use std::time::Duration;

use escrowd_coordinator::{DevStack, telemetry};
use escrowd_types::{
    CoordinatorConfig, EscrowError, Result, Transaction, TransactionId, TransactionState, Wei,
};
use rust_decimal::Decimal;
use tokio::sync::watch;

const MINE_INTERVAL: Duration = Duration::from_millis(250);
const SETTLE_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config()?;
    telemetry::init(&config.log)?;

    let stack = DevStack::new(&config)?;
    let seller = stack.keyring.generate()?;
    let buyer = stack.keyring.generate()?;
    tracing::info!(seller = %seller, buyer = %buyer, "parties generated");

    let (stop, shutdown) = watch::channel(false);
    let miner = stack
        .ledger
        .clone()
        .spawn_miner(MINE_INTERVAL, shutdown.clone());
    let workers = stack
        .coordinator
        .reconciliation_loop()
        .spawn_workers(shutdown);

    let price = Wei::from_ether(Decimal::new(15, 1))?;
    let coordinator = &stack.coordinator;
    let asset = coordinator.register_asset("Nyan", seller, price)?;
    coordinator.list_asset(asset.id, price).await?;
    tokio::time::sleep(MINE_INTERVAL * 2).await;

    let tx = coordinator.purchase(asset.id, buyer).await?;
    if tx.state == TransactionState::Failed {
        return Err(EscrowError::Internal(format!(
            "purchase {} failed: {:?}",
            tx.id, tx.last_error
        )));
    }
    wait_for(&stack, tx.id, TransactionState::Confirmed).await?;

    coordinator.complete(tx.id).await?;
    let done = wait_for(&stack, tx.id, TransactionState::Completed).await?;

    let _ = stop.send(true);
    let _ = miner.await;
    for worker in workers {
        let _ = worker.await;
    }

    println!("{}", serde_json::to_string_pretty(&done)?);
    tracing::info!(
        seller_balance = %stack.ledger.balance(seller),
        owner = ?stack.ledger.owner_of(asset.id),
        "sale settled"
    );
    Ok(())
}

fn load_config() -> Result<CoordinatorConfig> {
    match std::env::args().nth(1) {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| EscrowError::Configuration(format!("{path}: {e}")))?;
            CoordinatorConfig::from_json_str(&raw)
        }
        None => Ok(CoordinatorConfig::default()),
    }
}

async fn wait_for(
    stack: &DevStack,
    id: TransactionId,
    target: TransactionState,
) -> Result<Transaction> {
    let poll = async {
        loop {
            let tx = stack.coordinator.get_transaction(id)?;
            if tx.state == target {
                return Ok(tx);
            }
            if tx.is_terminal() {
                return Err(EscrowError::InvalidState {
                    id,
                    expected: "a live transaction",
                    actual: tx.state,
                });
            }
            tokio::time::sleep(MINE_INTERVAL).await;
        }
    };
    tokio::time::timeout(SETTLE_TIMEOUT, poll)
        .await
        .map_err(|_| EscrowError::Internal(format!("{id} did not reach {target} in time")))?
}
