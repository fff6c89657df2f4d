//! Finality confirmer.
//!
//! A long-lived task that sweeps the transaction store on a fixed cadence and
//! drives non-terminal settlement records toward `confirmed` or `failed`.
//! Each sweep reads the receipts and head block through the public client of
//! the record's chain; a record that reaches the network's required
//! confirmation depth is finalized with `confirmed_at = now`. Relayer records
//! carry two legs, and only a settlement whose merchant and fee transfers
//! both landed successfully may finalize as `confirmed`. Per-record failures
//! are logged and never abort the sweep.

use chrono::Utc;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::chain::{ChainError, EvmGateway, ReceiptInfo};
use crate::registry::{Registry, RegistryError};
use crate::store::{StoreError, TransactionRecord, TransactionStore};
use crate::types::{SettlementStatus, TransactionHash};

/// Sweep cadence. A missed tick never queues a second sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
/// Records fetched per sweep.
const SWEEP_BATCH: i64 = 50;

#[derive(Debug, thiserror::Error)]
enum SweepError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("record carries a malformed transaction hash: {0}")]
    BadHash(String),
}

/// Background sweeper over pending settlement transactions.
pub struct FinalityConfirmer {
    registry: Arc<Registry>,
    store: Arc<dyn TransactionStore>,
}

impl FinalityConfirmer {
    pub fn new(registry: Arc<Registry>, store: Arc<dyn TransactionStore>) -> Self {
        Self { registry, store }
    }

    /// Spawn the confirmer loop. The first sweep runs immediately; the loop
    /// drains cleanly when `shutdown` fires.
    pub fn spawn(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("finality confirmer shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.sweep().await;
                    }
                }
            }
        })
    }

    /// Run one sweep over up to [`SWEEP_BATCH`] non-terminal records.
    #[instrument(skip_all)]
    pub async fn sweep(&self) {
        let records = match self.store.fetch_open(SWEEP_BATCH).await {
            Ok(records) => records,
            Err(e) => {
                tracing::error!(error = %e, "failed to fetch pending transactions");
                return;
            }
        };
        for record in records {
            if let Err(e) = self.advance(&record).await {
                tracing::warn!(
                    id = %record.id,
                    tx = %record.tx_hash,
                    error = %e,
                    "failed to advance transaction record"
                );
            }
        }
    }

    /// Re-read one record's confirmations and persist its progress.
    ///
    /// A record with a fee leg (relayer settlement) finalizes only once both
    /// legs are mined at depth, and as `confirmed` only when both succeeded;
    /// a `partial_settlement` therefore never silently upgrades on the back
    /// of the merchant leg alone.
    async fn advance(&self, record: &TransactionRecord) -> Result<(), SweepError> {
        let client = self.registry.public_client(record.chain)?;

        let Some(receipt) = leg_receipt(client, &record.tx_hash).await? else {
            tracing::debug!(id = %record.id, tx = %record.tx_hash, "transaction not yet mined");
            return Ok(());
        };
        let fee_receipt = match &record.tx_hash_fee {
            Some(fee_hash) => match leg_receipt(client, fee_hash).await? {
                Some(fee_receipt) => Some(fee_receipt),
                None => {
                    tracing::debug!(id = %record.id, tx = %fee_hash, "fee transaction not yet mined");
                    return Ok(());
                }
            },
            None => None,
        };

        let current_block = client.block_number().await?;
        // Depth is measured from the shallowest leg.
        let mined_at = fee_receipt
            .map(|leg| leg.block_number.max(receipt.block_number))
            .unwrap_or(receipt.block_number);
        let confirmations = current_block.saturating_sub(mined_at);
        let required = self.registry.confirmations_of(record.chain)?;

        if confirmations >= required {
            let success = receipt.success && fee_receipt.map(|leg| leg.success).unwrap_or(true);
            let status = if success {
                SettlementStatus::Confirmed
            } else {
                SettlementStatus::Failed
            };
            self.store
                .mark_terminal(&record.id, status, confirmations, Utc::now())
                .await?;
            tracing::info!(
                id = %record.id,
                tx = %record.tx_hash,
                %status,
                confirmations,
                "transaction finalized"
            );
        } else {
            self.store
                .update_confirmations(&record.id, confirmations)
                .await?;
        }
        Ok(())
    }
}

async fn leg_receipt(
    client: &Arc<dyn EvmGateway>,
    tx_hash: &str,
) -> Result<Option<ReceiptInfo>, SweepError> {
    let hash =
        TransactionHash::from_str(tx_hash).map_err(|_| SweepError::BadHash(tx_hash.to_string()))?;
    Ok(client.receipt(hash).await?)
}
