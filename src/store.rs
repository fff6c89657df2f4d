//! Persistent tracking of settlement transactions.
//!
//! The settler writes a [`TransactionRecord`] after every broadcast and the
//! finality confirmer sweeps the non-terminal ones until they confirm or
//! fail. Deployments without a database run without a store, which disables
//! the sweep.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::Row;
use std::str::FromStr;
use std::sync::Mutex;

use crate::registry::Network;
use crate::types::SettlementStatus;

/// One tracked settlement transaction.
///
/// `tx_hash_fee` is set only by the relayer strategy, which settles the
/// merchant and treasury legs in separate transactions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecord {
    pub id: String,
    pub tx_hash: String,
    pub tx_hash_fee: Option<String>,
    pub chain: Network,
    pub status: SettlementStatus,
    pub confirmations: u64,
    pub confirmed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("corrupt transaction record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

/// Store of settlement transactions, safe for concurrent access.
///
/// Status transitions are monotonic: terminal records (`confirmed`,
/// `failed`) are never updated again; implementations enforce this.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    async fn insert(&self, record: &TransactionRecord) -> Result<(), StoreError>;

    /// Non-terminal records in insertion order, up to `limit`.
    async fn fetch_open(&self, limit: i64) -> Result<Vec<TransactionRecord>, StoreError>;

    async fn update_confirmations(&self, id: &str, confirmations: u64) -> Result<(), StoreError>;

    async fn mark_terminal(
        &self,
        id: &str,
        status: SettlementStatus,
        confirmations: u64,
        confirmed_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

/// Postgres-backed [`TransactionStore`].
pub struct PgTransactionStore {
    pool: PgPool,
}

impl PgTransactionStore {
    /// Connect and ensure the `transactions` table exists.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS transactions (
                id TEXT PRIMARY KEY,
                tx_hash TEXT NOT NULL,
                tx_hash_fee TEXT,
                chain TEXT NOT NULL,
                status TEXT NOT NULL,
                confirmations BIGINT NOT NULL DEFAULT 0,
                confirmed_at TIMESTAMPTZ
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS transactions_status_idx ON transactions (status)")
            .execute(&pool)
            .await?;
        tracing::info!("Connected to transaction store");
        Ok(Self { pool })
    }

    fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<TransactionRecord, StoreError> {
        let id: String = row.try_get("id")?;
        let chain_slug: String = row.try_get("chain")?;
        let status_text: String = row.try_get("status")?;
        let chain = Network::from_str(&chain_slug).map_err(|e| StoreError::Corrupt {
            id: id.clone(),
            reason: e.to_string(),
        })?;
        let status = SettlementStatus::from_str(&status_text).map_err(|e| StoreError::Corrupt {
            id: id.clone(),
            reason: e.to_string(),
        })?;
        let confirmations: i64 = row.try_get("confirmations")?;
        Ok(TransactionRecord {
            tx_hash: row.try_get("tx_hash")?,
            tx_hash_fee: row.try_get("tx_hash_fee")?,
            confirmed_at: row.try_get("confirmed_at")?,
            chain,
            status,
            confirmations: confirmations.max(0) as u64,
            id,
        })
    }
}

#[async_trait]
impl TransactionStore for PgTransactionStore {
    async fn insert(&self, record: &TransactionRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO transactions (id, tx_hash, tx_hash_fee, chain, status, confirmations, confirmed_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(&record.id)
        .bind(&record.tx_hash)
        .bind(&record.tx_hash_fee)
        .bind(record.chain.slug())
        .bind(record.status.to_string())
        .bind(record.confirmations as i64)
        .bind(record.confirmed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_open(&self, limit: i64) -> Result<Vec<TransactionRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, tx_hash, tx_hash_fee, chain, status, confirmations, confirmed_at
             FROM transactions
             WHERE status IN ('pending', 'partial_settlement')
             ORDER BY id
             LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::record_from_row).collect()
    }

    async fn update_confirmations(&self, id: &str, confirmations: u64) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE transactions SET confirmations = $2
             WHERE id = $1 AND status IN ('pending', 'partial_settlement')",
        )
        .bind(id)
        .bind(confirmations as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_terminal(
        &self,
        id: &str,
        status: SettlementStatus,
        confirmations: u64,
        confirmed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE transactions SET status = $2, confirmations = $3, confirmed_at = $4
             WHERE id = $1 AND status IN ('pending', 'partial_settlement')",
        )
        .bind(id)
        .bind(status.to_string())
        .bind(confirmations as i64)
        .bind(confirmed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// In-memory [`TransactionStore`] for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryTransactionStore {
    records: Mutex<Vec<TransactionRecord>>,
}

impl MemoryTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a record by id.
    pub fn get(&self, id: &str) -> Option<TransactionRecord> {
        self.records
            .lock()
            .expect("store lock")
            .iter()
            .find(|record| record.id == id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("store lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TransactionStore for MemoryTransactionStore {
    async fn insert(&self, record: &TransactionRecord) -> Result<(), StoreError> {
        let mut records = self.records.lock().expect("store lock");
        if records.iter().any(|existing| existing.id == record.id) {
            return Ok(());
        }
        records.push(record.clone());
        Ok(())
    }

    async fn fetch_open(&self, limit: i64) -> Result<Vec<TransactionRecord>, StoreError> {
        let records = self.records.lock().expect("store lock");
        Ok(records
            .iter()
            .filter(|record| !record.status.is_terminal())
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn update_confirmations(&self, id: &str, confirmations: u64) -> Result<(), StoreError> {
        let mut records = self.records.lock().expect("store lock");
        if let Some(record) = records
            .iter_mut()
            .find(|record| record.id == id && !record.status.is_terminal())
        {
            record.confirmations = confirmations;
        }
        Ok(())
    }

    async fn mark_terminal(
        &self,
        id: &str,
        status: SettlementStatus,
        confirmations: u64,
        confirmed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut records = self.records.lock().expect("store lock");
        if let Some(record) = records
            .iter_mut()
            .find(|record| record.id == id && !record.status.is_terminal())
        {
            record.status = status;
            record.confirmations = confirmations;
            record.confirmed_at = Some(confirmed_at);
        }
        Ok(())
    }
}
