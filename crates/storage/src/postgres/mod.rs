//! PostgreSQL storage adapter.
//!
//! This module implements the ledger ports defined in `virement-core`
//! using PostgreSQL as the backing store.
//!
//! # Architecture
//!
//! - [`Database`] - Connection pool and migrations
//! - [`PgLedger`] - Composite implementing the `Ledger` trait with its
//!   atomic multi-table operations
//! - Individual repos: `PgTransactionRepository`, `PgBalanceRepository`,
//!   `PgCursorRepository`
//! - [`PgIdentityDirectory`] - Read-only adapter over the `users` table
//!
//! # Consistency
//!
//! Every operation that moves value runs as one SQL transaction: the
//! status write and both balance deltas commit together or not at all.
//! Idempotency and compare-and-swap guards live in the SQL itself
//! (`WHERE status = 'pending'`, `WHERE status <> 'completed'`), so two
//! racing writers are serialized by row locks and exactly one sees its
//! guard hold.

mod balance_repo;
mod cursor_repo;
mod database;
mod helpers;
mod identity_repo;
mod transaction_repo;

pub use balance_repo::PgBalanceRepository;
pub use cursor_repo::PgCursorRepository;
pub use database::{Database, DatabaseConfig};
pub use identity_repo::PgIdentityDirectory;
pub use transaction_repo::PgTransactionRepository;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Postgres, Transaction as SqlTransaction};

use virement_core::error::{StorageError, StorageResult};
use virement_core::models::{Transaction, TransactionStatus, TxHash, TxRef};
use virement_core::ports::{
    BalanceRepository, CompletedTransfer, CursorRepository, Ledger, RequestCompletion,
    TransactionRepository, TransferApplied,
};

use transaction_repo::{TransactionRow, TRANSACTION_COLUMNS};

// =============================================================================
// Composite Ledger
// =============================================================================

/// Aggregated PostgreSQL repositories implementing the `Ledger` trait.
pub struct PgLedger {
    db: Arc<Database>,
    transactions: PgTransactionRepository,
    balances: PgBalanceRepository,
    cursor: PgCursorRepository,
}

impl PgLedger {
    /// Create a new ledger aggregate from a database connection.
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            transactions: PgTransactionRepository::new(&db),
            balances: PgBalanceRepository::new(&db),
            cursor: PgCursorRepository::new(&db),
            db,
        }
    }

    async fn begin(&self) -> StorageResult<SqlTransaction<'_, Postgres>> {
        self.db
            .pool()
            .begin()
            .await
            .map_err(|e| StorageError::TransactionError(e.to_string()))
    }

    async fn fetch_row(
        tx: &mut SqlTransaction<'_, Postgres>,
        reference: &str,
    ) -> StorageResult<Transaction> {
        let query =
            format!("SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE reference = $1");
        let row = sqlx::query_as::<_, TransactionRow>(&query)
            .bind(reference)
            .fetch_one(&mut **tx)
            .await
            .map_err(|e| StorageError::QueryError(e.to_string()))?;
        row.into_transaction()
    }

    async fn fetch_row_by_hash(
        tx: &mut SqlTransaction<'_, Postgres>,
        tx_hash: &TxHash,
    ) -> StorageResult<Transaction> {
        let query = format!("SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE tx_hash = $1");
        let row = sqlx::query_as::<_, TransactionRow>(&query)
            .bind(&tx_hash.0[..])
            .fetch_one(&mut **tx)
            .await
            .map_err(|e| StorageError::QueryError(e.to_string()))?;
        row.into_transaction()
    }
}

#[async_trait]
impl Ledger for PgLedger {
    fn transactions(&self) -> &dyn TransactionRepository {
        &self.transactions
    }

    fn balances(&self) -> &dyn BalanceRepository {
        &self.balances
    }

    fn cursor(&self) -> &dyn CursorRepository {
        &self.cursor
    }

    async fn insert_transaction(&self, transaction: &Transaction) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO transactions (
                reference, tx_hash, kind, status, from_handle, to_handle,
                from_address, to_address, amount, memo,
                block_number, gas_used, gas_price,
                expires_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9::NUMERIC, $10,
                    $11, $12::NUMERIC, $13::NUMERIC, $14, $15, $16)
            "#,
        )
        .bind(transaction.reference.to_string())
        .bind(transaction.tx_hash.map(|h| h.0.to_vec()))
        .bind(transaction.kind.as_str())
        .bind(transaction.status.as_str())
        .bind(transaction.from_handle.as_str())
        .bind(transaction.to_handle.as_str())
        .bind(&transaction.from_address.0[..])
        .bind(&transaction.to_address.0[..])
        .bind(transaction.amount.base_units().to_string())
        .bind(&transaction.memo)
        .bind(transaction.block_number.map(|n| n as i64))
        .bind(transaction.gas_used.map(|g| g.to_string()))
        .bind(transaction.gas_price.map(|g| g.to_string()))
        .bind(transaction.expires_at)
        .bind(transaction.created_at)
        .bind(transaction.updated_at)
        .execute(self.db.pool())
        .await
        .map_err(map_insert_error)?;

        Ok(())
    }

    async fn apply_completed_transfer(
        &self,
        record: &CompletedTransfer,
    ) -> StorageResult<TransferApplied> {
        let mut tx = self.begin().await?;
        let now = Utc::now();

        // Complete the existing row carrying this hash (a Submitted
        // send), or detect that the hash is already fully recorded.
        let updated = sqlx::query(
            r#"
            UPDATE transactions
            SET status = 'completed', block_number = $2,
                gas_used = $3::NUMERIC, gas_price = $4::NUMERIC, updated_at = $5
            WHERE tx_hash = $1 AND status <> 'completed'
            "#,
        )
        .bind(&record.tx_hash.0[..])
        .bind(record.block_number as i64)
        .bind(record.gas_used.map(|g| g.to_string()))
        .bind(record.gas_price.map(|g| g.to_string()))
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| StorageError::QueryError(e.to_string()))?
        .rows_affected();

        if updated == 0 {
            let (exists,): (bool,) =
                sqlx::query_as("SELECT EXISTS(SELECT 1 FROM transactions WHERE tx_hash = $1)")
                    .bind(&record.tx_hash.0[..])
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(|e| StorageError::QueryError(e.to_string()))?;

            if exists {
                tx.rollback()
                    .await
                    .map_err(|e| StorageError::TransactionError(e.to_string()))?;
                return Ok(TransferApplied::Duplicate);
            }

            // First sighting of this hash: insert the completed row.
            // A unique violation here means a concurrent writer won the
            // insert race, which is just another duplicate.
            if let Err(err) = insert_completed_row(&mut tx, record, now).await {
                return match err {
                    StorageError::ConstraintViolation(_) => Ok(TransferApplied::Duplicate),
                    other => Err(other),
                };
            }
        }

        apply_balance_deltas(&mut tx, record, now).await?;

        let transaction = Self::fetch_row_by_hash(&mut tx, &record.tx_hash).await?;
        tx.commit()
            .await
            .map_err(|e| StorageError::TransactionError(e.to_string()))?;

        Ok(TransferApplied::Applied(transaction))
    }

    async fn complete_request(
        &self,
        reference: &TxRef,
        outcome: &CompletedTransfer,
    ) -> StorageResult<RequestCompletion> {
        let mut tx = self.begin().await?;
        let now = Utc::now();

        // If the synchronizer observed the fulfillment event first, a
        // standalone completed row exists for the hash and the balance
        // deltas are already applied. Absorb that row into the request.
        let placeholder: Option<(String,)> =
            sqlx::query_as("SELECT status FROM transactions WHERE tx_hash = $1 FOR UPDATE")
                .bind(&outcome.tx_hash.0[..])
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| StorageError::QueryError(e.to_string()))?;
        let deltas_already_applied =
            matches!(&placeholder, Some((status,)) if status == "completed");
        if placeholder.is_some() {
            sqlx::query("DELETE FROM transactions WHERE tx_hash = $1")
                .bind(&outcome.tx_hash.0[..])
                .execute(&mut *tx)
                .await
                .map_err(|e| StorageError::QueryError(e.to_string()))?;
        }

        // Compare-and-swap the request row itself: Pending -> Completed
        // with the chain hash attached; the synthetic reference stays.
        let updated = sqlx::query(
            r#"
            UPDATE transactions
            SET tx_hash = $2, status = 'completed', block_number = $3,
                gas_used = $4::NUMERIC, gas_price = $5::NUMERIC, updated_at = $6
            WHERE reference = $1 AND status = 'pending'
            "#,
        )
        .bind(reference.to_string())
        .bind(&outcome.tx_hash.0[..])
        .bind(outcome.block_number as i64)
        .bind(outcome.gas_used.map(|g| g.to_string()))
        .bind(outcome.gas_price.map(|g| g.to_string()))
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| StorageError::QueryError(e.to_string()))?
        .rows_affected();

        if updated == 0 {
            // CAS lost. Roll back so an absorbed synchronizer row is
            // restored, then report what claimed the request.
            tx.rollback()
                .await
                .map_err(|e| StorageError::TransactionError(e.to_string()))?;

            let status: Option<(String,)> =
                sqlx::query_as("SELECT status FROM transactions WHERE reference = $1")
                    .bind(reference.to_string())
                    .fetch_optional(self.db.pool())
                    .await
                    .map_err(|e| StorageError::QueryError(e.to_string()))?;

            return match status {
                Some((status,)) => {
                    let status = TransactionStatus::parse(&status).ok_or_else(|| {
                        StorageError::SerializationError(format!(
                            "transactions.status: unknown {status:?}"
                        ))
                    })?;
                    Ok(RequestCompletion::Conflict(status))
                }
                None => Err(StorageError::NotFound(reference.to_string())),
            };
        }

        if !deltas_already_applied {
            apply_balance_deltas(&mut tx, outcome, now).await?;
        }

        let transaction = Self::fetch_row(&mut tx, &reference.to_string()).await?;
        tx.commit()
            .await
            .map_err(|e| StorageError::TransactionError(e.to_string()))?;

        Ok(RequestCompletion::Completed(transaction))
    }

    async fn transition_request(
        &self,
        reference: &TxRef,
        to: TransactionStatus,
    ) -> StorageResult<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE transactions
            SET status = $2, updated_at = $3
            WHERE reference = $1 AND kind = 'request' AND status = 'pending'
            "#,
        )
        .bind(reference.to_string())
        .bind(to.as_str())
        .bind(Utc::now())
        .execute(self.db.pool())
        .await
        .map_err(|e| StorageError::QueryError(e.to_string()))?
        .rows_affected();

        if updated == 1 {
            return Ok(true);
        }

        let (exists,): (bool,) =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM transactions WHERE reference = $1)")
                .bind(reference.to_string())
                .fetch_one(self.db.pool())
                .await
                .map_err(|e| StorageError::QueryError(e.to_string()))?;

        if exists {
            Ok(false)
        } else {
            Err(StorageError::NotFound(reference.to_string()))
        }
    }

    async fn expire_due_requests(&self, now: DateTime<Utc>) -> StorageResult<Vec<TxRef>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            UPDATE transactions
            SET status = 'expired', updated_at = $1
            WHERE kind = 'request' AND status = 'pending'
              AND expires_at IS NOT NULL AND expires_at <= $1
            RETURNING reference
            "#,
        )
        .bind(now)
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| StorageError::QueryError(e.to_string()))?;

        rows.into_iter()
            .map(|(reference,)| {
                TxRef::parse(&reference).ok_or_else(|| {
                    StorageError::SerializationError(format!(
                        "transactions.reference: unparseable {reference:?}"
                    ))
                })
            })
            .collect()
    }
}

// =============================================================================
// Shared write helpers
// =============================================================================

/// Insert a fresh `Completed` row from an observed transfer.
async fn insert_completed_row(
    tx: &mut SqlTransaction<'_, Postgres>,
    record: &CompletedTransfer,
    now: DateTime<Utc>,
) -> StorageResult<()> {
    sqlx::query(
        r#"
        INSERT INTO transactions (
            reference, tx_hash, kind, status, from_handle, to_handle,
            from_address, to_address, amount, memo,
            block_number, gas_used, gas_price,
            expires_at, created_at, updated_at
        )
        VALUES ($1, $2, $3, 'completed', $4, $5, $6, $7, $8::NUMERIC, $9,
                $10, $11::NUMERIC, $12::NUMERIC, NULL, $13, $13)
        "#,
    )
    .bind(TxRef::from(record.tx_hash).to_string())
    .bind(&record.tx_hash.0[..])
    .bind(record.kind.as_str())
    .bind(record.from_handle.as_str())
    .bind(record.to_handle.as_str())
    .bind(&record.from_address.0[..])
    .bind(&record.to_address.0[..])
    .bind(record.amount.base_units().to_string())
    .bind(&record.memo)
    .bind(record.block_number as i64)
    .bind(record.gas_used.map(|g| g.to_string()))
    .bind(record.gas_price.map(|g| g.to_string()))
    .bind(now)
    .execute(&mut **tx)
    .await
    .map_err(map_insert_error)?;

    Ok(())
}

/// Debit the sender and credit the recipient inside the caller's
/// transaction. Rows are created on first touch.
async fn apply_balance_deltas(
    tx: &mut SqlTransaction<'_, Postgres>,
    record: &CompletedTransfer,
    now: DateTime<Utc>,
) -> StorageResult<()> {
    let amount = record.amount.base_units().to_string();

    sqlx::query(
        r#"
        INSERT INTO balances (address, balance, updated_at)
        VALUES ($1, 0, $2)
        ON CONFLICT (address) DO NOTHING
        "#,
    )
    .bind(&record.from_address.0[..])
    .bind(now)
    .execute(&mut **tx)
    .await
    .map_err(|e| StorageError::QueryError(e.to_string()))?;

    // Clamp at zero: the cache may be missing a credit the chain has
    // already granted. The chain stays authoritative either way.
    sqlx::query(
        r#"
        UPDATE balances
        SET balance = GREATEST(balance - $2::NUMERIC, 0), updated_at = $3
        WHERE address = $1
        "#,
    )
    .bind(&record.from_address.0[..])
    .bind(&amount)
    .bind(now)
    .execute(&mut **tx)
    .await
    .map_err(|e| StorageError::QueryError(e.to_string()))?;

    sqlx::query(
        r#"
        INSERT INTO balances (address, balance, updated_at)
        VALUES ($1, $2::NUMERIC, $3)
        ON CONFLICT (address) DO UPDATE SET
            balance = balances.balance + EXCLUDED.balance,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(&record.to_address.0[..])
    .bind(&amount)
    .bind(now)
    .execute(&mut **tx)
    .await
    .map_err(|e| StorageError::QueryError(e.to_string()))?;

    Ok(())
}

fn map_insert_error(err: sqlx::Error) -> StorageError {
    match err.as_database_error() {
        Some(db) if db.is_unique_violation() => StorageError::ConstraintViolation(db.to_string()),
        _ => StorageError::QueryError(err.to_string()),
    }
}
