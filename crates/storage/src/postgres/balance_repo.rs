//! Cached balance repository implementation for PostgreSQL.
//!
//! Read-only: balance writes happen exclusively inside the atomic
//! completed-transfer operations of [`super::PgLedger`], never through
//! a standalone mutation.

use async_trait::async_trait;
use sqlx::PgPool;

use virement_core::amount::TokenAmount;
use virement_core::error::{StorageError, StorageResult};
use virement_core::models::{Address, BalanceEntry};
use virement_core::ports::BalanceRepository;

use super::database::Database;
use super::helpers::parse_numeric_u128;

/// PostgreSQL implementation of BalanceRepository.
pub struct PgBalanceRepository {
    pool: PgPool,
}

impl PgBalanceRepository {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }
}

#[async_trait]
impl BalanceRepository for PgBalanceRepository {
    async fn get(&self, address: &Address) -> StorageResult<Option<BalanceEntry>> {
        let row = sqlx::query_as::<_, BalanceRow>(
            r#"
            SELECT address, balance::TEXT AS balance, updated_at
            FROM balances
            WHERE address = $1
            "#,
        )
        .bind(&address.0[..])
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::QueryError(e.to_string()))?;

        row.map(BalanceRow::into_entry).transpose()
    }
}

#[derive(sqlx::FromRow)]
struct BalanceRow {
    address: Vec<u8>,
    balance: String,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl BalanceRow {
    fn into_entry(self) -> StorageResult<BalanceEntry> {
        Ok(BalanceEntry {
            address: super::helpers::bytes_to_address(self.address, "balances.address")?,
            balance: TokenAmount::from_base_units(parse_numeric_u128(
                &self.balance,
                "balances.balance",
            )?),
            updated_at: self.updated_at,
        })
    }
}
