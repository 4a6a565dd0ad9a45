//! Transaction repository implementation for PostgreSQL.

use async_trait::async_trait;
use sqlx::PgPool;

use virement_core::amount::TokenAmount;
use virement_core::error::{StorageError, StorageResult};
use virement_core::models::{Transaction, TransactionKind, TransactionStatus, TxHash, TxRef};
use virement_core::ports::{
    Connection, Cursor, Edge, OrderDirection, PageInfo, Pagination, TransactionFilter,
    TransactionRepository,
};

use super::database::Database;
use super::helpers::{bytes_to_address, bytes_to_hash32, parse_numeric_u128, parse_opt_numeric_u128};

/// Column list shared by every transaction SELECT; NUMERIC columns are
/// cast to TEXT so amounts round-trip exactly.
pub(crate) const TRANSACTION_COLUMNS: &str = "reference, tx_hash, kind, status, from_handle, \
     to_handle, from_address, to_address, amount::TEXT AS amount, memo, block_number, \
     gas_used::TEXT AS gas_used, gas_price::TEXT AS gas_price, \
     expires_at, created_at, updated_at";

/// PostgreSQL implementation of TransactionRepository.
pub struct PgTransactionRepository {
    pool: PgPool,
}

impl PgTransactionRepository {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }
}

#[async_trait]
impl TransactionRepository for PgTransactionRepository {
    async fn get(&self, reference: &TxRef) -> StorageResult<Option<Transaction>> {
        let query = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE reference = $1"
        );
        let row = sqlx::query_as::<_, TransactionRow>(&query)
            .bind(reference.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::QueryError(e.to_string()))?;

        row.map(TransactionRow::into_transaction).transpose()
    }

    async fn get_by_tx_hash(&self, tx_hash: &TxHash) -> StorageResult<Option<Transaction>> {
        let query = format!("SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE tx_hash = $1");
        let row = sqlx::query_as::<_, TransactionRow>(&query)
            .bind(&tx_hash.0[..])
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::QueryError(e.to_string()))?;

        row.map(TransactionRow::into_transaction).transpose()
    }

    async fn list(
        &self,
        filter: TransactionFilter,
        pagination: Pagination,
        order: OrderDirection,
    ) -> StorageResult<Connection<Transaction>> {
        let limit = pagination.first.unwrap_or(20).clamp(1, 100);
        let (order_sql, cursor_op) = match order {
            OrderDirection::Asc => ("ASC", ">"),
            OrderDirection::Desc => ("DESC", "<"),
        };

        // Cursor is the row's created_at as epoch microseconds.
        let after_micros: Option<i64> =
            pagination.after.as_ref().and_then(|c| c.value.parse().ok());
        let after_ts = after_micros.and_then(chrono::DateTime::from_timestamp_micros);

        // Build WHERE clause dynamically. Column names and operators are
        // hardcoded; every value is bound positionally below, in the
        // same order the conditions are pushed.
        let mut conditions = Vec::new();
        let mut param_idx = 1;

        if after_ts.is_some() {
            conditions.push(format!("created_at {} ${}", cursor_op, param_idx));
            param_idx += 1;
        }
        if filter.handle.is_some() {
            conditions.push(format!(
                "(from_handle = ${idx} OR to_handle = ${idx})",
                idx = param_idx
            ));
            param_idx += 1;
        }
        if filter.kind.is_some() {
            conditions.push(format!("kind = ${}", param_idx));
            param_idx += 1;
        }
        if filter.status.is_some() {
            conditions.push(format!("status = ${}", param_idx));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let query = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions {} ORDER BY created_at {} LIMIT {}",
            where_clause,
            order_sql,
            limit + 1
        );

        let mut query_builder = sqlx::query_as::<_, TransactionRow>(&query);
        if let Some(ts) = after_ts {
            query_builder = query_builder.bind(ts);
        }
        if let Some(handle) = &filter.handle {
            query_builder = query_builder.bind(handle.as_str().to_string());
        }
        if let Some(kind) = filter.kind {
            query_builder = query_builder.bind(kind.as_str());
        }
        if let Some(status) = filter.status {
            query_builder = query_builder.bind(status.as_str());
        }

        let rows: Vec<TransactionRow> = query_builder
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::QueryError(e.to_string()))?;

        let has_more = rows.len() > limit as usize;
        let transactions: Vec<Transaction> = rows
            .into_iter()
            .take(limit as usize)
            .map(TransactionRow::into_transaction)
            .collect::<StorageResult<Vec<_>>>()?;

        let edges: Vec<Edge<Transaction>> = transactions
            .into_iter()
            .map(|tx| {
                let cursor = Cursor {
                    value: tx.created_at.timestamp_micros().to_string(),
                };
                Edge { node: tx, cursor }
            })
            .collect();

        let page_info = PageInfo {
            has_next_page: has_more,
            has_previous_page: after_ts.is_some(),
            start_cursor: edges.first().map(|e| e.cursor.clone()),
            end_cursor: edges.last().map(|e| e.cursor.clone()),
        };

        Ok(Connection {
            edges,
            page_info,
            total_count: None,
        })
    }
}

/// Database row representation for Transaction.
#[derive(sqlx::FromRow)]
pub(crate) struct TransactionRow {
    reference: String,
    tx_hash: Option<Vec<u8>>,
    kind: String,
    status: String,
    from_handle: String,
    to_handle: String,
    from_address: Vec<u8>,
    to_address: Vec<u8>,
    amount: String,
    memo: Option<String>,
    block_number: Option<i64>,
    gas_used: Option<String>,
    gas_price: Option<String>,
    expires_at: Option<chrono::DateTime<chrono::Utc>>,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl TransactionRow {
    pub(crate) fn into_transaction(self) -> StorageResult<Transaction> {
        let reference = TxRef::parse(&self.reference).ok_or_else(|| {
            StorageError::SerializationError(format!(
                "transactions.reference: unparseable {:?}",
                self.reference
            ))
        })?;
        let kind = TransactionKind::parse(&self.kind).ok_or_else(|| {
            StorageError::SerializationError(format!(
                "transactions.kind: unknown {:?}",
                self.kind
            ))
        })?;
        let status = TransactionStatus::parse(&self.status).ok_or_else(|| {
            StorageError::SerializationError(format!(
                "transactions.status: unknown {:?}",
                self.status
            ))
        })?;

        let tx_hash = self
            .tx_hash
            .map(|bytes| bytes_to_hash32(bytes, "transactions.tx_hash").map(TxHash))
            .transpose()?;

        Ok(Transaction {
            reference,
            tx_hash,
            kind,
            status,
            from_handle: virement_core::models::Handle::new(&self.from_handle),
            to_handle: virement_core::models::Handle::new(&self.to_handle),
            from_address: bytes_to_address(self.from_address, "transactions.from_address")?,
            to_address: bytes_to_address(self.to_address, "transactions.to_address")?,
            amount: TokenAmount::from_base_units(parse_numeric_u128(
                &self.amount,
                "transactions.amount",
            )?),
            memo: self.memo,
            block_number: self.block_number.map(|n| n as u64),
            gas_used: parse_opt_numeric_u128(self.gas_used, "transactions.gas_used")?,
            gas_price: parse_opt_numeric_u128(self.gas_price, "transactions.gas_price")?,
            expires_at: self.expires_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
