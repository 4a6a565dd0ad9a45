//! Cursor repository implementation for PostgreSQL.

use async_trait::async_trait;
use sqlx::PgPool;

use virement_core::error::{StorageError, StorageResult};
use virement_core::models::SyncCursor;
use virement_core::ports::CursorRepository;

use super::database::Database;

/// PostgreSQL implementation of CursorRepository.
pub struct PgCursorRepository {
    pool: PgPool,
}

impl PgCursorRepository {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }
}

#[async_trait]
impl CursorRepository for PgCursorRepository {
    async fn get_cursor(&self, network_id: &str) -> StorageResult<Option<SyncCursor>> {
        let row = sqlx::query_as::<_, CursorRow>(
            r#"
            SELECT network_id, last_processed_block, updated_at
            FROM sync_cursor
            WHERE network_id = $1
            "#,
        )
        .bind(network_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::QueryError(e.to_string()))?;

        Ok(row.map(CursorRow::into_cursor))
    }

    async fn set_cursor(&self, cursor: &SyncCursor) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_cursor (network_id, last_processed_block, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (network_id) DO UPDATE SET
                last_processed_block = EXCLUDED.last_processed_block,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&cursor.network_id)
        .bind(cursor.last_processed_block as i64)
        .bind(cursor.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::QueryError(e.to_string()))?;

        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct CursorRow {
    network_id: String,
    last_processed_block: i64,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl CursorRow {
    fn into_cursor(self) -> SyncCursor {
        SyncCursor {
            network_id: self.network_id,
            last_processed_block: self.last_processed_block as u64,
            updated_at: self.updated_at,
        }
    }
}
