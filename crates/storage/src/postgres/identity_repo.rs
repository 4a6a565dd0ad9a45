//! Identity directory adapter for PostgreSQL.
//!
//! The account system owns the `users` table; this adapter only reads
//! it, implementing the [`IdentityDirectory`] port so the binary can
//! run against the same database. Signing secrets pass through opaque -
//! custody is the account system's concern.

use async_trait::async_trait;
use sqlx::PgPool;

use virement_core::error::{StorageError, StorageResult};
use virement_core::models::{Address, Handle, UserRef};
use virement_core::ports::{IdentityDirectory, SigningSecret};

use super::database::Database;
use super::helpers::bytes_to_address;

/// PostgreSQL implementation of IdentityDirectory.
pub struct PgIdentityDirectory {
    pool: PgPool,
}

impl PgIdentityDirectory {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }
}

#[async_trait]
impl IdentityDirectory for PgIdentityDirectory {
    async fn resolve_handle(&self, handle: &Handle) -> StorageResult<Option<UserRef>> {
        let row: Option<(String, Vec<u8>)> = sqlx::query_as(
            "SELECT handle, address FROM users WHERE handle = $1 AND is_active",
        )
        .bind(handle.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::QueryError(e.to_string()))?;

        row.map(row_to_user).transpose()
    }

    async fn find_by_address(&self, address: &Address) -> StorageResult<Option<UserRef>> {
        let row: Option<(String, Vec<u8>)> = sqlx::query_as(
            "SELECT handle, address FROM users WHERE address = $1 AND is_active",
        )
        .bind(&address.0[..])
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::QueryError(e.to_string()))?;

        row.map(row_to_user).transpose()
    }

    async fn signing_secret(&self, handle: &Handle) -> StorageResult<Option<SigningSecret>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT signing_secret FROM users WHERE handle = $1 AND is_active",
        )
        .bind(handle.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::QueryError(e.to_string()))?;

        Ok(row.map(|(secret,)| SigningSecret::new(secret)))
    }
}

fn row_to_user((handle, address): (String, Vec<u8>)) -> StorageResult<UserRef> {
    Ok(UserRef {
        handle: Handle::new(&handle),
        address: bytes_to_address(address, "users.address")?,
    })
}
