//! Port trait for the identity directory.
//!
//! Users (handles, addresses, credentials) are owned by an external
//! identity collaborator; this layer only consumes them. A thin
//! Postgres adapter is provided in `virement-storage` so the binary can
//! run standalone, but nothing in the domain depends on it.

use async_trait::async_trait;

use crate::error::StorageResult;
use crate::models::{Address, Handle, UserRef};
use crate::ports::SigningSecret;

/// Port trait for handle and credential resolution.
#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    /// Resolve a handle to a registered user, `None` if absent or
    /// deactivated.
    async fn resolve_handle(&self, handle: &Handle) -> StorageResult<Option<UserRef>>;

    /// Reverse lookup by chain address. Chain events reference raw
    /// addresses; an address with no local user is a valid answer.
    async fn find_by_address(&self, address: &Address) -> StorageResult<Option<UserRef>>;

    /// Signing credential for a user, fetched only at the moment of
    /// transfer. Secure custody is the collaborator's concern; the
    /// secret is opaque here.
    async fn signing_secret(&self, handle: &Handle) -> StorageResult<Option<SigningSecret>>;
}
