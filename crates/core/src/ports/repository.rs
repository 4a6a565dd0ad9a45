//! Port traits for the ledger mirror.
//!
//! These traits define the storage interface used by the domain layer.
//! Implementations live in the infrastructure layer (e.g.,
//! `virement-storage`); tests use an in-memory ledger.
//!
//! The mirror is written through a small set of *atomic* operations on
//! the composite [`Ledger`] trait rather than row-level primitives.
//! Each one bundles the status write and both balance deltas into a
//! single storage transaction, which is what makes the coordinator and
//! the event synchronizer safe to race: whichever path loses the race
//! observes an already-completed row and applies nothing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::amount::TokenAmount;
use crate::error::StorageResult;
use crate::models::{
    Address, BalanceEntry, Handle, SyncCursor, Transaction, TransactionKind, TransactionStatus,
    TxHash, TxRef,
};

use super::pagination::{Connection, OrderDirection, Pagination};

// =============================================================================
// Filter Types
// =============================================================================

/// Filter options for transaction history queries.
#[derive(Debug, Clone, Default)]
pub struct TransactionFilter {
    /// Match rows where the handle appears as either party.
    pub handle: Option<Handle>,
    pub kind: Option<TransactionKind>,
    pub status: Option<TransactionStatus>,
}

// =============================================================================
// Completed transfer record
// =============================================================================

/// Everything needed to record a confirmed on-chain transfer.
///
/// Built by the coordinator from a receipt, or by the synchronizer from
/// an observed event (where gas figures are unknown and stay `None`).
#[derive(Debug, Clone)]
pub struct CompletedTransfer {
    pub tx_hash: TxHash,
    pub kind: TransactionKind,
    pub from_handle: Handle,
    pub to_handle: Handle,
    pub from_address: Address,
    pub to_address: Address,
    pub amount: TokenAmount,
    pub memo: Option<String>,
    pub block_number: u64,
    pub gas_used: Option<u128>,
    pub gas_price: Option<u128>,
}

/// Outcome of the idempotent completed-transfer upsert.
#[derive(Debug)]
pub enum TransferApplied {
    /// The row transitioned into `Completed` and balance deltas were
    /// applied, exactly once.
    Applied(Transaction),
    /// The transfer was already recorded as completed. Not an error:
    /// duplicate delivery is expected (live + backfill overlap) and
    /// silently absorbed.
    Duplicate,
}

/// Outcome of completing a pending request against its own row.
#[derive(Debug)]
pub enum RequestCompletion {
    /// The request row transitioned `Pending -> Completed` and carries
    /// the chain metadata; deltas applied unless the synchronizer beat
    /// us to the hash.
    Completed(Transaction),
    /// The compare-and-swap failed: the request left `Pending` first.
    Conflict(TransactionStatus),
}

// =============================================================================
// Repository Traits
// =============================================================================

/// Read access to transaction history.
#[async_trait]
pub trait TransactionRepository: Send + Sync {
    /// Get a transaction by its stable reference.
    async fn get(&self, reference: &TxRef) -> StorageResult<Option<Transaction>>;

    /// Get the row recording a chain transaction, whatever its
    /// reference (a send row, or a request fulfilled by that hash).
    async fn get_by_tx_hash(&self, tx_hash: &TxHash) -> StorageResult<Option<Transaction>>;

    /// List transactions with pagination and filtering.
    async fn list(
        &self,
        filter: TransactionFilter,
        pagination: Pagination,
        order: OrderDirection,
    ) -> StorageResult<Connection<Transaction>>;
}

/// Read access to cached balances.
#[async_trait]
pub trait BalanceRepository: Send + Sync {
    /// Cached balance for an address, `None` if never touched.
    async fn get(&self, address: &Address) -> StorageResult<Option<BalanceEntry>>;
}

/// Repository for the synchronizer cursor.
#[async_trait]
pub trait CursorRepository: Send + Sync {
    /// Get current cursor for a network.
    async fn get_cursor(&self, network_id: &str) -> StorageResult<Option<SyncCursor>>;

    /// Update cursor (upsert). Single-writer: only the backfill task
    /// calls this.
    async fn set_cursor(&self, cursor: &SyncCursor) -> StorageResult<()>;
}

// =============================================================================
// Composite Ledger
// =============================================================================

/// Combined ledger mirror access.
///
/// Provides the individual repositories plus the atomic multi-table
/// operations that the state machine depends on.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Access transaction history.
    fn transactions(&self) -> &dyn TransactionRepository;

    /// Access cached balances.
    fn balances(&self) -> &dyn BalanceRepository;

    /// Access the synchronizer cursor.
    fn cursor(&self) -> &dyn CursorRepository;

    /// Insert a new transaction row.
    ///
    /// Used for `Pending` request rows (no chain activity yet) and for
    /// `Submitted` send rows written between submission and receipt -
    /// the latter so a receipt timeout leaves an auditable, non-failed
    /// row for the synchronizer to complete once the transfer event is
    /// observed. Fails on a duplicate reference.
    async fn insert_transaction(&self, transaction: &Transaction) -> StorageResult<()>;

    /// Idempotent upsert keyed on chain transaction hash.
    ///
    /// In one storage transaction: insert the row as `Completed` (or
    /// transition the existing row carrying this hash), then debit the
    /// sender and credit the recipient. If the hash is already recorded
    /// as completed, nothing is written and
    /// [`TransferApplied::Duplicate`] is returned - applying the same
    /// event twice produces identical final state to applying it once.
    async fn apply_completed_transfer(
        &self,
        record: &CompletedTransfer,
    ) -> StorageResult<TransferApplied>;

    /// Complete a pending request in place after on-chain fulfillment.
    ///
    /// Compare-and-swap `Pending -> Completed` on the request row,
    /// setting its chain hash and metadata; the synthetic reference
    /// stays as the row identity. If the synchronizer already recorded
    /// the same hash as a standalone transfer (it won the race), that
    /// row is absorbed into the request row and the balance deltas are
    /// NOT applied again.
    async fn complete_request(
        &self,
        reference: &TxRef,
        outcome: &CompletedTransfer,
    ) -> StorageResult<RequestCompletion>;

    /// Compare-and-swap a request from `Pending` to a terminal state
    /// (`Declined` or `Expired`). Returns whether the swap won; a
    /// `false` means some concurrent actor transitioned the row first.
    async fn transition_request(
        &self,
        reference: &TxRef,
        to: TransactionStatus,
    ) -> StorageResult<bool>;

    /// Expire every pending request whose deadline has passed.
    ///
    /// Same compare-and-swap as [`Ledger::transition_request`], applied
    /// as a sweep; returns the references that were transitioned.
    /// Racing a concurrent fulfillment is safe: exactly one side wins
    /// each row.
    async fn expire_due_requests(&self, now: DateTime<Utc>) -> StorageResult<Vec<TxRef>>;
}
