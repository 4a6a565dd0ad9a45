//! Error types for the payment domain layer.
//!
//! This module defines a hierarchy of error types:
//!
//! - [`PaymentError`] - Business logic errors surfaced to callers
//! - [`StorageError`] - Ledger mirror / repository errors
//! - [`ChainError`] - Blockchain gateway errors
//! - [`SyncError`] - Event synchronizer orchestration errors
//!
//! Error conversion is automatic via `From` implementations,
//! allowing `?` to work across error boundaries. Chain-level errors
//! propagate untranslated, with one exception: the coordinator
//! disambiguates gas funds from token balance (see
//! [`crate::services::coordinator`]) because the two failures require
//! different user remediation.

use thiserror::Error;

use crate::amount::AmountParseError;

// =============================================================================
// Chain Errors
// =============================================================================

/// Blockchain RPC and submission errors.
///
/// These errors occur when communicating with the chain through the
/// gateway port. The gateway never retries; retry policy belongs to
/// callers.
#[derive(Debug, Error)]
pub enum ChainError {
    /// RPC endpoint unreachable. Retryable with backoff at the caller.
    #[error("Chain unavailable: {0}")]
    Unavailable(String),

    /// RPC request failed after reaching the endpoint.
    #[error("RPC error: {0}")]
    Rpc(String),

    /// The transfer was mined but reverted, or was rejected at
    /// submission with a revert reason.
    #[error("Execution reverted: {reason}")]
    Reverted {
        /// Decoded revert reason, or the raw error text when no reason
        /// could be decoded.
        reason: String,
    },

    /// Deadline expired while waiting for a receipt. The transaction
    /// may still be included; this is recoverable, not a failure.
    #[error("Timed out waiting for receipt of {tx_hash}")]
    Timeout {
        /// Hash of the transaction still awaiting inclusion.
        tx_hash: String,
    },

    /// Event subscription failed or disconnected.
    #[error("Subscription error: {0}")]
    Subscription(String),

    /// The signing secret could not be turned into a usable signer.
    #[error("Invalid signing key: {0}")]
    InvalidKey(String),
}

// =============================================================================
// Storage Errors
// =============================================================================

/// Ledger mirror and repository errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Failed to establish database connection.
    #[error("Database connection error: {0}")]
    ConnectionError(String),

    /// Query execution failed.
    #[error("Query execution error: {0}")]
    QueryError(String),

    /// Requested record was not found.
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Database constraint was violated (unique, check, etc.).
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Database migration failed.
    #[error("Migration error: {0}")]
    MigrationError(String),

    /// Transaction commit/rollback failed.
    #[error("Transaction error: {0}")]
    TransactionError(String),

    /// Data serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

// =============================================================================
// Payment Errors
// =============================================================================

/// Business errors returned by the submission coordinator.
///
/// Every failure a caller can see resolves to one of these variants
/// with a human-actionable message. Unknown errors are wrapped as
/// [`PaymentError::Internal`] and logged with full context server-side.
#[derive(Debug, Error)]
pub enum PaymentError {
    /// Transfer amount must be strictly positive.
    #[error("Invalid amount: must be greater than zero")]
    InvalidAmount,

    /// Amount string could not be parsed into base units.
    #[error("Invalid amount: {0}")]
    Amount(#[from] AmountParseError),

    /// Sender does not hold enough tokens for the transfer.
    /// Terminal for this attempt; no automatic retry.
    #[error("Insufficient token balance")]
    InsufficientBalance,

    /// Sender lacks native currency to pay for gas. Distinct from
    /// [`PaymentError::InsufficientBalance`] because remediation
    /// differs: the user must fund the wallet with gas currency,
    /// not acquire more tokens. Never retried automatically.
    #[error(
        "Not enough native currency in the sending wallet to pay for gas; \
         fund the wallet with gas currency and try again"
    )]
    InsufficientGasFunds,

    /// Recipient handle does not resolve to a registered user.
    #[error("Recipient not found: {0}")]
    RecipientNotFound(String),

    /// No payment request exists under the given reference.
    #[error("Payment request not found: {0}")]
    RequestNotFound(String),

    /// The request left `Pending` before this operation could claim it
    /// (fulfilled, declined or expired by a concurrent actor).
    #[error("Payment request is no longer pending (status: {status})")]
    RequestNotPending {
        /// Status observed when the compare-and-swap failed.
        status: String,
    },

    /// The request's expiry passed before fulfillment. Surfaced before
    /// any on-chain work is attempted.
    #[error("Payment request has expired")]
    RequestExpired,

    /// Only the request's target (the party asked to pay) may fulfill
    /// or decline it.
    #[error("Only the requested payer may act on this request")]
    NotRequestTarget,

    /// Memo exceeds the bounded length.
    #[error("Memo too long: {len} bytes (max {max})")]
    MemoTooLong { len: usize, max: usize },

    /// Receipt wait exceeded its deadline. The transaction remains
    /// `Submitted` (not failed) because inclusion may still occur; the
    /// event synchronizer will complete it once observed.
    #[error("Timed out waiting for confirmation of {tx_hash}; the transfer may still complete")]
    ReceiptTimeout {
        /// Hash of the submitted transfer.
        tx_hash: String,
    },

    /// Chain gateway error, propagated untranslated.
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    /// Ledger mirror error.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Unexpected internal error. Details are logged, never exposed.
    #[error("Internal error")]
    Internal(String),
}

// =============================================================================
// Synchronizer Errors
// =============================================================================

/// Top-level event synchronizer errors.
///
/// Per-event processing failures are NOT represented here: they are
/// logged, counted and isolated so one malformed event never stalls
/// the pipeline. These variants cover the orchestration level only.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Chain connectivity error.
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    /// Ledger mirror error.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Graceful shutdown was requested.
    ///
    /// Not really an error but uses the error type for control flow.
    #[error("Synchronizer shutdown requested")]
    ShutdownRequested,
}

// =============================================================================
// Result Type Aliases
// =============================================================================

/// Result type for chain gateway operations.
pub type ChainResult<T> = Result<T, ChainError>;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type for coordinator operations.
pub type PaymentResult<T> = Result<T, PaymentError>;

/// Result type for synchronizer operations.
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    // Test critique: la chaîne de conversion d'erreurs fonctionne
    // Permet d'utiliser ? à travers les couches
    #[test]
    fn test_error_conversion_chain() {
        // Storage -> Payment
        let storage_err = StorageError::QueryError("db failed".into());
        let payment_err: PaymentError = storage_err.into();
        assert!(payment_err.to_string().contains("db failed"));

        // Chain -> Payment
        let chain_err = ChainError::Rpc("rpc failed".into());
        let payment_err: PaymentError = chain_err.into();
        assert!(payment_err.to_string().contains("rpc failed"));

        // Chain -> Sync
        let chain_err = ChainError::Unavailable("refused".into());
        let sync_err: SyncError = chain_err.into();
        assert!(sync_err.to_string().contains("refused"));
    }

    // Les deux erreurs de fonds doivent rester distinctes: la remédiation
    // utilisateur n'est pas la même
    #[test]
    fn test_gas_and_balance_errors_are_distinct() {
        let gas = PaymentError::InsufficientGasFunds;
        let balance = PaymentError::InsufficientBalance;
        assert_ne!(gas.to_string(), balance.to_string());
        assert!(gas.to_string().contains("gas"));
    }
}
