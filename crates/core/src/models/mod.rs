//! Domain models for the payment ledger.
//!
//! These models are storage-agnostic and represent the canonical form
//! of ledger data within the domain layer. The chain is the source of
//! truth for balances; everything here mirrors it for fast reads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::amount::TokenAmount;

// =============================================================================
// Fixed-width byte newtypes
// =============================================================================

/// Macro to generate fixed-width byte newtypes with common functionality.
///
/// Generates:
/// - `from_hex()` - Parse from hex string (with or without 0x prefix)
/// - `to_hex()` - Convert to 0x-prefixed hex string
/// - `Display` trait implementation
/// - `From<[u8; N]>` implementation
macro_rules! bytes_newtype {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            /// Parse from hex string (with or without 0x prefix).
            pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
                let s = s.strip_prefix("0x").unwrap_or(s);
                let bytes = hex::decode(s)?;
                let arr: [u8; $len] = bytes
                    .try_into()
                    .map_err(|_| hex::FromHexError::InvalidStringLength)?;
                Ok(Self(arr))
            }

            /// Convert to 0x-prefixed hex string.
            pub fn to_hex(&self) -> String {
                format!("0x{}", hex::encode(self.0))
            }

            /// Get the inner bytes.
            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }

        impl From<[u8; $len]> for $name {
            fn from(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }
    };
}

bytes_newtype!(
    /// 32-byte chain transaction hash.
    TxHash,
    32
);

bytes_newtype!(
    /// 32-byte block hash.
    BlockHash,
    32
);

bytes_newtype!(
    /// 20-byte chain account address.
    Address,
    20
);

// =============================================================================
// Handles
// =============================================================================

/// Human-readable payment identifier (`alice@anz`), mapped to a chain
/// address by the identity directory.
///
/// Handles are opaque to this layer beyond case normalization; the
/// directory owns their structure.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Handle(String);

impl Handle {
    /// Normalize and wrap a handle. Handles compare case-insensitively,
    /// so they are stored lowercased.
    pub fn new(raw: &str) -> Self {
        Self(raw.trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Fallback handle for a chain address with no registered user,
    /// used when recording externally-initiated transfers for audit.
    pub fn from_address(address: &Address) -> Self {
        Self(address.to_hex())
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Transaction references
// =============================================================================

/// Identity of a ledger transaction row.
///
/// Sends are identified by their chain hash. Requests have no chain
/// activity until fulfillment, so they carry a synthetic reference
/// (`req-<uuid>`) that can never collide with a 32-byte hash: the two
/// forms are distinguishable by format alone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxRef {
    /// A real on-chain transaction hash.
    Chain(TxHash),
    /// A synthetic reference for a not-yet-fulfilled request.
    Synthetic(String),
}

impl TxRef {
    const SYNTHETIC_PREFIX: &'static str = "req-";

    /// Generate a fresh synthetic reference for a new payment request.
    pub fn new_request() -> Self {
        Self::Synthetic(format!("{}{}", Self::SYNTHETIC_PREFIX, uuid::Uuid::new_v4()))
    }

    /// Parse a stored reference back into its variant.
    pub fn parse(s: &str) -> Option<Self> {
        if let Some(rest) = s.strip_prefix(Self::SYNTHETIC_PREFIX) {
            if rest.is_empty() {
                return None;
            }
            return Some(Self::Synthetic(s.to_string()));
        }
        TxHash::from_hex(s).ok().map(Self::Chain)
    }

    pub fn is_chain_hash(&self) -> bool {
        matches!(self, Self::Chain(_))
    }

    pub fn as_chain_hash(&self) -> Option<&TxHash> {
        match self {
            Self::Chain(hash) => Some(hash),
            Self::Synthetic(_) => None,
        }
    }
}

impl std::fmt::Display for TxRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Chain(hash) => write!(f, "{}", hash),
            Self::Synthetic(s) => write!(f, "{}", s),
        }
    }
}

impl From<TxHash> for TxRef {
    fn from(hash: TxHash) -> Self {
        Self::Chain(hash)
    }
}

// =============================================================================
// Transactions
// =============================================================================

/// What a transaction row represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    /// A direct token transfer.
    Send,
    /// A payment request; no chain activity until fulfilled.
    Request,
    /// An approval granted to a spender.
    Approve,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Send => "send",
            Self::Request => "request",
            Self::Approve => "approve",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "send" => Some(Self::Send),
            "request" => Some(Self::Request),
            "approve" => Some(Self::Approve),
            _ => None,
        }
    }
}

/// Transaction lifecycle state.
///
/// Requests: `Pending -> {Completed, Declined, Expired}`, all terminal.
/// Sends: `Submitted -> Completed`. No transition ever leaves a
/// terminal state; request transitions are compare-and-swap against
/// `Pending`, never read-then-write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Request awaiting fulfillment or decline.
    Pending,
    /// Transfer submitted to the chain, receipt not yet observed.
    Submitted,
    /// Transfer confirmed on-chain (terminal).
    Completed,
    /// Request declined by its target (terminal).
    Declined,
    /// Request expired before fulfillment (terminal).
    Expired,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Submitted => "submitted",
            Self::Completed => "completed",
            Self::Declined => "declined",
            Self::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "submitted" => Some(Self::Submitted),
            "completed" => Some(Self::Completed),
            "declined" => Some(Self::Declined),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    /// Terminal states admit no further transition.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Declined | Self::Expired)
    }
}

/// A ledger mirror transaction row.
///
/// Chain metadata (`block_number`, `gas_used`, `gas_price`) is populated
/// only once the underlying transfer is mined; all three remain `None`
/// for unfulfilled requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    /// Stable row identity: the chain hash for sends, a synthetic
    /// reference for requests. Never rewritten, so a fulfilled request
    /// stays addressable by the reference it was created under.
    pub reference: TxRef,
    /// Chain transaction hash, set at submission (sends) or fulfillment
    /// (requests). Unique across all rows once non-null; stays `None`
    /// for requests with no on-chain activity.
    pub tx_hash: Option<TxHash>,
    pub kind: TransactionKind,
    pub status: TransactionStatus,
    pub from_handle: Handle,
    pub to_handle: Handle,
    pub from_address: Address,
    pub to_address: Address,
    /// Token quantity in base units; converted to/from decimal strings
    /// only at the boundary.
    pub amount: TokenAmount,
    /// Optional free text, bounded length.
    pub memo: Option<String>,
    pub block_number: Option<u64>,
    pub gas_used: Option<u128>,
    pub gas_price: Option<u128>,
    /// Requests only; `None` means the request never expires.
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    /// Whether a request's expiry has passed at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(deadline) if now > deadline)
    }
}

// =============================================================================
// Balances
// =============================================================================

/// Cached token balance for one address.
///
/// Derived from completed transfers; the chain remains authoritative.
/// Updated only inside the same storage transaction that records the
/// completing transfer, so the cache can never double-apply a transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceEntry {
    pub address: Address,
    pub balance: TokenAmount,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Users
// =============================================================================

/// Reference to a registered user, resolved through the identity
/// directory. Signing credentials are fetched separately and only at
/// the moment of transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub handle: Handle,
    pub address: Address,
}

// =============================================================================
// Synchronizer state
// =============================================================================

/// Backfill cursor tracking synchronizer progress.
///
/// Keyed by network identifier so multiple networks never share a
/// cursor. `last_processed_block` is monotonically non-decreasing; on a
/// missing cursor the synchronizer starts from current chain height and
/// relies on idempotent upserts to tolerate the under-sync gap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncCursor {
    pub network_id: String,
    pub last_processed_block: u64,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_hash_hex_roundtrip() {
        let hex = "0x1234567890abcdef1234567890abcdef1234567890abcdef1234567890abcdef";
        let hash = TxHash::from_hex(hex).unwrap();
        assert_eq!(hash.to_hex(), hex);
    }

    #[test]
    fn address_hex_roundtrip() {
        let hex = "0xd8da6bf26964af9d7eed9e03e53415d37aa96045";
        let address = Address::from_hex(hex).unwrap();
        assert_eq!(address.to_hex(), hex);
    }

    #[test]
    fn address_rejects_wrong_length() {
        // 32 bytes is a hash, not an address
        let hex = "0x1234567890abcdef1234567890abcdef1234567890abcdef1234567890abcdef";
        assert!(Address::from_hex(hex).is_err());
    }

    #[test]
    fn handle_normalizes_case() {
        assert_eq!(Handle::new("Alice@ANZ"), Handle::new("alice@anz"));
    }

    // Invariant clé: une référence synthétique n'entre jamais en
    // collision avec un vrai hash 32 octets
    #[test]
    fn synthetic_ref_is_distinguishable_from_hash() {
        let synthetic = TxRef::new_request();
        assert!(!synthetic.is_chain_hash());

        let parsed = TxRef::parse(&synthetic.to_string()).unwrap();
        assert_eq!(parsed, synthetic);

        let hash_ref = TxRef::parse(
            "0x1234567890abcdef1234567890abcdef1234567890abcdef1234567890abcdef",
        )
        .unwrap();
        assert!(hash_ref.is_chain_hash());
    }

    #[test]
    fn tx_ref_rejects_garbage() {
        assert!(TxRef::parse("not-a-ref").is_none());
        assert!(TxRef::parse("req-").is_none());
        assert!(TxRef::parse("0x1234").is_none());
    }

    #[test]
    fn fresh_request_refs_are_unique() {
        assert_ne!(TxRef::new_request(), TxRef::new_request());
    }

    #[test]
    fn terminal_states() {
        assert!(TransactionStatus::Completed.is_terminal());
        assert!(TransactionStatus::Declined.is_terminal());
        assert!(TransactionStatus::Expired.is_terminal());
        assert!(!TransactionStatus::Pending.is_terminal());
        assert!(!TransactionStatus::Submitted.is_terminal());
    }

    #[test]
    fn status_str_roundtrip() {
        for status in [
            TransactionStatus::Pending,
            TransactionStatus::Submitted,
            TransactionStatus::Completed,
            TransactionStatus::Declined,
            TransactionStatus::Expired,
        ] {
            assert_eq!(TransactionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TransactionStatus::parse("unknown"), None);
    }
}
