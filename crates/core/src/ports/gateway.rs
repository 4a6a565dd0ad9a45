//! Port trait for the chain gateway.
//!
//! This trait defines the interface for submitting token transfers and
//! observing transfer events on the chain. Implementations live in the
//! infrastructure layer (e.g., `virement-evm`); tests inject fakes.
//!
//! The gateway is deliberately thin: no retries, no persistence, no
//! policy. Callers bound every operation with their own deadlines and
//! own the retry strategy.

use std::fmt;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;

use crate::amount::TokenAmount;
use crate::error::ChainResult;
use crate::models::{Address, BlockHash, TxHash};

/// Opaque signing credential, resolved by the identity directory and
/// consumed by the gateway at the moment of transfer.
///
/// Custody is out of scope; the wrapper only prevents the secret from
/// leaking through `Debug` output.
#[derive(Clone)]
pub struct SigningSecret(String);

impl SigningSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Access the raw secret. Only the gateway should call this.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SigningSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningSecret(<redacted>)")
    }
}

/// Handle to a transfer accepted by the RPC node but not yet mined.
#[derive(Debug, Clone)]
pub struct PendingTransfer {
    pub tx_hash: TxHash,
}

/// Chain-returned confirmation that a submitted transfer was included
/// in a block.
#[derive(Debug, Clone)]
pub struct TransferReceipt {
    pub tx_hash: TxHash,
    pub block_number: u64,
    pub gas_used: u128,
    /// Effective price actually paid per gas unit.
    pub gas_price: u128,
    /// Execution status from the receipt: `false` means the transfer
    /// reverted despite being mined.
    pub succeeded: bool,
}

/// Minimal block metadata used for verification and timestamps.
#[derive(Debug, Clone)]
pub struct BlockInfo {
    pub number: u64,
    pub hash: BlockHash,
    pub timestamp: Option<DateTime<Utc>>,
}

/// A token transfer event observed on-chain, either from the live
/// subscription or a backfill range query. Both paths produce the same
/// shape so the synchronizer applies them through one code path.
#[derive(Debug, Clone)]
pub struct TransferEvent {
    pub tx_hash: TxHash,
    pub block_number: u64,
    /// Position of the log within the block; disambiguates multiple
    /// transfers in one transaction.
    pub log_index: u64,
    pub from: Address,
    pub to: Address,
    pub amount: TokenAmount,
}

/// Stream of live transfer events.
///
/// Items are `Err` when the underlying subscription fails; the stream
/// then ends and the consumer is expected to resubscribe with backoff.
pub type TransferEventStream = Pin<Box<dyn Stream<Item = ChainResult<TransferEvent>> + Send>>;

/// Port trait for the chain gateway.
#[async_trait]
pub trait ChainGateway: Send + Sync {
    /// Sign and submit a token transfer. Returns as soon as the RPC
    /// node accepts the transaction; inclusion is awaited separately.
    async fn submit_transfer(
        &self,
        secret: &SigningSecret,
        to: &Address,
        amount: TokenAmount,
    ) -> ChainResult<PendingTransfer>;

    /// Wait for the receipt of a submitted transfer, bounded by
    /// `timeout`. Expiry surfaces as [`crate::error::ChainError::Timeout`]:
    /// recoverable, since the transfer may still be included later.
    async fn await_receipt(&self, tx_hash: &TxHash, timeout: Duration)
        -> ChainResult<TransferReceipt>;

    /// Current chain height.
    async fn current_block_height(&self) -> ChainResult<u64>;

    /// Block metadata by number, `None` if the block is unknown.
    async fn block_by_number(&self, number: u64) -> ChainResult<Option<BlockInfo>>;

    /// Subscribe to live token transfer events.
    async fn subscribe_transfers(&self) -> ChainResult<TransferEventStream>;

    /// Query transfer events in the inclusive block range
    /// `[from_block, to_block]`. Used by the backfill sweep.
    async fn query_transfer_range(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> ChainResult<Vec<TransferEvent>>;

    /// On-chain token balance of an address. Authoritative, unlike the
    /// mirror's cached balance.
    async fn token_balance(&self, address: &Address) -> ChainResult<TokenAmount>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signing_secret_redacts_debug() {
        let secret = SigningSecret::new("0xdeadbeef");
        let debug = format!("{:?}", secret);
        assert!(!debug.contains("deadbeef"));
        assert_eq!(secret.expose(), "0xdeadbeef");
    }
}
