//! EVM gateway implementing the ChainGateway port with ethers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use ethers::contract::{abigen, ContractError, EthEvent, EthLogDecode};
use ethers::core::abi::RawLog;
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Middleware, PendingTransaction, Provider, Ws};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address as EthAddress, Filter, Log, TransactionReceipt, H256, U256};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, instrument, trace, warn};

use virement_core::amount::TokenAmount;
use virement_core::error::{ChainError, ChainResult};
use virement_core::models::{Address, BlockHash, TxHash};
use virement_core::ports::{
    BlockInfo, ChainGateway, PendingTransfer, SigningSecret, TransferEvent, TransferEventStream,
    TransferReceipt,
};

abigen!(
    Erc20Token,
    r#"[
        function transfer(address to, uint256 value) external returns (bool)
        function balanceOf(address owner) external view returns (uint256)
        event Transfer(address indexed from, address indexed to, uint256 value)
    ]"#
);

/// Buffer between the log subscription and its consumer.
const SUBSCRIPTION_BUFFER: usize = 256;

/// Configuration for the EVM gateway.
#[derive(Debug, Clone)]
pub struct EvmGatewayConfig {
    /// WebSocket JSON-RPC URL (e.g., "ws://localhost:8545").
    pub ws_url: String,
    /// Deployed token contract address.
    pub token_address: String,
    /// EIP-155 chain id used when signing.
    pub chain_id: u64,
}

impl Default for EvmGatewayConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://127.0.0.1:8545".to_string(),
            token_address: String::new(),
            // Sepolia, the deployed test configuration.
            chain_id: 11_155_111,
        }
    }
}

/// EVM adapter implementing the ChainGateway port.
///
/// Holds one shared provider and the token contract address. A signer
/// is built per submission from the caller's credential, mirroring the
/// per-user wallets of the account model; the gateway itself never
/// holds keys.
pub struct EvmGateway {
    provider: Arc<Provider<Ws>>,
    token: Erc20Token<Provider<Ws>>,
    token_address: EthAddress,
    chain_id: u64,
}

impl EvmGateway {
    /// Connect to an EVM node over WebSocket.
    #[instrument(skip_all, fields(url = %config.ws_url))]
    pub async fn connect(config: EvmGatewayConfig) -> ChainResult<Self> {
        debug!("Connecting to node");

        let token_address: EthAddress = config.token_address.parse().map_err(|e| {
            ChainError::Rpc(format!(
                "invalid token address {:?}: {e}",
                config.token_address
            ))
        })?;

        let ws = Ws::connect(&config.ws_url)
            .await
            .map_err(|e| ChainError::Unavailable(e.to_string()))?;
        let provider = Arc::new(Provider::new(ws).interval(Duration::from_millis(1_000)));
        let token = Erc20Token::new(token_address, provider.clone());

        debug!("Connected successfully");

        Ok(Self {
            provider,
            token,
            token_address,
            chain_id: config.chain_id,
        })
    }

    /// Log filter matching the token's Transfer events.
    fn transfer_filter(&self) -> Filter {
        Filter::new()
            .address(self.token_address)
            .topic0(TransferFilter::signature())
    }
}

#[async_trait]
impl ChainGateway for EvmGateway {
    async fn submit_transfer(
        &self,
        secret: &SigningSecret,
        to: &Address,
        amount: TokenAmount,
    ) -> ChainResult<PendingTransfer> {
        let wallet = secret
            .expose()
            .trim_start_matches("0x")
            .parse::<LocalWallet>()
            .map_err(|e| ChainError::InvalidKey(e.to_string()))?
            .with_chain_id(self.chain_id);

        let client = Arc::new(SignerMiddleware::new(self.provider.clone(), wallet));
        let token = Erc20Token::new(self.token_address, client);

        let call = token.transfer(EthAddress::from(to.0), U256::from(amount.base_units()));
        let pending = call.send().await.map_err(classify_contract_error)?;
        let tx_hash = TxHash(pending.tx_hash().0);

        debug!(tx_hash = %tx_hash, "Transfer submitted");
        Ok(PendingTransfer { tx_hash })
    }

    async fn await_receipt(
        &self,
        tx_hash: &TxHash,
        timeout: Duration,
    ) -> ChainResult<TransferReceipt> {
        let pending = PendingTransaction::new(H256(tx_hash.0), self.provider.as_ref());

        let receipt = tokio::time::timeout(timeout, pending)
            .await
            .map_err(|_| ChainError::Timeout {
                tx_hash: tx_hash.to_hex(),
            })?
            .map_err(|e| ChainError::Rpc(e.to_string()))?
            .ok_or_else(|| ChainError::Rpc(format!("no receipt returned for {tx_hash}")))?;

        map_receipt(*tx_hash, receipt)
    }

    async fn current_block_height(&self) -> ChainResult<u64> {
        let height = self
            .provider
            .get_block_number()
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))?;
        Ok(height.as_u64())
    }

    async fn block_by_number(&self, number: u64) -> ChainResult<Option<BlockInfo>> {
        let block = self
            .provider
            .get_block(number)
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))?;

        Ok(block.map(|block| BlockInfo {
            number,
            hash: BlockHash(block.hash.unwrap_or_default().0),
            timestamp: DateTime::from_timestamp(block.timestamp.as_u64() as i64, 0),
        }))
    }

    async fn subscribe_transfers(&self) -> ChainResult<TransferEventStream> {
        let provider = self.provider.clone();
        let filter = self.transfer_filter();
        let (event_tx, event_rx) = mpsc::channel(SUBSCRIPTION_BUFFER);

        // The ethers subscription stream borrows the provider, so the
        // subscription lives in its own task and events are forwarded
        // through an owned channel.
        tokio::spawn(async move {
            let mut stream = match provider.subscribe_logs(&filter).await {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = event_tx
                        .send(Err(ChainError::Subscription(e.to_string())))
                        .await;
                    return;
                }
            };

            while let Some(log) = stream.next().await {
                match decode_transfer_log(&log) {
                    Some(event) => {
                        if event_tx.send(Ok(event)).await.is_err() {
                            return;
                        }
                    }
                    None => {
                        trace!(tx_hash = ?log.transaction_hash, "Undecodable transfer log");
                    }
                }
            }

            let _ = event_tx
                .send(Err(ChainError::Subscription(
                    "transfer log stream ended".to_string(),
                )))
                .await;
        });

        Ok(Box::pin(ReceiverStream::new(event_rx)))
    }

    async fn query_transfer_range(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> ChainResult<Vec<TransferEvent>> {
        let filter = self
            .transfer_filter()
            .from_block(from_block)
            .to_block(to_block);

        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))?;

        let mut events = Vec::with_capacity(logs.len());
        for log in &logs {
            match decode_transfer_log(log) {
                Some(event) => events.push(event),
                None => {
                    warn!(tx_hash = ?log.transaction_hash, "Skipping undecodable transfer log");
                }
            }
        }

        Ok(events)
    }

    async fn token_balance(&self, address: &Address) -> ChainResult<TokenAmount> {
        let balance = self
            .token
            .balance_of(EthAddress::from(address.0))
            .call()
            .await
            .map_err(classify_contract_error)?;

        let units = u256_to_u128(balance)
            .ok_or_else(|| ChainError::Rpc(format!("balance overflows u128: {balance}")))?;
        Ok(TokenAmount::from_base_units(units))
    }
}

// =============================================================================
// Decoding helpers
// =============================================================================

/// Decode one Transfer log into a domain event. Logs that are missing
/// inclusion metadata (pending logs) or do not decode are skipped by
/// callers.
fn decode_transfer_log(log: &Log) -> Option<TransferEvent> {
    let raw = RawLog {
        topics: log.topics.clone(),
        data: log.data.to_vec(),
    };
    let decoded = <TransferFilter as EthEvent>::decode_log(&raw).ok()?;

    let tx_hash = log.transaction_hash?;
    let block_number = log.block_number?.as_u64();
    let amount = u256_to_u128(decoded.value)?;

    Some(TransferEvent {
        tx_hash: TxHash(tx_hash.0),
        block_number,
        log_index: log.log_index.map(|i| i.as_u64()).unwrap_or(0),
        from: Address(decoded.from.0),
        to: Address(decoded.to.0),
        amount: TokenAmount::from_base_units(amount),
    })
}

fn u256_to_u128(value: U256) -> Option<u128> {
    if value.bits() <= 128 {
        Some(value.as_u128())
    } else {
        None
    }
}

fn map_receipt(tx_hash: TxHash, receipt: TransactionReceipt) -> ChainResult<TransferReceipt> {
    let block_number = receipt
        .block_number
        .ok_or_else(|| ChainError::Rpc(format!("receipt for {tx_hash} missing block number")))?
        .as_u64();

    Ok(TransferReceipt {
        tx_hash,
        block_number,
        gas_used: receipt.gas_used.and_then(u256_to_u128).unwrap_or(0),
        gas_price: receipt
            .effective_gas_price
            .and_then(u256_to_u128)
            .unwrap_or(0),
        succeeded: receipt.status.map(|s| s.as_u64() == 1).unwrap_or(false),
    })
}

/// Map a contract error, preserving the decoded revert reason when the
/// node returned one (the coordinator inspects it to tell a token
/// balance revert from a gas funds rejection).
fn classify_contract_error<M: Middleware>(err: ContractError<M>) -> ChainError {
    if let Some(reason) = err.decode_revert::<String>() {
        return ChainError::Reverted { reason };
    }
    ChainError::Rpc(err.to_string())
}
