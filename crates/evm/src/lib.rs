//! EVM chain adapter for the Virement payment ledger.
//!
//! This crate implements the [`ChainGateway`] port from
//! `virement-core`, providing connectivity to an EVM chain via
//! WebSocket JSON-RPC using ethers.
//!
//! # Features
//!
//! - ERC-20 transfer submission with per-user signers built at the
//!   moment of transfer
//! - Bounded receipt waits (a hung RPC call never blocks a caller past
//!   its deadline)
//! - Live Transfer event subscription, forwarded through an owned
//!   channel so consumers hold a `'static` stream
//! - Ranged Transfer log queries for backfill
//!
//! # Usage
//!
//! ```ignore
//! use virement_evm::{EvmGateway, EvmGatewayConfig};
//!
//! let config = EvmGatewayConfig {
//!     ws_url: "ws://localhost:8545".to_string(),
//!     token_address: "0x...".to_string(),
//!     chain_id: 11155111,
//! };
//!
//! let gateway = EvmGateway::connect(config).await?;
//! let height = gateway.current_block_height().await?;
//! ```
//!
//! [`ChainGateway`]: virement_core::ports::ChainGateway

mod gateway;

pub use gateway::{EvmGateway, EvmGatewayConfig};
