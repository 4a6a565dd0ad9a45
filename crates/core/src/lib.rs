//! Core domain layer for the Virement payment ledger.
//!
//! This crate contains the domain models, port traits (interfaces), and
//! business logic services for a handle-based token payment system that
//! reconciles an authoritative on-chain ledger with a fast off-chain
//! mirror. It follows hexagonal architecture principles - this is the
//! innermost layer with no dependencies on infrastructure.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    virement (binary)                        │
//! ├──────────────────────────────┬──────────────────────────────┤
//! │        virement-evm          │       virement-storage       │
//! │     (ethers gateway)         │        (PostgreSQL)          │
//! ├──────────────────────────────┴──────────────────────────────┤
//! │                   virement-core  ← YOU ARE HERE             │
//! │               (models, ports, services)                     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`models`] - Domain models (Transaction, TxRef, SyncCursor, etc.)
//! - [`amount`] - Exact fixed-point token amounts
//! - [`ports`] - Interface traits for adapters to implement
//! - [`services`] - Core business logic (coordinator, synchronizer,
//!   confirmation calculator)
//! - [`error`] - Domain error types
//! - [`metrics`] - Prometheus metrics definitions
//!
//! # Key Concepts
//!
//! ## Ports
//!
//! Ports define interfaces that external adapters must implement:
//!
//! - [`ports::ChainGateway`] - Submit transfers, observe events
//! - [`ports::Ledger`] - Persist and query the off-chain mirror
//! - [`ports::IdentityDirectory`] - Resolve handles and credentials
//! - [`ports::NotificationTrigger`] - Fire-and-forget user notifications
//!
//! ## Two sources of truth
//!
//! The chain is authoritative; the mirror exists for fast reads and the
//! request workflow. Two writers race against the mirror - the
//! coordinator (synchronous, after each receipt) and the synchronizer
//! (asynchronous, from observed events) - and both funnel through one
//! idempotent upsert keyed on transaction hash, so duplicate or
//! re-ordered delivery never double-applies a balance change.

pub mod amount;
pub mod error;
pub mod metrics;
pub mod models;
pub mod ports;
pub mod services;
