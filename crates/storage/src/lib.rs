//! Storage layer for the Virement payment ledger.
//!
//! This crate provides PostgreSQL implementations of the ledger ports
//! defined in `virement-core`. It handles all database interactions
//! including connection pooling, migrations, and the atomic
//! multi-table operations the reconciliation design relies on.
//!
//! # Usage
//!
//! ```ignore
//! use virement_storage::{Database, DatabaseConfig, PgLedger};
//!
//! // Connect to the database
//! let config = DatabaseConfig::new(&database_url);
//! let db = Database::connect(&config).await?;
//!
//! // Run migrations
//! db.migrate().await?;
//!
//! // Create the ledger mirror
//! let ledger = Arc::new(PgLedger::new(Arc::new(db)));
//! ```

pub mod postgres;

pub use postgres::{
    Database, DatabaseConfig, PgBalanceRepository, PgCursorRepository, PgIdentityDirectory,
    PgLedger, PgTransactionRepository,
};
