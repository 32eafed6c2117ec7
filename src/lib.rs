//! Transfer Ledger - Double-entry money transfer engine
//!
//! Keeps account balances consistent under concurrent transfers: every
//! completed transfer debits one account, credits another and appends two
//! linked ledger entries in a single store transaction.
//!
//! # Modules
//!
//! - [`core_types`] - Id and amount aliases
//! - [`money`] - `DECIMAL(18,2)` amount validation
//! - [`error`] - Error taxonomy
//! - [`models`] - Users, currencies, accounts, transfers, ledger entries
//! - [`store`] - Transactional store seam (in-memory and PostgreSQL)
//! - [`db`] - PostgreSQL pool
//! - [`account`] - User and account repositories
//! - [`currency`] - Currency registry
//! - [`ledger`] - Transaction ledger and reconciliation
//! - [`funding`] - Deposits and withdrawals
//! - [`transfer`] - Transfer engine, state machine, idempotency, retry
//! - [`services`] - Component wiring from configuration
//! - [`config`] / [`logging`] - Process setup

// Core types - must be first!
pub mod core_types;

pub mod error;
pub mod models;
pub mod money;

// Storage
pub mod db;
pub mod store;

// Ledger components
pub mod account;
pub mod currency;
pub mod funding;
pub mod ledger;
pub mod services;
pub mod transfer;

// Process setup
pub mod config;
pub mod logging;

// Convenient re-exports at crate root
pub use account::{AccountRepository, UserRepository};
pub use config::LedgerConfig;
pub use core_types::{AccountId, Amount, CurrencyId, TransactionId, TransferId, UserId};
pub use currency::CurrencyRegistry;
pub use error::LedgerError;
pub use funding::FundingService;
pub use ledger::{Discrepancy, TransactionLedger};
pub use models::{
    Account, AccountStatus, Currency, CurrencyCode, FailureReason, OperationStatus, Transaction,
    TransactionType, Transfer, User,
};
pub use services::LedgerServices;
pub use store::{LedgerStore, MemoryStore, PgStore, StoreTx};
pub use transfer::{RetryPolicy, TransferEngine, TransferRequest};
