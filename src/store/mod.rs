//! Ledger Store
//!
//! The seam between ledger logic and durable storage. A store provides
//! committed reads outside of any transaction, and [`StoreTx`] units of work
//! with row-level locking on accounts.
//!
//! # Contract
//!
//! 1. **Row locks**: `lock_account` takes an exclusive lock held until the
//!    transaction commits or rolls back. Waiting is bounded; exceeding the
//!    bound fails with `LedgerError::Timeout`.
//! 2. **Locked writes**: `update_account` is only valid for an account locked
//!    by the same transaction.
//! 3. **Atomicity**: nothing staged in a transaction is visible to others
//!    before `commit`. Dropping a transaction without committing rolls it back.
//! 4. **Unique indexes**: email, currency code, (user, currency) and transfer
//!    idempotency key. Violations surface as the matching `Duplicate*` error.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use uuid::Uuid;

use crate::core_types::{AccountId, Amount, CurrencyId, TransferId, UserId};
use crate::error::LedgerError;
use crate::models::{
    Account, CurrencyCode, Currency, FailureReason, OperationStatus, Transaction,
    TransactionType, Transfer, User,
};

// ============================================================================
// Insert records
// ============================================================================

#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub password_hash: String,
}

#[derive(Debug, Clone)]
pub struct NewCurrency {
    pub code: CurrencyCode,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct NewAccount {
    pub user_id: UserId,
    pub currency_id: CurrencyId,
}

#[derive(Debug, Clone)]
pub struct NewTransfer {
    pub public_id: Uuid,
    pub idempotency_key: Option<String>,
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub amount: Amount,
    pub status: OperationStatus,
    pub failure_reason: Option<FailureReason>,
}

#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub account_id: AccountId,
    pub reference: Option<TransferId>,
    pub tx_type: TransactionType,
    pub amount: Amount,
    pub status: OperationStatus,
}

// ============================================================================
// Traits
// ============================================================================

/// Durable, transactional ledger storage
#[async_trait]
pub trait LedgerStore: Send + Sync + 'static {
    type Tx: StoreTx;

    /// Open a transaction
    async fn begin(&self) -> Result<Self::Tx, LedgerError>;

    async fn get_user(&self, id: UserId) -> Result<Option<User>, LedgerError>;

    async fn get_currency(&self, id: CurrencyId) -> Result<Option<Currency>, LedgerError>;

    async fn get_currency_by_code(
        &self,
        code: CurrencyCode,
    ) -> Result<Option<Currency>, LedgerError>;

    async fn list_currencies(&self) -> Result<Vec<Currency>, LedgerError>;

    /// Last committed state of an account (no lock)
    async fn get_account(&self, id: AccountId) -> Result<Option<Account>, LedgerError>;

    async fn list_accounts(&self) -> Result<Vec<Account>, LedgerError>;

    async fn accounts_for_user(&self, user_id: UserId) -> Result<Vec<Account>, LedgerError>;

    async fn get_transfer(&self, id: TransferId) -> Result<Option<Transfer>, LedgerError>;

    async fn get_transfer_by_public_id(
        &self,
        public_id: Uuid,
    ) -> Result<Option<Transfer>, LedgerError>;

    async fn get_transfer_by_key(&self, key: &str) -> Result<Option<Transfer>, LedgerError>;

    /// Ledger entries of an account, oldest first
    async fn transactions_for_account(
        &self,
        account_id: AccountId,
    ) -> Result<Vec<Transaction>, LedgerError>;

    /// Ledger entries linked to a transfer, oldest first
    async fn transactions_for_transfer(
        &self,
        transfer_id: TransferId,
    ) -> Result<Vec<Transaction>, LedgerError>;

    /// Signed sum of completed entries (credits minus debits)
    async fn completed_sum(&self, account_id: AccountId) -> Result<Amount, LedgerError>;
}

/// One unit of work against the ledger store
#[async_trait]
pub trait StoreTx: Send {
    async fn insert_user(&mut self, new: NewUser) -> Result<User, LedgerError>;

    async fn set_user_active(&mut self, id: UserId, active: bool) -> Result<User, LedgerError>;

    async fn insert_currency(&mut self, new: NewCurrency) -> Result<Currency, LedgerError>;

    async fn set_currency_active(
        &mut self,
        code: CurrencyCode,
        active: bool,
    ) -> Result<Currency, LedgerError>;

    async fn insert_account(&mut self, new: NewAccount) -> Result<Account, LedgerError>;

    /// Take the row lock on an account and return its current state.
    ///
    /// Locking an account already held by this transaction is a no-op that
    /// returns the transaction's view of the row.
    async fn lock_account(&mut self, id: AccountId) -> Result<Account, LedgerError>;

    /// Write balance and status of an account locked by this transaction
    async fn update_account(&mut self, account: &Account) -> Result<(), LedgerError>;

    async fn insert_transfer(&mut self, new: NewTransfer) -> Result<Transfer, LedgerError>;

    /// Move a pending transfer to a terminal status
    async fn finish_transfer(
        &mut self,
        id: TransferId,
        status: OperationStatus,
        failure_reason: Option<FailureReason>,
    ) -> Result<Transfer, LedgerError>;

    async fn insert_transaction(
        &mut self,
        new: NewTransaction,
    ) -> Result<Transaction, LedgerError>;

    async fn commit(self) -> Result<(), LedgerError>;

    async fn rollback(self) -> Result<(), LedgerError>;
}
