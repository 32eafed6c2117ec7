//! Ledger Error Types
//!
//! One taxonomy for every layer: validation, repository, engine and store.

use thiserror::Error;

use crate::core_types::{AccountId, Amount, UserId};

/// Ledger error types
///
/// Only [`LedgerError::Timeout`] and [`LedgerError::ConcurrencyConflict`] are
/// safe to retry. Every other error is terminal for the request that raised it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    // === Validation Errors ===
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Source and destination account cannot be the same")]
    SelfTransfer,

    #[error("Invalid email: {0}")]
    InvalidEmail(String),

    #[error("Invalid idempotency key: {0}")]
    InvalidIdempotencyKey(String),

    #[error("Invalid {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },

    // === Lookup Errors ===
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    // === Uniqueness Errors ===
    #[error("User {user_id} already has a {currency} account")]
    DuplicateAccount { user_id: UserId, currency: String },

    #[error("Email already registered: {0}")]
    DuplicateEmail(String),

    #[error("Currency already registered: {0}")]
    DuplicateCurrency(String),

    #[error("Transfer already recorded for idempotency key: {0}")]
    DuplicateRequest(String),

    #[error("Idempotency key reused with different parameters: {0}")]
    IdempotencyKeyReused(String),

    // === Currency Errors ===
    #[error("Unknown currency: {0}")]
    UnknownCurrency(String),

    #[error("Currency is inactive: {0}")]
    CurrencyInactive(String),

    #[error("Currency mismatch: account {from} holds {from_currency}, account {to} holds {to_currency}")]
    CurrencyMismatch {
        from: AccountId,
        from_currency: String,
        to: AccountId,
        to_currency: String,
    },

    // === Account Errors ===
    #[error("Account {0} is not active")]
    AccountNotActive(AccountId),

    #[error("User {0} is not active")]
    UserNotActive(UserId),

    #[error("Insufficient funds on account {account_id}: requested {requested}")]
    InsufficientFunds {
        account_id: AccountId,
        requested: Amount,
    },

    #[error("Account {0} still holds funds and cannot be closed")]
    AccountNotEmpty(AccountId),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidStatusTransition { from: String, to: String },

    #[error("Amount would overflow DECIMAL(18,2)")]
    Overflow,

    // === Store Errors ===
    #[error("Timed out waiting for the ledger store")]
    Timeout,

    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl LedgerError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        LedgerError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Get the stable error code
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::InvalidAmount(_) => "INVALID_AMOUNT",
            LedgerError::SelfTransfer => "SELF_TRANSFER",
            LedgerError::InvalidEmail(_) => "INVALID_EMAIL",
            LedgerError::InvalidIdempotencyKey(_) => "INVALID_IDEMPOTENCY_KEY",
            LedgerError::InvalidField { .. } => "INVALID_FIELD",
            LedgerError::NotFound { .. } => "NOT_FOUND",
            LedgerError::DuplicateAccount { .. } => "DUPLICATE_ACCOUNT",
            LedgerError::DuplicateEmail(_) => "DUPLICATE_EMAIL",
            LedgerError::DuplicateCurrency(_) => "DUPLICATE_CURRENCY",
            LedgerError::DuplicateRequest(_) => "DUPLICATE_REQUEST",
            LedgerError::IdempotencyKeyReused(_) => "IDEMPOTENCY_KEY_REUSED",
            LedgerError::UnknownCurrency(_) => "UNKNOWN_CURRENCY",
            LedgerError::CurrencyInactive(_) => "CURRENCY_INACTIVE",
            LedgerError::CurrencyMismatch { .. } => "CURRENCY_MISMATCH",
            LedgerError::AccountNotActive(_) => "ACCOUNT_NOT_ACTIVE",
            LedgerError::UserNotActive(_) => "USER_NOT_ACTIVE",
            LedgerError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            LedgerError::AccountNotEmpty(_) => "ACCOUNT_NOT_EMPTY",
            LedgerError::InvalidStatusTransition { .. } => "INVALID_STATUS_TRANSITION",
            LedgerError::Overflow => "OVERFLOW",
            LedgerError::Timeout => "TIMEOUT",
            LedgerError::ConcurrencyConflict(_) => "CONCURRENCY_CONFLICT",
            LedgerError::Store(_) => "STORE_ERROR",
            LedgerError::Config(_) => "CONFIG_ERROR",
        }
    }

    /// Store-level conflicts roll back completely and may be retried.
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LedgerError::Timeout | LedgerError::ConcurrencyConflict(_)
        )
    }
}

/// SQLSTATE codes the store maps onto the taxonomy.
pub(crate) mod sqlstate {
    pub const UNIQUE_VIOLATION: &str = "23505";
    pub const SERIALIZATION_FAILURE: &str = "40001";
    pub const DEADLOCK_DETECTED: &str = "40P01";
    pub const LOCK_NOT_AVAILABLE: &str = "55P03";
    pub const QUERY_CANCELED: &str = "57014";
}

impl From<sqlx::Error> for LedgerError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::PoolTimedOut => LedgerError::Timeout,
            sqlx::Error::RowNotFound => LedgerError::Store("row not found".to_string()),
            sqlx::Error::Database(db) => match db.code().as_deref() {
                Some(sqlstate::LOCK_NOT_AVAILABLE) | Some(sqlstate::QUERY_CANCELED) => {
                    LedgerError::Timeout
                }
                Some(sqlstate::SERIALIZATION_FAILURE) | Some(sqlstate::DEADLOCK_DETECTED) => {
                    LedgerError::ConcurrencyConflict(db.message().to_string())
                }
                _ => LedgerError::Store(e.to_string()),
            },
            _ => LedgerError::Store(e.to_string()),
        }
    }
}

impl From<serde_yaml::Error> for LedgerError {
    fn from(e: serde_yaml::Error) -> Self {
        LedgerError::Config(e.to_string())
    }
}
