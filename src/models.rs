//! Ledger data model
//!
//! Plain records for the five persisted tables. Enum-valued columns are
//! closed Rust enums; field constraints are checked by the `validate`
//! method of each record before it reaches the store.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core_types::{AccountId, Amount, CurrencyId, TransactionId, TransferId, UserId};
use crate::error::LedgerError;
use crate::money;

/// Implements `as_str`, `Display` and `FromStr` for a closed string enum.
macro_rules! string_enum {
    ($name:ident, $label:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = LedgerError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(LedgerError::InvalidField {
                        field: $label,
                        reason: format!("unknown value '{other}'"),
                    }),
                }
            }
        }
    };
}

// ============================================================================
// Enumerations
// ============================================================================

/// Supported currency codes (`currencies.code`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CurrencyCode {
    Rub,
    Eur,
    Usd,
}

string_enum!(CurrencyCode, "currency code", {
    Rub => "rub",
    Eur => "eur",
    Usd => "usd",
});

impl CurrencyCode {
    /// Display name used when registering the default currency set
    pub fn default_name(&self) -> &'static str {
        match self {
            CurrencyCode::Rub => "Russian Ruble",
            CurrencyCode::Eur => "Euro",
            CurrencyCode::Usd => "US Dollar",
        }
    }

    /// Parse a currency code, reporting unknown codes as `UnknownCurrency`
    pub fn parse(code: &str) -> Result<Self, LedgerError> {
        code.trim()
            .to_ascii_lowercase()
            .parse()
            .map_err(|_| LedgerError::UnknownCurrency(code.to_string()))
    }
}

/// Account lifecycle status (`accounts.status`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Blocked,
    Closed,
}

string_enum!(AccountStatus, "account status", {
    Active => "active",
    Blocked => "blocked",
    Closed => "closed",
});

impl AccountStatus {
    /// `closed` is terminal; `active` and `blocked` may swap freely.
    pub fn can_transition_to(&self, next: AccountStatus) -> bool {
        use AccountStatus::*;
        matches!(
            (self, next),
            (Active, Blocked) | (Blocked, Active) | (Active, Closed) | (Blocked, Closed)
        )
    }
}

/// Outcome status shared by transfers and ledger entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Completed,
    Failed,
}

string_enum!(OperationStatus, "status", {
    Pending => "pending",
    Completed => "completed",
    Failed => "failed",
});

/// Ledger entry direction (`transactions.type`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    /// Removes value from the account
    Debit,
    /// Adds value to the account
    Credit,
}

string_enum!(TransactionType, "transaction type", {
    Debit => "debit",
    Credit => "credit",
});

/// Why a transfer ended in `failed`
///
/// Persisted with the transfer so an idempotent replay can surface the
/// original error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    InsufficientFunds,
    SourceNotActive,
    DestinationNotActive,
    BalanceOverflow,
}

string_enum!(FailureReason, "failure reason", {
    InsufficientFunds => "insufficient_funds",
    SourceNotActive => "source_not_active",
    DestinationNotActive => "destination_not_active",
    BalanceOverflow => "balance_overflow",
});

impl FailureReason {
    /// Classify a business error raised while moving funds.
    ///
    /// Returns `None` for errors that must not leave a failed transfer
    /// behind (store conflicts, timeouts, programming errors).
    pub fn from_error(err: &LedgerError, from: AccountId) -> Option<Self> {
        match err {
            LedgerError::InsufficientFunds { .. } => Some(FailureReason::InsufficientFunds),
            LedgerError::AccountNotActive(id) if *id == from => {
                Some(FailureReason::SourceNotActive)
            }
            LedgerError::AccountNotActive(_) => Some(FailureReason::DestinationNotActive),
            LedgerError::Overflow => Some(FailureReason::BalanceOverflow),
            _ => None,
        }
    }

    /// Rebuild the error originally returned for this failure
    pub fn to_error(&self, transfer: &Transfer) -> LedgerError {
        match self {
            FailureReason::InsufficientFunds => LedgerError::InsufficientFunds {
                account_id: transfer.from_account_id,
                requested: transfer.amount,
            },
            FailureReason::SourceNotActive => {
                LedgerError::AccountNotActive(transfer.from_account_id)
            }
            FailureReason::DestinationNotActive => {
                LedgerError::AccountNotActive(transfer.to_account_id)
            }
            FailureReason::BalanceOverflow => LedgerError::Overflow,
        }
    }
}

// ============================================================================
// Records
// ============================================================================

/// Ledger user (`users`)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct User {
    pub id: UserId,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub is_active: bool,
}

impl User {
    pub fn validate(&self) -> Result<(), LedgerError> {
        crate::account::validation::Email::new(&self.email)?;
        if self.password_hash.is_empty() {
            return Err(LedgerError::InvalidField {
                field: "password_hash",
                reason: "must not be empty".into(),
            });
        }
        Ok(())
    }
}

/// Currency definition (`currencies`)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Currency {
    pub id: CurrencyId,
    pub code: CurrencyCode,
    pub name: String,
    pub is_active: bool,
}

impl Currency {
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.name.trim().is_empty() {
            return Err(LedgerError::InvalidField {
                field: "currency name",
                reason: "must not be empty".into(),
            });
        }
        Ok(())
    }
}

/// Balance-holding account (`accounts`), unique per (user, currency)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Account {
    pub id: AccountId,
    pub user_id: UserId,
    pub currency_id: CurrencyId,
    pub balance: Amount,
    pub status: AccountStatus,
}

impl Account {
    #[inline]
    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }

    /// Enforces `CHECK (balance >= 0)` and the column scale
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.balance.is_sign_negative() && !self.balance.is_zero() {
            return Err(LedgerError::InvalidField {
                field: "balance",
                reason: format!("{} is negative", self.balance),
            });
        }
        if self.balance.normalize().scale() > money::SCALE || self.balance > money::max_amount() {
            return Err(LedgerError::InvalidField {
                field: "balance",
                reason: format!("{} does not fit DECIMAL(18,2)", self.balance),
            });
        }
        Ok(())
    }
}

/// Public unit of work moving funds between two accounts (`transfers`)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transfer {
    #[serde(skip_serializing)]
    pub id: TransferId,
    pub public_id: Uuid,
    pub idempotency_key: Option<String>,
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub amount: Amount,
    pub status: OperationStatus,
    pub failure_reason: Option<FailureReason>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transfer {
    /// Enforces `CHECK (amount > 0)` and distinct endpoints
    pub fn validate(&self) -> Result<(), LedgerError> {
        money::validate_amount(self.amount)?;
        if self.from_account_id == self.to_account_id {
            return Err(LedgerError::SelfTransfer);
        }
        match (self.status, self.failure_reason) {
            (OperationStatus::Failed, None) => Err(LedgerError::InvalidField {
                field: "failure_reason",
                reason: "failed transfer without a reason".into(),
            }),
            (OperationStatus::Pending | OperationStatus::Completed, Some(_)) => {
                Err(LedgerError::InvalidField {
                    field: "failure_reason",
                    reason: format!("set on a {} transfer", self.status),
                })
            }
            _ => Ok(()),
        }
    }

    /// Whether a replayed request carries the same parameters as this transfer
    pub fn matches(&self, from: AccountId, to: AccountId, amount: Amount) -> bool {
        self.from_account_id == from && self.to_account_id == to && self.amount == amount
    }
}

/// Append-only ledger entry (`transactions`)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub account_id: AccountId,
    /// Internal id of the originating transfer; `None` for deposits and withdrawals
    pub reference: Option<TransferId>,
    #[serde(rename = "type")]
    pub tx_type: TransactionType,
    pub amount: Amount,
    pub status: OperationStatus,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    pub fn validate(&self) -> Result<(), LedgerError> {
        money::validate_amount(self.amount)?;
        Ok(())
    }

    /// Amount with the sign of its effect on the account balance
    pub fn signed_amount(&self) -> Amount {
        match self.tx_type {
            TransactionType::Debit => -self.amount,
            TransactionType::Credit => self.amount,
        }
    }
}
