//! PostgreSQL Ledger Store
//!
//! Account row locks are `SELECT ... FOR NO KEY UPDATE`: exclusive between
//! writers, but compatible with the key-share locks that foreign-key checks
//! on `transfers` and `transactions` take. Lock waits are bounded per
//! transaction with `SET LOCAL lock_timeout`, so a blocked transfer fails
//! with SQLSTATE 55P03 (mapped to `LedgerError::Timeout`) instead of hanging.
//!
//! Enum columns are native PostgreSQL enums; they are bound as text with an
//! explicit cast and read back through `::text`.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres};
use tracing::debug;
use uuid::Uuid;

use super::{LedgerStore, NewAccount, NewCurrency, NewTransaction, NewTransfer, NewUser, StoreTx};
use crate::core_types::{AccountId, Amount, CurrencyId, TransferId, UserId};
use crate::db::SafeRow;
use crate::error::{LedgerError, sqlstate};
use crate::models::{
    Account, Currency, CurrencyCode, FailureReason, OperationStatus, Transaction, Transfer, User,
};
use crate::money;
use crate::transfer::state;

const USER_COLUMNS: &str = "id, email, password_hash, is_active";
const CURRENCY_COLUMNS: &str = "id, code::text AS code, name, is_active";
const ACCOUNT_COLUMNS: &str = "id, user_id, currency_id, balance, status::text AS status";
const TRANSFER_COLUMNS: &str = "id, public_id, idempotency_key, from_account_id, to_account_id, \
     amount, status::text AS status, failure_reason, created_at, updated_at";
const TRANSACTION_COLUMNS: &str =
    "id, account_id, reference, type::text AS type, amount, status::text AS status, created_at";

// ============================================================================
// Row decoding
// ============================================================================

fn user_from_row(row: &PgRow) -> Result<User, LedgerError> {
    Ok(User {
        id: row.column("id")?,
        email: row.column("email")?,
        password_hash: row.column("password_hash")?,
        is_active: row.column("is_active")?,
    })
}

fn currency_from_row(row: &PgRow) -> Result<Currency, LedgerError> {
    Ok(Currency {
        id: row.column("id")?,
        code: row.enum_column("code")?,
        name: row.column("name")?,
        is_active: row.column("is_active")?,
    })
}

fn account_from_row(row: &PgRow) -> Result<Account, LedgerError> {
    Ok(Account {
        id: row.column("id")?,
        user_id: row.column("user_id")?,
        currency_id: row.column("currency_id")?,
        balance: row.column("balance")?,
        status: row.enum_column("status")?,
    })
}

fn transfer_from_row(row: &PgRow) -> Result<Transfer, LedgerError> {
    let failure_reason: Option<String> = row.column("failure_reason")?;
    Ok(Transfer {
        id: row.column("id")?,
        public_id: row.column("public_id")?,
        idempotency_key: row.column("idempotency_key")?,
        from_account_id: row.column("from_account_id")?,
        to_account_id: row.column("to_account_id")?,
        amount: row.column("amount")?,
        status: row.enum_column("status")?,
        failure_reason: failure_reason.map(|r| r.parse()).transpose()?,
        created_at: row.column("created_at")?,
        updated_at: row.column("updated_at")?,
    })
}

fn transaction_from_row(row: &PgRow) -> Result<Transaction, LedgerError> {
    Ok(Transaction {
        id: row.column("id")?,
        account_id: row.column("account_id")?,
        reference: row.column("reference")?,
        tx_type: row.enum_column("type")?,
        amount: row.column("amount")?,
        status: row.enum_column("status")?,
        created_at: row.column("created_at")?,
    })
}

/// Constraint name of a unique violation, if `e` is one
fn unique_violation(e: &sqlx::Error) -> Option<String> {
    match e {
        sqlx::Error::Database(db) if db.code().as_deref() == Some(sqlstate::UNIQUE_VIOLATION) => {
            Some(db.constraint().unwrap_or_default().to_string())
        }
        _ => None,
    }
}

// ============================================================================
// Store
// ============================================================================

/// PostgreSQL-backed ledger store
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PgStore {
    pub fn new(pool: PgPool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl LedgerStore for PgStore {
    type Tx = PgTx;

    async fn begin(&self) -> Result<PgTx, LedgerError> {
        let mut tx = self.pool.begin().await?;
        // SET does not accept bind parameters; the value is an integer.
        sqlx::query(&format!(
            "SET LOCAL lock_timeout = '{}ms'",
            self.lock_timeout.as_millis()
        ))
        .execute(&mut *tx)
        .await?;

        Ok(PgTx {
            tx,
            locked: HashSet::new(),
        })
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>, LedgerError> {
        sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(user_from_row)
            .transpose()
    }

    async fn get_currency(&self, id: CurrencyId) -> Result<Option<Currency>, LedgerError> {
        sqlx::query(&format!(
            "SELECT {CURRENCY_COLUMNS} FROM currencies WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(currency_from_row)
        .transpose()
    }

    async fn get_currency_by_code(
        &self,
        code: CurrencyCode,
    ) -> Result<Option<Currency>, LedgerError> {
        sqlx::query(&format!(
            "SELECT {CURRENCY_COLUMNS} FROM currencies WHERE code = $1::currency_code"
        ))
        .bind(code.as_str())
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(currency_from_row)
        .transpose()
    }

    async fn list_currencies(&self) -> Result<Vec<Currency>, LedgerError> {
        sqlx::query(&format!(
            "SELECT {CURRENCY_COLUMNS} FROM currencies ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(currency_from_row)
        .collect()
    }

    async fn get_account(&self, id: AccountId) -> Result<Option<Account>, LedgerError> {
        sqlx::query(&format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(account_from_row)
            .transpose()
    }

    async fn list_accounts(&self) -> Result<Vec<Account>, LedgerError> {
        sqlx::query(&format!("SELECT {ACCOUNT_COLUMNS} FROM accounts ORDER BY id"))
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(account_from_row)
            .collect()
    }

    async fn accounts_for_user(&self, user_id: UserId) -> Result<Vec<Account>, LedgerError> {
        sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE user_id = $1 ORDER BY id"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(account_from_row)
        .collect()
    }

    async fn get_transfer(&self, id: TransferId) -> Result<Option<Transfer>, LedgerError> {
        sqlx::query(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(transfer_from_row)
        .transpose()
    }

    async fn get_transfer_by_public_id(
        &self,
        public_id: Uuid,
    ) -> Result<Option<Transfer>, LedgerError> {
        sqlx::query(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers WHERE public_id = $1"
        ))
        .bind(public_id)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(transfer_from_row)
        .transpose()
    }

    async fn get_transfer_by_key(&self, key: &str) -> Result<Option<Transfer>, LedgerError> {
        sqlx::query(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers WHERE idempotency_key = $1"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(transfer_from_row)
        .transpose()
    }

    async fn transactions_for_account(
        &self,
        account_id: AccountId,
    ) -> Result<Vec<Transaction>, LedgerError> {
        sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE account_id = $1 ORDER BY id"
        ))
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(transaction_from_row)
        .collect()
    }

    async fn transactions_for_transfer(
        &self,
        transfer_id: TransferId,
    ) -> Result<Vec<Transaction>, LedgerError> {
        sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE reference = $1 ORDER BY id"
        ))
        .bind(transfer_id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(transaction_from_row)
        .collect()
    }

    async fn completed_sum(&self, account_id: AccountId) -> Result<Amount, LedgerError> {
        let sum: Amount = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(CASE WHEN type = 'credit' THEN amount ELSE -amount END), 0)::NUMERIC
            FROM transactions
            WHERE account_id = $1 AND status = 'completed'
            "#,
        )
        .bind(account_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(money::to_storage(sum))
    }
}

// ============================================================================
// Transaction
// ============================================================================

/// Transaction over [`PgStore`]; dropping it rolls back
pub struct PgTx {
    tx: sqlx::Transaction<'static, Postgres>,
    locked: HashSet<AccountId>,
}

#[async_trait]
impl StoreTx for PgTx {
    async fn insert_user(&mut self, new: NewUser) -> Result<User, LedgerError> {
        let row = sqlx::query(&format!(
            "INSERT INTO users (email, password_hash) VALUES ($1, $2) RETURNING {USER_COLUMNS}"
        ))
        .bind(&new.email)
        .bind(&new.password_hash)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| match unique_violation(&e) {
            Some(_) => LedgerError::DuplicateEmail(new.email.clone()),
            None => e.into(),
        })?;
        user_from_row(&row)
    }

    async fn set_user_active(&mut self, id: UserId, active: bool) -> Result<User, LedgerError> {
        let row = sqlx::query(&format!(
            "UPDATE users SET is_active = $2 WHERE id = $1 RETURNING {USER_COLUMNS}"
        ))
        .bind(id)
        .bind(active)
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| LedgerError::not_found("user", id))?;
        user_from_row(&row)
    }

    async fn insert_currency(&mut self, new: NewCurrency) -> Result<Currency, LedgerError> {
        let row = sqlx::query(&format!(
            "INSERT INTO currencies (code, name) VALUES ($1::currency_code, $2) \
             RETURNING {CURRENCY_COLUMNS}"
        ))
        .bind(new.code.as_str())
        .bind(&new.name)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| match unique_violation(&e) {
            Some(_) => LedgerError::DuplicateCurrency(new.code.to_string()),
            None => e.into(),
        })?;
        currency_from_row(&row)
    }

    async fn set_currency_active(
        &mut self,
        code: CurrencyCode,
        active: bool,
    ) -> Result<Currency, LedgerError> {
        let row = sqlx::query(&format!(
            "UPDATE currencies SET is_active = $2 WHERE code = $1::currency_code \
             RETURNING {CURRENCY_COLUMNS}"
        ))
        .bind(code.as_str())
        .bind(active)
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| LedgerError::UnknownCurrency(code.to_string()))?;
        currency_from_row(&row)
    }

    async fn insert_account(&mut self, new: NewAccount) -> Result<Account, LedgerError> {
        let row = sqlx::query(&format!(
            "INSERT INTO accounts (user_id, currency_id) VALUES ($1, $2) \
             RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(new.user_id)
        .bind(new.currency_id)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| match unique_violation(&e) {
            // The repository replaces the id with the currency code.
            Some(_) => LedgerError::DuplicateAccount {
                user_id: new.user_id,
                currency: new.currency_id.to_string(),
            },
            None => e.into(),
        })?;

        let account = account_from_row(&row)?;
        // Uncommitted inserts are only visible to this transaction.
        self.locked.insert(account.id);
        Ok(account)
    }

    async fn lock_account(&mut self, id: AccountId) -> Result<Account, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1 FOR NO KEY UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| LedgerError::not_found("account", id))?;

        self.locked.insert(id);
        debug!(account_id = id, "Account row locked");
        account_from_row(&row)
    }

    async fn update_account(&mut self, account: &Account) -> Result<(), LedgerError> {
        if !self.locked.contains(&account.id) {
            return Err(LedgerError::Store(format!(
                "account {} updated without holding its row lock",
                account.id
            )));
        }
        account.validate()?;

        sqlx::query("UPDATE accounts SET balance = $2, status = $3::account_status WHERE id = $1")
            .bind(account.id)
            .bind(money::to_storage(account.balance))
            .bind(account.status.as_str())
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn insert_transfer(&mut self, new: NewTransfer) -> Result<Transfer, LedgerError> {
        let row = sqlx::query(&format!(
            "INSERT INTO transfers \
             (public_id, idempotency_key, from_account_id, to_account_id, amount, status, failure_reason) \
             VALUES ($1, $2, $3, $4, $5, $6::operation_status, $7) \
             RETURNING {TRANSFER_COLUMNS}"
        ))
        .bind(new.public_id)
        .bind(new.idempotency_key.as_deref())
        .bind(new.from_account_id)
        .bind(new.to_account_id)
        .bind(money::to_storage(new.amount))
        .bind(new.status.as_str())
        .bind(new.failure_reason.map(|r| r.as_str()))
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| match unique_violation(&e).as_deref() {
            Some("transfers_idempotency_key_key") => {
                LedgerError::DuplicateRequest(new.idempotency_key.clone().unwrap_or_default())
            }
            Some(constraint) => {
                LedgerError::Store(format!("transfer insert violates {constraint}"))
            }
            None => e.into(),
        })?;

        let transfer = transfer_from_row(&row)?;
        transfer.validate()?;
        Ok(transfer)
    }

    async fn finish_transfer(
        &mut self,
        id: TransferId,
        status: OperationStatus,
        failure_reason: Option<FailureReason>,
    ) -> Result<Transfer, LedgerError> {
        let current: String =
            sqlx::query_scalar("SELECT status::text FROM transfers WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *self.tx)
                .await?
                .ok_or_else(|| LedgerError::not_found("transfer", id))?;
        state::ensure_transition(current.parse()?, status)?;

        let row = sqlx::query(&format!(
            "UPDATE transfers \
             SET status = $2::operation_status, failure_reason = $3, updated_at = NOW() \
             WHERE id = $1 RETURNING {TRANSFER_COLUMNS}"
        ))
        .bind(id)
        .bind(status.as_str())
        .bind(failure_reason.map(|r| r.as_str()))
        .fetch_one(&mut *self.tx)
        .await?;

        let transfer = transfer_from_row(&row)?;
        transfer.validate()?;
        Ok(transfer)
    }

    async fn insert_transaction(
        &mut self,
        new: NewTransaction,
    ) -> Result<Transaction, LedgerError> {
        money::validate_amount(new.amount)?;
        let row = sqlx::query(&format!(
            "INSERT INTO transactions (account_id, reference, type, amount, status) \
             VALUES ($1, $2, $3::transaction_type, $4, $5::operation_status) \
             RETURNING {TRANSACTION_COLUMNS}"
        ))
        .bind(new.account_id)
        .bind(new.reference)
        .bind(new.tx_type.as_str())
        .bind(money::to_storage(new.amount))
        .bind(new.status.as_str())
        .fetch_one(&mut *self.tx)
        .await?;
        transaction_from_row(&row)
    }

    async fn commit(self) -> Result<(), LedgerError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<(), LedgerError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
