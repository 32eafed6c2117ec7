//! Repository layer for users and accounts

use std::sync::Arc;

use tracing::{debug, info};

use super::validation::Email;
use crate::core_types::{AccountId, Amount, UserId};
use crate::currency::CurrencyRegistry;
use crate::error::LedgerError;
use crate::models::{Account, AccountStatus, CurrencyCode, User};
use crate::money;
use crate::store::{LedgerStore, NewAccount, NewUser, StoreTx};

// ============================================================================
// UserRepository
// ============================================================================

/// User repository for CRUD operations
pub struct UserRepository<S: LedgerStore> {
    store: Arc<S>,
}

impl<S: LedgerStore> UserRepository<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Create a new user. The email is normalized before the uniqueness check.
    pub async fn create(&self, email: &str, password_hash: &str) -> Result<User, LedgerError> {
        let email = Email::new(email)?;
        let mut tx = self.store.begin().await?;
        let user = tx
            .insert_user(NewUser {
                email: email.into_string(),
                password_hash: password_hash.to_string(),
            })
            .await?;
        tx.commit().await?;

        info!(user_id = user.id, "User created");
        Ok(user)
    }

    /// Get user by ID
    pub async fn get(&self, user_id: UserId) -> Result<User, LedgerError> {
        self.store
            .get_user(user_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("user", user_id))
    }

    pub async fn set_active(&self, user_id: UserId, active: bool) -> Result<User, LedgerError> {
        let mut tx = self.store.begin().await?;
        let user = tx.set_user_active(user_id, active).await?;
        tx.commit().await?;

        info!(user_id, active, "User status changed");
        Ok(user)
    }
}

// ============================================================================
// AccountRepository
// ============================================================================

/// Account repository
///
/// Balances change only through [`AccountRepository::credit_or_debit`], which
/// runs inside a caller-owned store transaction and holds the row lock until
/// that transaction ends.
pub struct AccountRepository<S: LedgerStore> {
    store: Arc<S>,
    currencies: Arc<CurrencyRegistry<S>>,
}

impl<S: LedgerStore> AccountRepository<S> {
    pub fn new(store: Arc<S>, currencies: Arc<CurrencyRegistry<S>>) -> Self {
        Self { store, currencies }
    }

    /// Committed state of an account
    pub async fn get(&self, account_id: AccountId) -> Result<Account, LedgerError> {
        self.store
            .get_account(account_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("account", account_id))
    }

    pub async fn list_for_user(&self, user_id: UserId) -> Result<Vec<Account>, LedgerError> {
        self.store.accounts_for_user(user_id).await
    }

    /// Open a zero-balance account for an active user.
    ///
    /// # Errors
    /// * `NotFound` / `UserNotActive` - owner missing or disabled
    /// * `UnknownCurrency` / `CurrencyInactive` - see [`CurrencyRegistry::resolve`]
    /// * `DuplicateAccount` - the user already holds this currency
    pub async fn open(&self, user_id: UserId, code: CurrencyCode) -> Result<Account, LedgerError> {
        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("user", user_id))?;
        if !user.is_active {
            return Err(LedgerError::UserNotActive(user_id));
        }
        let currency = self.currencies.resolve(code).await?;

        let mut tx = self.store.begin().await?;
        let account = tx
            .insert_account(NewAccount {
                user_id,
                currency_id: currency.id,
            })
            .await
            .map_err(|e| match e {
                LedgerError::DuplicateAccount { user_id, .. } => LedgerError::DuplicateAccount {
                    user_id,
                    currency: code.to_string(),
                },
                other => other,
            })?;
        tx.commit().await?;

        info!(account_id = account.id, user_id, currency = %code, "Account opened");
        Ok(account)
    }

    /// Apply a signed delta to an active account inside `tx`.
    ///
    /// Takes the row lock (if `tx` does not hold it yet) and writes the new
    /// balance. Nothing is visible outside `tx` until it commits.
    ///
    /// # Errors
    /// * `NotFound` - no such account
    /// * `AccountNotActive` - status is not `active`
    /// * `InsufficientFunds` - the balance would become negative
    /// * `Overflow` - the balance would exceed `DECIMAL(18,2)`
    /// * `Timeout` - the row lock wait exceeded the store bound
    pub async fn credit_or_debit(
        &self,
        tx: &mut S::Tx,
        account_id: AccountId,
        delta: Amount,
    ) -> Result<Account, LedgerError> {
        let mut account = tx.lock_account(account_id).await?;
        if !account.is_active() {
            return Err(LedgerError::AccountNotActive(account_id));
        }

        let balance = money::apply_delta(account.balance, delta)?;
        if balance.is_sign_negative() && !balance.is_zero() {
            return Err(LedgerError::InsufficientFunds {
                account_id,
                requested: money::to_storage(delta.abs()),
            });
        }

        debug!(account_id, %delta, old = %account.balance, new = %balance, "Balance updated");
        account.balance = balance;
        tx.update_account(&account).await?;
        Ok(account)
    }

    /// Change account status under row lock.
    ///
    /// `active <-> blocked`, `active | blocked -> closed`. Closing requires a
    /// zero balance; `closed` is terminal.
    pub async fn set_status(
        &self,
        account_id: AccountId,
        status: AccountStatus,
    ) -> Result<Account, LedgerError> {
        let mut tx = self.store.begin().await?;
        let mut account = tx.lock_account(account_id).await?;

        if !account.status.can_transition_to(status) {
            return Err(LedgerError::InvalidStatusTransition {
                from: account.status.to_string(),
                to: status.to_string(),
            });
        }
        if status == AccountStatus::Closed && !account.balance.is_zero() {
            return Err(LedgerError::AccountNotEmpty(account_id));
        }

        let previous = account.status;
        account.status = status;
        tx.update_account(&account).await?;
        tx.commit().await?;

        info!(account_id, from = %previous, to = %status, "Account status changed");
        Ok(account)
    }
}
