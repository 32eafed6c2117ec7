//! In-memory Ledger Store
//!
//! A process-local implementation of the store contract, used by tests and
//! single-process deployments.
//!
//! # Model
//!
//! - Committed rows live in one `Tables` value behind a mutex that is only
//!   held for short, non-async critical sections.
//! - Each account has its own async row lock (`tokio::sync::Mutex<()>`).
//!   A transaction keeps the owned guard until it commits or is dropped.
//! - Writes are staged inside [`MemoryTx`] and published atomically on
//!   commit. Reads outside a transaction see the last committed state.
//! - Unique indexes are reserved at insert time, so two in-flight
//!   transactions cannot both claim the same key.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{LedgerStore, NewAccount, NewCurrency, NewTransaction, NewTransfer, NewUser, StoreTx};
use crate::core_types::{AccountId, Amount, CurrencyId, TransferId, UserId};
use crate::error::LedgerError;
use crate::models::{
    Account, AccountStatus, Currency, CurrencyCode, FailureReason, OperationStatus, Transaction,
    Transfer, User,
};
use crate::money;
use crate::transfer::state;

/// Default bound on row-lock waits
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum UniqueKey {
    Email(String),
    Currency(CurrencyCode),
    AccountOwner(UserId, CurrencyId),
    IdempotencyKey(String),
}

#[derive(Default)]
struct Tables {
    users: BTreeMap<UserId, User>,
    currencies: BTreeMap<CurrencyId, Currency>,
    accounts: BTreeMap<AccountId, Account>,
    transfers: BTreeMap<TransferId, Transfer>,
    transactions: Vec<Transaction>,

    transfer_keys: HashMap<String, TransferId>,
    public_ids: HashMap<Uuid, TransferId>,

    unique: HashSet<UniqueKey>,
    /// Keys claimed by transactions that have not committed yet
    reserved: HashSet<UniqueKey>,
}

impl Tables {
    fn duplicate_error(&self, key: &UniqueKey) -> LedgerError {
        match key {
            UniqueKey::Email(email) => LedgerError::DuplicateEmail(email.clone()),
            UniqueKey::Currency(code) => LedgerError::DuplicateCurrency(code.to_string()),
            UniqueKey::AccountOwner(user_id, currency_id) => LedgerError::DuplicateAccount {
                user_id: *user_id,
                currency: self
                    .currencies
                    .get(currency_id)
                    .map(|c| c.code.to_string())
                    .unwrap_or_else(|| currency_id.to_string()),
            },
            UniqueKey::IdempotencyKey(key) => LedgerError::DuplicateRequest(key.clone()),
        }
    }

    /// Claim a unique key for an in-flight transaction
    fn reserve(&mut self, key: UniqueKey) -> Result<(), LedgerError> {
        if self.unique.contains(&key) {
            return Err(self.duplicate_error(&key));
        }
        if self.reserved.contains(&key) {
            return Err(LedgerError::ConcurrencyConflict(format!(
                "unique key {key:?} is being written by another transaction"
            )));
        }
        self.reserved.insert(key);
        Ok(())
    }
}

struct Shared {
    tables: Mutex<Tables>,
    row_locks: DashMap<AccountId, Arc<tokio::sync::Mutex<()>>>,
    user_seq: AtomicI64,
    currency_seq: AtomicI64,
    account_seq: AtomicI64,
    transfer_seq: AtomicI64,
    transaction_seq: AtomicI64,
}

impl Shared {
    fn tables(&self) -> Result<MutexGuard<'_, Tables>, LedgerError> {
        self.tables
            .lock()
            .map_err(|_| LedgerError::Store("memory store state poisoned".into()))
    }

    fn row_lock(&self, id: AccountId) -> Arc<tokio::sync::Mutex<()>> {
        self.row_locks
            .entry(id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

fn next(seq: &AtomicI64) -> i64 {
    seq.fetch_add(1, Ordering::SeqCst)
}

/// In-memory ledger store
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
    lock_timeout: Duration,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    /// Create a store whose row-lock waits give up after `lock_timeout`
    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                tables: Mutex::new(Tables::default()),
                row_locks: DashMap::new(),
                user_seq: AtomicI64::new(1),
                currency_seq: AtomicI64::new(1),
                account_seq: AtomicI64::new(1),
                transfer_seq: AtomicI64::new(1),
                transaction_seq: AtomicI64::new(1),
            }),
            lock_timeout,
        }
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx, LedgerError> {
        Ok(MemoryTx {
            shared: self.shared.clone(),
            lock_timeout: self.lock_timeout,
            guards: HashMap::new(),
            users: BTreeMap::new(),
            currencies: BTreeMap::new(),
            accounts: BTreeMap::new(),
            transfers: BTreeMap::new(),
            transactions: Vec::new(),
            reserved: Vec::new(),
            finished: false,
        })
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>, LedgerError> {
        Ok(self.shared.tables()?.users.get(&id).cloned())
    }

    async fn get_currency(&self, id: CurrencyId) -> Result<Option<Currency>, LedgerError> {
        Ok(self.shared.tables()?.currencies.get(&id).cloned())
    }

    async fn get_currency_by_code(
        &self,
        code: CurrencyCode,
    ) -> Result<Option<Currency>, LedgerError> {
        Ok(self
            .shared
            .tables()?
            .currencies
            .values()
            .find(|c| c.code == code)
            .cloned())
    }

    async fn list_currencies(&self) -> Result<Vec<Currency>, LedgerError> {
        Ok(self.shared.tables()?.currencies.values().cloned().collect())
    }

    async fn get_account(&self, id: AccountId) -> Result<Option<Account>, LedgerError> {
        Ok(self.shared.tables()?.accounts.get(&id).cloned())
    }

    async fn list_accounts(&self) -> Result<Vec<Account>, LedgerError> {
        Ok(self.shared.tables()?.accounts.values().cloned().collect())
    }

    async fn accounts_for_user(&self, user_id: UserId) -> Result<Vec<Account>, LedgerError> {
        Ok(self
            .shared
            .tables()?
            .accounts
            .values()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn get_transfer(&self, id: TransferId) -> Result<Option<Transfer>, LedgerError> {
        Ok(self.shared.tables()?.transfers.get(&id).cloned())
    }

    async fn get_transfer_by_public_id(
        &self,
        public_id: Uuid,
    ) -> Result<Option<Transfer>, LedgerError> {
        let tables = self.shared.tables()?;
        Ok(tables
            .public_ids
            .get(&public_id)
            .and_then(|id| tables.transfers.get(id))
            .cloned())
    }

    async fn get_transfer_by_key(&self, key: &str) -> Result<Option<Transfer>, LedgerError> {
        let tables = self.shared.tables()?;
        Ok(tables
            .transfer_keys
            .get(key)
            .and_then(|id| tables.transfers.get(id))
            .cloned())
    }

    async fn transactions_for_account(
        &self,
        account_id: AccountId,
    ) -> Result<Vec<Transaction>, LedgerError> {
        Ok(self
            .shared
            .tables()?
            .transactions
            .iter()
            .filter(|t| t.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn transactions_for_transfer(
        &self,
        transfer_id: TransferId,
    ) -> Result<Vec<Transaction>, LedgerError> {
        Ok(self
            .shared
            .tables()?
            .transactions
            .iter()
            .filter(|t| t.reference == Some(transfer_id))
            .cloned()
            .collect())
    }

    async fn completed_sum(&self, account_id: AccountId) -> Result<Amount, LedgerError> {
        let sum: Amount = self
            .shared
            .tables()?
            .transactions
            .iter()
            .filter(|t| t.account_id == account_id && t.status == OperationStatus::Completed)
            .map(Transaction::signed_amount)
            .sum();
        Ok(money::to_storage(sum))
    }
}

/// Transaction over [`MemoryStore`]
pub struct MemoryTx {
    shared: Arc<Shared>,
    lock_timeout: Duration,
    guards: HashMap<AccountId, OwnedMutexGuard<()>>,

    users: BTreeMap<UserId, User>,
    currencies: BTreeMap<CurrencyId, Currency>,
    accounts: BTreeMap<AccountId, Account>,
    transfers: BTreeMap<TransferId, Transfer>,
    transactions: Vec<Transaction>,

    reserved: Vec<UniqueKey>,
    finished: bool,
}

impl MemoryTx {
    fn reserve(&mut self, key: UniqueKey) -> Result<(), LedgerError> {
        self.shared.tables()?.reserve(key.clone())?;
        self.reserved.push(key);
        Ok(())
    }

    fn current_user(&self, id: UserId) -> Result<User, LedgerError> {
        if let Some(user) = self.users.get(&id) {
            return Ok(user.clone());
        }
        self.shared
            .tables()?
            .users
            .get(&id)
            .cloned()
            .ok_or_else(|| LedgerError::not_found("user", id))
    }

    fn current_currency(&self, code: CurrencyCode) -> Result<Currency, LedgerError> {
        if let Some(currency) = self.currencies.values().find(|c| c.code == code) {
            return Ok(currency.clone());
        }
        self.shared
            .tables()?
            .currencies
            .values()
            .find(|c| c.code == code)
            .cloned()
            .ok_or_else(|| LedgerError::UnknownCurrency(code.to_string()))
    }

    fn current_transfer(&self, id: TransferId) -> Result<Transfer, LedgerError> {
        if let Some(transfer) = self.transfers.get(&id) {
            return Ok(transfer.clone());
        }
        self.shared
            .tables()?
            .transfers
            .get(&id)
            .cloned()
            .ok_or_else(|| LedgerError::not_found("transfer", id))
    }

    fn release_reservations(&mut self) {
        if self.reserved.is_empty() {
            return;
        }
        match self.shared.tables.lock() {
            Ok(mut tables) => {
                for key in self.reserved.drain(..) {
                    tables.reserved.remove(&key);
                }
            }
            Err(_) => warn!("memory store poisoned; unique reservations leaked"),
        }
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn insert_user(&mut self, new: NewUser) -> Result<User, LedgerError> {
        let user = User {
            id: 0,
            email: new.email,
            password_hash: new.password_hash,
            is_active: true,
        };
        user.validate()?;
        self.reserve(UniqueKey::Email(user.email.clone()))?;

        let user = User {
            id: next(&self.shared.user_seq),
            ..user
        };
        self.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn set_user_active(&mut self, id: UserId, active: bool) -> Result<User, LedgerError> {
        let mut user = self.current_user(id)?;
        user.is_active = active;
        self.users.insert(id, user.clone());
        Ok(user)
    }

    async fn insert_currency(&mut self, new: NewCurrency) -> Result<Currency, LedgerError> {
        let currency = Currency {
            id: 0,
            code: new.code,
            name: new.name,
            is_active: true,
        };
        currency.validate()?;
        self.reserve(UniqueKey::Currency(currency.code))?;

        let currency = Currency {
            id: next(&self.shared.currency_seq),
            ..currency
        };
        self.currencies.insert(currency.id, currency.clone());
        Ok(currency)
    }

    async fn set_currency_active(
        &mut self,
        code: CurrencyCode,
        active: bool,
    ) -> Result<Currency, LedgerError> {
        let mut currency = self.current_currency(code)?;
        currency.is_active = active;
        self.currencies.insert(currency.id, currency.clone());
        Ok(currency)
    }

    async fn insert_account(&mut self, new: NewAccount) -> Result<Account, LedgerError> {
        self.reserve(UniqueKey::AccountOwner(new.user_id, new.currency_id))?;

        let account = Account {
            id: next(&self.shared.account_seq),
            user_id: new.user_id,
            currency_id: new.currency_id,
            balance: money::to_storage(Amount::ZERO),
            status: AccountStatus::Active,
        };

        // A freshly inserted row is invisible to everyone else, so its lock
        // can never be contended.
        let guard = self
            .shared
            .row_lock(account.id)
            .try_lock_owned()
            .map_err(|_| LedgerError::Store(format!("new account {} already locked", account.id)))?;
        self.guards.insert(account.id, guard);
        self.accounts.insert(account.id, account.clone());
        Ok(account)
    }

    async fn lock_account(&mut self, id: AccountId) -> Result<Account, LedgerError> {
        if self.guards.contains_key(&id) {
            if let Some(account) = self.accounts.get(&id) {
                return Ok(account.clone());
            }
        }

        if !self.shared.tables()?.accounts.contains_key(&id) {
            return Err(LedgerError::not_found("account", id));
        }

        let lock = self.shared.row_lock(id);
        let guard = tokio::time::timeout(self.lock_timeout, lock.lock_owned())
            .await
            .map_err(|_| {
                debug!(
                    account_id = id,
                    timeout_ms = self.lock_timeout.as_millis() as u64,
                    "Row lock wait timed out"
                );
                LedgerError::Timeout
            })?;

        // Re-read after acquiring: the previous holder may have committed.
        let account = self
            .shared
            .tables()?
            .accounts
            .get(&id)
            .cloned()
            .ok_or_else(|| LedgerError::not_found("account", id))?;

        self.guards.insert(id, guard);
        self.accounts.insert(id, account.clone());
        Ok(account)
    }

    async fn update_account(&mut self, account: &Account) -> Result<(), LedgerError> {
        if !self.guards.contains_key(&account.id) {
            return Err(LedgerError::Store(format!(
                "account {} updated without holding its row lock",
                account.id
            )));
        }
        account.validate()?;

        let staged = self
            .accounts
            .get_mut(&account.id)
            .ok_or_else(|| LedgerError::not_found("account", account.id))?;
        staged.balance = money::to_storage(account.balance);
        staged.status = account.status;
        Ok(())
    }

    async fn insert_transfer(&mut self, new: NewTransfer) -> Result<Transfer, LedgerError> {
        let now = Utc::now();
        let transfer = Transfer {
            id: 0,
            public_id: new.public_id,
            idempotency_key: new.idempotency_key,
            from_account_id: new.from_account_id,
            to_account_id: new.to_account_id,
            amount: money::to_storage(new.amount),
            status: new.status,
            failure_reason: new.failure_reason,
            created_at: now,
            updated_at: now,
        };
        transfer.validate()?;

        if let Some(key) = &transfer.idempotency_key {
            self.reserve(UniqueKey::IdempotencyKey(key.clone()))?;
        }

        let transfer = Transfer {
            id: next(&self.shared.transfer_seq),
            ..transfer
        };
        self.transfers.insert(transfer.id, transfer.clone());
        Ok(transfer)
    }

    async fn finish_transfer(
        &mut self,
        id: TransferId,
        status: OperationStatus,
        failure_reason: Option<FailureReason>,
    ) -> Result<Transfer, LedgerError> {
        let mut transfer = self.current_transfer(id)?;
        state::ensure_transition(transfer.status, status)?;

        transfer.status = status;
        transfer.failure_reason = failure_reason;
        transfer.updated_at = Utc::now();
        transfer.validate()?;

        self.transfers.insert(id, transfer.clone());
        Ok(transfer)
    }

    async fn insert_transaction(
        &mut self,
        new: NewTransaction,
    ) -> Result<Transaction, LedgerError> {
        let entry = Transaction {
            id: next(&self.shared.transaction_seq),
            account_id: new.account_id,
            reference: new.reference,
            tx_type: new.tx_type,
            amount: money::to_storage(new.amount),
            status: new.status,
            created_at: Utc::now(),
        };
        entry.validate()?;
        self.transactions.push(entry.clone());
        Ok(entry)
    }

    async fn commit(mut self) -> Result<(), LedgerError> {
        {
            let mut tables = self.shared.tables()?;

            tables.users.append(&mut self.users);
            tables.currencies.append(&mut self.currencies);
            tables.accounts.append(&mut self.accounts);

            for (id, transfer) in std::mem::take(&mut self.transfers) {
                if let Some(key) = &transfer.idempotency_key {
                    tables.transfer_keys.insert(key.clone(), id);
                }
                tables.public_ids.insert(transfer.public_id, id);
                tables.transfers.insert(id, transfer);
            }
            tables.transactions.append(&mut self.transactions);

            for key in self.reserved.drain(..) {
                tables.reserved.remove(&key);
                tables.unique.insert(key);
            }
        }

        self.finished = true;
        // Row locks are released when `self` drops here.
        Ok(())
    }

    async fn rollback(mut self) -> Result<(), LedgerError> {
        self.release_reservations();
        self.finished = true;
        Ok(())
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        if !self.finished {
            self.release_reservations();
        }
    }
}
