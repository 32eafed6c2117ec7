//! Integration Tests for the Transfer Engine
//!
//! Full engine flow against the in-memory store: scenarios, failure
//! recording, idempotent replay, lock timeouts and cancellation.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal_macros::dec;
use uuid::Uuid;

use crate::account::{AccountRepository, UserRepository};
use crate::core_types::Amount;
use crate::currency::CurrencyRegistry;
use crate::error::LedgerError;
use crate::funding::FundingService;
use crate::ledger::TransactionLedger;
use crate::models::{Account, AccountStatus, CurrencyCode, FailureReason, OperationStatus, TransactionType};
use crate::store::{LedgerStore, MemoryStore, StoreTx};
use crate::transfer::{RetryPolicy, TransferEngine, TransferRequest};

/// Wires every component over one in-memory store
struct TestHarness {
    store: Arc<MemoryStore>,
    users: UserRepository<MemoryStore>,
    accounts: Arc<AccountRepository<MemoryStore>>,
    ledger: Arc<TransactionLedger<MemoryStore>>,
    funding: FundingService<MemoryStore>,
    engine: Arc<TransferEngine<MemoryStore>>,
}

impl TestHarness {
    async fn new() -> Self {
        Self::with_store(MemoryStore::new()).await
    }

    async fn with_store(store: MemoryStore) -> Self {
        let store = Arc::new(store);
        let currencies = Arc::new(CurrencyRegistry::new(store.clone()));
        currencies.ensure_defaults().await.unwrap();

        let accounts = Arc::new(AccountRepository::new(store.clone(), currencies.clone()));
        let ledger = Arc::new(TransactionLedger::new(store.clone()));
        let funding = FundingService::new(store.clone(), accounts.clone(), ledger.clone());
        let engine = TransferEngine::new(
            store.clone(),
            currencies,
            accounts.clone(),
            ledger.clone(),
        )
        .with_retry_policy(RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        });

        Self {
            users: UserRepository::new(store.clone()),
            store,
            accounts,
            ledger,
            funding,
            engine: Arc::new(engine),
        }
    }

    /// New user with one account holding `balance`
    async fn account(&self, code: CurrencyCode, balance: Amount) -> Account {
        let user = self
            .users
            .create(&format!("{}@example.com", Uuid::new_v4()), "hash")
            .await
            .unwrap();
        let account = self.accounts.open(user.id, code).await.unwrap();
        if balance > Amount::ZERO {
            return self.funding.deposit(account.id, balance).await.unwrap();
        }
        account
    }

    async fn balance(&self, account: &Account) -> Amount {
        self.accounts.get(account.id).await.unwrap().balance
    }
}

// ========================================================================
// Scenarios
// ========================================================================

/// A=100.00, B=0.00, A→B 40.00 → A=60.00, B=40.00, two linked entries
#[tokio::test]
async fn test_transfer_happy_path() {
    let h = TestHarness::new().await;
    let a = h.account(CurrencyCode::Usd, dec!(100.00)).await;
    let b = h.account(CurrencyCode::Usd, dec!(0)).await;

    let transfer = h
        .engine
        .execute(TransferRequest::new(a.id, b.id, dec!(40.00)))
        .await
        .unwrap();

    assert_eq!(transfer.status, OperationStatus::Completed);
    assert_eq!(transfer.amount, dec!(40.00));
    assert_eq!(h.balance(&a).await, dec!(60.00));
    assert_eq!(h.balance(&b).await, dec!(40.00));

    let entries = h.ledger.entries_for_transfer(transfer.id).await.unwrap();
    assert_eq!(entries.len(), 2);
    let debit = entries.iter().find(|e| e.tx_type == TransactionType::Debit).unwrap();
    let credit = entries.iter().find(|e| e.tx_type == TransactionType::Credit).unwrap();
    assert_eq!((debit.account_id, debit.signed_amount()), (a.id, dec!(-40.00)));
    assert_eq!((credit.account_id, credit.signed_amount()), (b.id, dec!(40.00)));
    assert!(entries.iter().all(|e| e.status == OperationStatus::Completed));

    assert_eq!(h.engine.get(transfer.public_id).await.unwrap(), transfer);
    assert!(h.ledger.reconcile().await.unwrap().is_empty());
}

/// A=10.00, A→B 50.00 → balances unchanged, transfer failed, InsufficientFunds
#[tokio::test]
async fn test_insufficient_funds_records_failed_transfer() {
    let h = TestHarness::new().await;
    let a = h.account(CurrencyCode::Usd, dec!(10.00)).await;
    let b = h.account(CurrencyCode::Usd, dec!(0)).await;

    let err = h
        .engine
        .execute(TransferRequest::new(a.id, b.id, dec!(50.00)).with_key("insufficient-1"))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        LedgerError::InsufficientFunds {
            account_id: a.id,
            requested: dec!(50.00)
        }
    );

    assert_eq!(h.balance(&a).await, dec!(10.00));
    assert_eq!(h.balance(&b).await, dec!(0.00));

    let failed = h.engine.find_by_key("insufficient-1").await.unwrap().unwrap();
    assert_eq!(failed.status, OperationStatus::Failed);
    assert_eq!(failed.failure_reason, Some(FailureReason::InsufficientFunds));
    assert!(h.ledger.entries_for_transfer(failed.id).await.unwrap().is_empty());
    assert!(h.ledger.reconcile().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_validation_errors_leave_no_trace() {
    let h = TestHarness::new().await;
    let a = h.account(CurrencyCode::Usd, dec!(10.00)).await;
    let b = h.account(CurrencyCode::Usd, dec!(0)).await;
    let eur = h.account(CurrencyCode::Eur, dec!(0)).await;

    let cases = [
        (TransferRequest::new(a.id, b.id, dec!(0)).with_key("zero"), "INVALID_AMOUNT"),
        (TransferRequest::new(a.id, b.id, dec!(-5)).with_key("negative"), "INVALID_AMOUNT"),
        (TransferRequest::new(a.id, b.id, dec!(0.001)).with_key("sub-cent"), "INVALID_AMOUNT"),
        (TransferRequest::new(a.id, a.id, dec!(1)).with_key("self"), "SELF_TRANSFER"),
        (TransferRequest::new(a.id, eur.id, dec!(1)).with_key("mismatch"), "CURRENCY_MISMATCH"),
        (TransferRequest::new(a.id, 9_999, dec!(1)).with_key("missing"), "NOT_FOUND"),
    ];

    for (req, code) in cases {
        let key = req.idempotency_key.clone().unwrap();
        let err = h.engine.execute(req).await.unwrap_err();
        assert_eq!(err.code(), code, "key {key}");
        assert!(h.engine.find_by_key(&key).await.unwrap().is_none(), "key {key}");
    }

    assert_eq!(h.balance(&a).await, dec!(10.00));
    assert_eq!(h.ledger.entries_for_account(a.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_invalid_idempotency_key() {
    let h = TestHarness::new().await;
    let a = h.account(CurrencyCode::Usd, dec!(10.00)).await;
    let b = h.account(CurrencyCode::Usd, dec!(0)).await;

    let err = h
        .engine
        .execute(TransferRequest::new(a.id, b.id, dec!(1)).with_key(""))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_IDEMPOTENCY_KEY");
}

#[tokio::test]
async fn test_inactive_destination_fails_and_replays() {
    let h = TestHarness::new().await;
    let a = h.account(CurrencyCode::Rub, dec!(10.00)).await;
    let b = h.account(CurrencyCode::Rub, dec!(0)).await;
    h.accounts.set_status(b.id, AccountStatus::Blocked).await.unwrap();

    let req = TransferRequest::new(a.id, b.id, dec!(5.00)).with_key("blocked-dest");
    let err = h.engine.execute(req.clone()).await.unwrap_err();
    assert_eq!(err, LedgerError::AccountNotActive(b.id));
    assert_eq!(h.balance(&a).await, dec!(10.00));

    let failed = h.engine.find_by_key("blocked-dest").await.unwrap().unwrap();
    assert_eq!(failed.failure_reason, Some(FailureReason::DestinationNotActive));

    // Unblocking does not change the stored outcome
    h.accounts.set_status(b.id, AccountStatus::Active).await.unwrap();
    assert_eq!(h.engine.execute(req).await, Err(LedgerError::AccountNotActive(b.id)));
    assert_eq!(h.balance(&a).await, dec!(10.00));
}

#[tokio::test]
async fn test_inactive_source_fails() {
    let h = TestHarness::new().await;
    let a = h.account(CurrencyCode::Rub, dec!(10.00)).await;
    let b = h.account(CurrencyCode::Rub, dec!(0)).await;
    h.accounts.set_status(a.id, AccountStatus::Blocked).await.unwrap();

    let err = h
        .engine
        .execute(TransferRequest::new(a.id, b.id, dec!(5.00)).with_key("blocked-src"))
        .await
        .unwrap_err();
    assert_eq!(err, LedgerError::AccountNotActive(a.id));

    let failed = h.engine.find_by_key("blocked-src").await.unwrap().unwrap();
    assert_eq!(failed.failure_reason, Some(FailureReason::SourceNotActive));
}

// ========================================================================
// Idempotency
// ========================================================================

#[tokio::test]
async fn test_idempotent_replay_applies_once() {
    let h = TestHarness::new().await;
    let a = h.account(CurrencyCode::Eur, dec!(100.00)).await;
    let b = h.account(CurrencyCode::Eur, dec!(0)).await;
    let req = TransferRequest::new(a.id, b.id, dec!(25.00)).with_key("order-7");

    let first = h.engine.execute(req.clone()).await.unwrap();
    let second = h.engine.execute(req).await.unwrap();

    assert_eq!(first.public_id, second.public_id);
    assert_eq!(h.balance(&a).await, dec!(75.00));
    assert_eq!(h.balance(&b).await, dec!(25.00));
    assert_eq!(h.ledger.entries_for_account(b.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_concurrent_duplicates_apply_once() {
    let h = TestHarness::new().await;
    let a = h.account(CurrencyCode::Eur, dec!(100.00)).await;
    let b = h.account(CurrencyCode::Eur, dec!(0)).await;

    let tasks: Vec<_> = (0..10)
        .map(|_| {
            let engine = h.engine.clone();
            let req = TransferRequest::new(a.id, b.id, dec!(10.00)).with_key("burst");
            tokio::spawn(async move { engine.execute(req).await })
        })
        .collect();

    let mut ids = Vec::new();
    for task in tasks {
        ids.push(task.await.unwrap().unwrap().public_id);
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(h.balance(&a).await, dec!(90.00));
}

#[tokio::test]
async fn test_key_reused_with_different_parameters() {
    let h = TestHarness::new().await;
    let a = h.account(CurrencyCode::Usd, dec!(100.00)).await;
    let b = h.account(CurrencyCode::Usd, dec!(0)).await;

    h.engine
        .execute(TransferRequest::new(a.id, b.id, dec!(10.00)).with_key("shared"))
        .await
        .unwrap();

    let err = h
        .engine
        .execute(TransferRequest::new(a.id, b.id, dec!(11.00)).with_key("shared"))
        .await
        .unwrap_err();
    assert_eq!(err, LedgerError::IdempotencyKeyReused("shared".into()));
    assert_eq!(h.balance(&a).await, dec!(90.00));
}

#[tokio::test]
async fn test_failed_outcome_is_stable_after_funding() {
    let h = TestHarness::new().await;
    let a = h.account(CurrencyCode::Usd, dec!(10.00)).await;
    let b = h.account(CurrencyCode::Usd, dec!(0)).await;
    let req = TransferRequest::new(a.id, b.id, dec!(50.00)).with_key("retry-later");

    assert_eq!(h.engine.execute(req.clone()).await.unwrap_err().code(), "INSUFFICIENT_FUNDS");
    h.funding.deposit(a.id, dec!(100.00)).await.unwrap();
    assert_eq!(h.engine.execute(req).await.unwrap_err().code(), "INSUFFICIENT_FUNDS");

    // A fresh key goes through
    h.engine
        .execute(TransferRequest::new(a.id, b.id, dec!(50.00)).with_key("retry-later-2"))
        .await
        .unwrap();
    assert_eq!(h.balance(&b).await, dec!(50.00));
}

// ========================================================================
// Timeouts, Retry & Cancellation
// ========================================================================

#[tokio::test]
async fn test_lock_timeout_persists_nothing() {
    let h = TestHarness::with_store(MemoryStore::with_lock_timeout(Duration::from_millis(20))).await;
    let a = h.account(CurrencyCode::Usd, dec!(100.00)).await;
    let b = h.account(CurrencyCode::Usd, dec!(0)).await;

    let mut holder = h.store.begin().await.unwrap();
    holder.lock_account(b.id).await.unwrap();

    let req = TransferRequest::new(a.id, b.id, dec!(10.00)).with_key("busy");
    let err = h.engine.execute(req.clone()).await.unwrap_err();
    assert_eq!(err, LedgerError::Timeout);
    assert!(err.is_retryable());
    assert!(h.engine.find_by_key("busy").await.unwrap().is_none());
    assert_eq!(h.balance(&a).await, dec!(100.00));

    holder.rollback().await.unwrap();
    let transfer = h.engine.execute(req).await.unwrap();
    assert_eq!(transfer.status, OperationStatus::Completed);
}

#[tokio::test]
async fn test_execute_with_retry_waits_out_contention() {
    let h = TestHarness::with_store(MemoryStore::with_lock_timeout(Duration::from_millis(10))).await;
    let a = h.account(CurrencyCode::Usd, dec!(100.00)).await;
    let b = h.account(CurrencyCode::Usd, dec!(0)).await;

    let mut holder = h.store.begin().await.unwrap();
    holder.lock_account(a.id).await.unwrap();
    let release = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(15)).await;
        holder.rollback().await.unwrap();
    });

    let transfer = h
        .engine
        .execute_with_retry(TransferRequest::new(a.id, b.id, dec!(10.00)).with_key("contended"))
        .await
        .unwrap();
    release.await.unwrap();

    assert_eq!(transfer.status, OperationStatus::Completed);
    assert_eq!(h.balance(&b).await, dec!(10.00));
}

#[tokio::test]
async fn test_dropped_caller_does_not_abort_commit() {
    let h = TestHarness::new().await;
    let a = h.account(CurrencyCode::Usd, dec!(100.00)).await;
    let b = h.account(CurrencyCode::Usd, dec!(0)).await;

    let mut holder = h.store.begin().await.unwrap();
    holder.lock_account(a.id).await.unwrap();

    // The caller gives up while the transaction is waiting for its lock.
    let req = TransferRequest::new(a.id, b.id, dec!(30.00)).with_key("detached");
    let cancelled = tokio::time::timeout(Duration::from_millis(20), h.engine.execute(req)).await;
    assert!(cancelled.is_err());

    holder.rollback().await.unwrap();

    let mut stored = None;
    for _ in 0..50 {
        stored = h.engine.find_by_key("detached").await.unwrap();
        if stored.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(stored.unwrap().status, OperationStatus::Completed);
    assert_eq!(h.balance(&a).await, dec!(70.00));
}
