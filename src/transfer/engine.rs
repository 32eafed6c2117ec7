//! Transfer Engine
//!
//! Executes a transfer as one atomic unit of work:
//!
//! 1. Validate amount and endpoints (no store access)
//! 2. Serialize on the idempotency key and replay a stored outcome if present
//! 3. Load both accounts and check currency compatibility (no locks)
//! 4. In one store transaction: lock both accounts in ascending id order,
//!    record the transfer, debit, credit, append the two ledger entries,
//!    mark the transfer `completed`, commit
//! 5. On a business failure: roll back, then persist the transfer as `failed`
//!    in a separate transaction with no ledger entries
//!
//! Step 4 runs on its own task. Dropping the caller's future before that
//! point cancels the request; after it, the transaction always runs to
//! commit or rollback.

use std::sync::Arc;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::idempotency::{KeyGuard, KeyedLocks, validate_key};
use super::retry::{RetryPolicy, with_retry};
use crate::account::AccountRepository;
use crate::core_types::{AccountId, Amount};
use crate::currency::CurrencyRegistry;
use crate::error::LedgerError;
use crate::ledger::TransactionLedger;
use crate::models::{FailureReason, OperationStatus, TransactionType, Transfer};
use crate::money;
use crate::store::{LedgerStore, NewTransfer, StoreTx};

/// Transfer request as submitted by a caller
#[derive(Debug, Clone, PartialEq)]
pub struct TransferRequest {
    pub from: AccountId,
    pub to: AccountId,
    pub amount: Amount,
    /// Caller-supplied key; a repeated key returns the original outcome
    pub idempotency_key: Option<String>,
}

impl TransferRequest {
    pub fn new(from: AccountId, to: AccountId, amount: Amount) -> Self {
        Self {
            from,
            to,
            amount,
            idempotency_key: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Validated request about to enter the store transaction
#[derive(Debug, Clone)]
struct PendingTransfer {
    public_id: Uuid,
    idempotency_key: Option<String>,
    from: AccountId,
    to: AccountId,
    amount: Amount,
}

impl PendingTransfer {
    fn record(&self, status: OperationStatus, failure_reason: Option<FailureReason>) -> NewTransfer {
        NewTransfer {
            public_id: self.public_id,
            idempotency_key: self.idempotency_key.clone(),
            from_account_id: self.from,
            to_account_id: self.to,
            amount: self.amount,
            status,
            failure_reason,
        }
    }
}

/// The part of the engine that runs on a spawned task
struct Committer<S: LedgerStore> {
    store: Arc<S>,
    accounts: Arc<AccountRepository<S>>,
    ledger: Arc<TransactionLedger<S>>,
}

impl<S: LedgerStore> Clone for Committer<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            accounts: self.accounts.clone(),
            ledger: self.ledger.clone(),
        }
    }
}

impl<S: LedgerStore> Committer<S> {
    async fn run(&self, pending: PendingTransfer) -> Result<Transfer, LedgerError> {
        let mut tx = self.store.begin().await?;

        match self.apply(&mut tx, &pending).await {
            Ok(transfer) => {
                tx.commit().await?;
                info!(
                    transfer_id = %transfer.public_id,
                    from = transfer.from_account_id,
                    to = transfer.to_account_id,
                    amount = %transfer.amount,
                    "Transfer completed"
                );
                Ok(transfer)
            }
            Err(err) => {
                if let Err(e) = tx.rollback().await {
                    warn!(transfer_id = %pending.public_id, error = %e, "Rollback failed");
                }

                match FailureReason::from_error(&err, pending.from) {
                    Some(reason) => {
                        self.record_failure(&pending, reason).await;
                        Err(err)
                    }
                    None => {
                        debug!(
                            transfer_id = %pending.public_id,
                            error = %err,
                            retryable = err.is_retryable(),
                            "Transfer aborted without trace"
                        );
                        Err(err)
                    }
                }
            }
        }
    }

    async fn apply(
        &self,
        tx: &mut S::Tx,
        pending: &PendingTransfer,
    ) -> Result<Transfer, LedgerError> {
        // Both row locks come first, in ascending id order. The transfer
        // insert references both accounts, and on PostgreSQL its foreign-key
        // checks take key-share locks on them; taken before the row locks
        // they would let two transfers sharing an account block each other.
        let (first, second) = if pending.from < pending.to {
            (pending.from, pending.to)
        } else {
            (pending.to, pending.from)
        };
        tx.lock_account(first).await?;
        tx.lock_account(second).await?;

        let transfer = tx
            .insert_transfer(pending.record(OperationStatus::Pending, None))
            .await?;
        debug!(transfer_id = %transfer.public_id, "Transfer created");

        self.accounts
            .credit_or_debit(tx, pending.from, -pending.amount)
            .await?;
        self.accounts
            .credit_or_debit(tx, pending.to, pending.amount)
            .await?;

        self.ledger
            .append(
                tx,
                pending.from,
                TransactionType::Debit,
                pending.amount,
                Some(transfer.id),
                OperationStatus::Completed,
            )
            .await?;
        self.ledger
            .append(
                tx,
                pending.to,
                TransactionType::Credit,
                pending.amount,
                Some(transfer.id),
                OperationStatus::Completed,
            )
            .await?;

        tx.finish_transfer(transfer.id, OperationStatus::Completed, None)
            .await
    }

    /// Persist the audit row of a failed transfer. A failure to do so is
    /// logged; the caller still receives the original business error.
    async fn record_failure(&self, pending: &PendingTransfer, reason: FailureReason) {
        let result = async {
            let mut tx = self.store.begin().await?;
            let transfer = tx
                .insert_transfer(pending.record(OperationStatus::Failed, Some(reason)))
                .await?;
            tx.commit().await?;
            Ok::<_, LedgerError>(transfer)
        }
        .await;

        match result {
            Ok(transfer) => warn!(
                transfer_id = %transfer.public_id,
                from = transfer.from_account_id,
                to = transfer.to_account_id,
                amount = %transfer.amount,
                reason = %reason,
                "Transfer failed"
            ),
            Err(e) => error!(
                transfer_id = %pending.public_id,
                reason = %reason,
                error = %e,
                "Failed to record failed transfer"
            ),
        }
    }
}

/// Transfer Engine
pub struct TransferEngine<S: LedgerStore> {
    committer: Committer<S>,
    currencies: Arc<CurrencyRegistry<S>>,
    keys: KeyedLocks,
    retry: RetryPolicy,
}

impl<S: LedgerStore> TransferEngine<S> {
    pub fn new(
        store: Arc<S>,
        currencies: Arc<CurrencyRegistry<S>>,
        accounts: Arc<AccountRepository<S>>,
        ledger: Arc<TransactionLedger<S>>,
    ) -> Self {
        Self {
            committer: Committer {
                store,
                accounts,
                ledger,
            },
            currencies,
            keys: KeyedLocks::new(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Execute one transfer.
    ///
    /// # Errors
    /// * `InvalidAmount`, `SelfTransfer`, `InvalidIdempotencyKey` - rejected
    ///   before any store access
    /// * `NotFound`, `CurrencyMismatch`, `CurrencyInactive` - rejected before
    ///   the transfer is recorded
    /// * `InsufficientFunds`, `AccountNotActive`, `Overflow` - the transfer is
    ///   recorded as `failed`, balances are unchanged
    /// * `IdempotencyKeyReused` - the key belongs to a different request
    /// * `Timeout`, `ConcurrencyConflict` - nothing persisted; safe to retry
    pub async fn execute(&self, req: TransferRequest) -> Result<Transfer, LedgerError> {
        let amount = money::validate_amount(req.amount)?;
        if req.from == req.to {
            return Err(LedgerError::SelfTransfer);
        }

        let guard = match &req.idempotency_key {
            Some(key) => {
                validate_key(key)?;
                let guard = self.keys.acquire(key).await;
                if let Some(existing) = self.committer.store.get_transfer_by_key(key).await? {
                    return replay(existing, &req, amount);
                }
                Some(guard)
            }
            None => None,
        };

        let from = self.committer.accounts.get(req.from).await?;
        let to = self.committer.accounts.get(req.to).await?;
        self.currencies.assert_compatible(&from, &to).await?;

        let pending = PendingTransfer {
            public_id: Uuid::new_v4(),
            idempotency_key: req.idempotency_key.clone(),
            from: req.from,
            to: req.to,
            amount,
        };

        match self.commit_detached(pending, guard).await {
            // Another process stored this key first
            Err(LedgerError::DuplicateRequest(key)) => {
                let existing = self
                    .committer
                    .store
                    .get_transfer_by_key(&key)
                    .await?
                    .ok_or_else(|| LedgerError::not_found("transfer", &key))?;
                replay(existing, &req, amount)
            }
            result => result,
        }
    }

    /// [`TransferEngine::execute`] with bounded retries on `Timeout` and
    /// `ConcurrencyConflict`
    pub async fn execute_with_retry(&self, req: TransferRequest) -> Result<Transfer, LedgerError> {
        with_retry(&self.retry, || self.execute(req.clone())).await
    }

    /// Look up a transfer by its public id
    pub async fn get(&self, public_id: Uuid) -> Result<Transfer, LedgerError> {
        self.committer
            .store
            .get_transfer_by_public_id(public_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("transfer", public_id))
    }

    pub async fn find_by_key(&self, key: &str) -> Result<Option<Transfer>, LedgerError> {
        validate_key(key)?;
        self.committer.store.get_transfer_by_key(key).await
    }

    /// Run the store transaction on its own task so the caller cannot cancel
    /// it halfway. The key guard travels with it.
    async fn commit_detached(
        &self,
        pending: PendingTransfer,
        guard: Option<KeyGuard>,
    ) -> Result<Transfer, LedgerError> {
        let committer = self.committer.clone();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            committer.run(pending).await
        });

        handle
            .await
            .map_err(|e| LedgerError::Store(format!("transfer task aborted: {e}")))?
    }
}

/// Return the stored outcome of a transfer for a repeated key
fn replay(
    existing: Transfer,
    req: &TransferRequest,
    amount: Amount,
) -> Result<Transfer, LedgerError> {
    let key = existing.idempotency_key.clone().unwrap_or_default();
    if !existing.matches(req.from, req.to, amount) {
        warn!(
            transfer_id = %existing.public_id,
            key = %key,
            "Idempotency key reused with different parameters"
        );
        return Err(LedgerError::IdempotencyKeyReused(key));
    }

    info!(
        transfer_id = %existing.public_id,
        key = %key,
        status = %existing.status,
        "Idempotent replay"
    );
    match (existing.status, existing.failure_reason) {
        (OperationStatus::Completed, _) => Ok(existing),
        (OperationStatus::Failed, Some(reason)) => Err(reason.to_error(&existing)),
        (OperationStatus::Failed, None) => Err(LedgerError::Store(format!(
            "failed transfer {} has no failure reason",
            existing.public_id
        ))),
        // Only terminal transfers are ever committed
        (OperationStatus::Pending, _) => Err(LedgerError::ConcurrencyConflict(format!(
            "transfer {} is still pending",
            existing.public_id
        ))),
    }
}
