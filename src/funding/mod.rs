//! Funding: value entering or leaving the ledger
//!
//! Deposits and withdrawals move money between an account and the outside
//! world. Each one is a single store transaction holding the account's row
//! lock, writing one completed ledger entry with no transfer reference, so
//! the ledger-balance invariant also covers balances that did not come from
//! transfers.

use std::sync::Arc;

use tracing::info;

use crate::account::AccountRepository;
use crate::core_types::{AccountId, Amount};
use crate::error::LedgerError;
use crate::ledger::TransactionLedger;
use crate::models::{Account, OperationStatus, TransactionType};
use crate::money;
use crate::store::{LedgerStore, StoreTx};

pub struct FundingService<S: LedgerStore> {
    store: Arc<S>,
    accounts: Arc<AccountRepository<S>>,
    ledger: Arc<TransactionLedger<S>>,
}

impl<S: LedgerStore> FundingService<S> {
    pub fn new(
        store: Arc<S>,
        accounts: Arc<AccountRepository<S>>,
        ledger: Arc<TransactionLedger<S>>,
    ) -> Self {
        Self {
            store,
            accounts,
            ledger,
        }
    }

    /// Credit external funds to an active account
    pub async fn deposit(
        &self,
        account_id: AccountId,
        amount: Amount,
    ) -> Result<Account, LedgerError> {
        let amount = money::validate_amount(amount)?;
        let account = self.apply(account_id, amount, TransactionType::Credit).await?;
        info!(account_id, %amount, balance = %account.balance, "Deposit completed");
        Ok(account)
    }

    /// Debit funds out of the ledger; `InsufficientFunds` leaves the account untouched
    pub async fn withdraw(
        &self,
        account_id: AccountId,
        amount: Amount,
    ) -> Result<Account, LedgerError> {
        let amount = money::validate_amount(amount)?;
        let account = self.apply(account_id, -amount, TransactionType::Debit).await?;
        info!(account_id, %amount, balance = %account.balance, "Withdrawal completed");
        Ok(account)
    }

    async fn apply(
        &self,
        account_id: AccountId,
        delta: Amount,
        tx_type: TransactionType,
    ) -> Result<Account, LedgerError> {
        let mut tx = self.store.begin().await?;
        let account = self
            .accounts
            .credit_or_debit(&mut tx, account_id, delta)
            .await?;
        self.ledger
            .append(
                &mut tx,
                account_id,
                tx_type,
                delta.abs(),
                None,
                OperationStatus::Completed,
            )
            .await?;
        tx.commit().await?;
        Ok(account)
    }
}
