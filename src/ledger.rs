//! Transaction Ledger
//!
//! Append-only record of every balance change. A completed entry is never
//! updated or deleted; the signed sum of an account's completed entries must
//! equal its stored balance, which [`TransactionLedger::reconcile`] checks.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::core_types::{AccountId, Amount, TransferId};
use crate::error::LedgerError;
use crate::models::{OperationStatus, Transaction, TransactionType};
use crate::money;
use crate::store::{LedgerStore, NewTransaction, StoreTx};

/// An account whose stored balance disagrees with its ledger
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Discrepancy {
    pub account_id: AccountId,
    pub stored: Amount,
    pub ledger: Amount,
}

pub struct TransactionLedger<S: LedgerStore> {
    store: Arc<S>,
}

impl<S: LedgerStore> TransactionLedger<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Insert one entry inside `tx`. Only `amount > 0` is checked.
    pub async fn append(
        &self,
        tx: &mut S::Tx,
        account_id: AccountId,
        tx_type: TransactionType,
        amount: Amount,
        reference: Option<TransferId>,
        status: OperationStatus,
    ) -> Result<Transaction, LedgerError> {
        let amount = money::validate_amount(amount)?;
        tx.insert_transaction(NewTransaction {
            account_id,
            reference,
            tx_type,
            amount,
            status,
        })
        .await
    }

    /// Signed sum of completed entries (credits minus debits)
    pub async fn balance_of(&self, account_id: AccountId) -> Result<Amount, LedgerError> {
        self.store.completed_sum(account_id).await
    }

    pub async fn entries_for_account(
        &self,
        account_id: AccountId,
    ) -> Result<Vec<Transaction>, LedgerError> {
        self.store.transactions_for_account(account_id).await
    }

    pub async fn entries_for_transfer(
        &self,
        transfer_id: TransferId,
    ) -> Result<Vec<Transaction>, LedgerError> {
        self.store.transactions_for_transfer(transfer_id).await
    }

    /// Compare every account's stored balance with its ledger balance.
    ///
    /// Reads are not a snapshot: run it while transfers are quiesced, or
    /// re-check reported accounts before acting on them.
    pub async fn reconcile(&self) -> Result<Vec<Discrepancy>, LedgerError> {
        let accounts = self.store.list_accounts().await?;
        let mut discrepancies = Vec::new();

        for account in &accounts {
            let ledger = self.balance_of(account.id).await?;
            if ledger != account.balance {
                warn!(
                    account_id = account.id,
                    stored = %account.balance,
                    ledger = %ledger,
                    "Ledger balance mismatch"
                );
                discrepancies.push(Discrepancy {
                    account_id: account.id,
                    stored: account.balance,
                    ledger,
                });
            }
        }

        info!(
            accounts = accounts.len(),
            discrepancies = discrepancies.len(),
            "Reconciliation finished"
        );
        Ok(discrepancies)
    }
}
