mod common;

use common::Ledger;
use rust_decimal_macros::dec;
use transfer_ledger::{LedgerError, OperationStatus, TransactionType, TransferRequest};

#[tokio::test]
async fn scenario_transfer_40_of_100() {
    let ledger = Ledger::new().await;
    let a = ledger.usd_account(dec!(100.00)).await;
    let b = ledger.usd_account(dec!(0.00)).await;

    let transfer = ledger
        .engine
        .execute(TransferRequest::new(a.id, b.id, dec!(40.00)))
        .await
        .unwrap();

    assert_eq!(transfer.status, OperationStatus::Completed);
    assert_eq!(ledger.balance(&a).await, dec!(60.00));
    assert_eq!(ledger.balance(&b).await, dec!(40.00));

    let entries = ledger.ledger.entries_for_transfer(transfer.id).await.unwrap();
    let mut signed: Vec<_> = entries
        .iter()
        .map(|e| (e.account_id, e.tx_type, e.signed_amount()))
        .collect();
    signed.sort_by_key(|(account_id, _, _)| *account_id);
    assert_eq!(
        signed,
        vec![
            (a.id, TransactionType::Debit, dec!(-40.00)),
            (b.id, TransactionType::Credit, dec!(40.00)),
        ]
    );
}

#[tokio::test]
async fn scenario_transfer_50_of_10_fails() {
    let ledger = Ledger::new().await;
    let a = ledger.usd_account(dec!(10.00)).await;
    let b = ledger.usd_account(dec!(0.00)).await;

    let err = ledger
        .engine
        .execute(TransferRequest::new(a.id, b.id, dec!(50.00)).with_key("scenario-2"))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InsufficientFunds { .. }));

    assert_eq!(ledger.balance(&a).await, dec!(10.00));
    assert_eq!(ledger.balance(&b).await, dec!(0.00));

    let transfer = ledger.engine.find_by_key("scenario-2").await.unwrap().unwrap();
    assert_eq!(transfer.status, OperationStatus::Failed);
    assert!(
        ledger
            .ledger
            .entries_for_transfer(transfer.id)
            .await
            .unwrap()
            .is_empty(),
        "a failed transfer has no ledger entries"
    );
}

#[tokio::test]
async fn invalid_requests_are_rejected() {
    let ledger = Ledger::new().await;
    let a = ledger.usd_account(dec!(10.00)).await;
    let b = ledger.usd_account(dec!(0.00)).await;

    for amount in [dec!(0), dec!(-0.01)] {
        let err = ledger
            .engine
            .execute(TransferRequest::new(a.id, b.id, amount))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_AMOUNT");
    }

    assert_eq!(
        ledger
            .engine
            .execute(TransferRequest::new(a.id, a.id, dec!(1.00)))
            .await,
        Err(LedgerError::SelfTransfer)
    );
    assert_eq!(ledger.balance(&a).await, dec!(10.00));
}

#[tokio::test]
async fn ledger_matches_balances_after_mixed_activity() {
    let ledger = Ledger::new().await;
    let a = ledger.usd_account(dec!(500.00)).await;
    let b = ledger.usd_account(dec!(200.00)).await;
    let c = ledger.usd_account(dec!(0.00)).await;
    let accounts = [a.clone(), b.clone(), c.clone()];
    let before = ledger.total(&accounts).await;

    let requests = [
        (a.id, b.id, dec!(120.50)),
        (b.id, c.id, dec!(300.00)),
        (c.id, a.id, dec!(999.00)), // insufficient
        (c.id, a.id, dec!(0.50)),
        (b.id, a.id, dec!(20.50)),
        (a.id, c.id, dec!(1000.00)), // insufficient
    ];
    for (from, to, amount) in requests {
        let _ = ledger
            .engine
            .execute(TransferRequest::new(from, to, amount))
            .await;
    }

    assert_eq!(ledger.total(&accounts).await, before);
    for account in &accounts {
        assert_eq!(
            ledger.ledger.balance_of(account.id).await.unwrap(),
            ledger.balance(account).await
        );
    }
    assert!(ledger.ledger.reconcile().await.unwrap().is_empty());
}
