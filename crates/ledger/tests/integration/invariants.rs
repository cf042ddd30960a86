//! Invariant checks against a live database

use lectern_ledger::LedgerError;
use lectern_shared::{AccountId, PeriodId, SubjectId};
use time::Duration;

use crate::{cleanup_account, setup};

#[tokio::test]
#[ignore] // Requires database
async fn test_ledger_reconciles_after_deductions() {
    let (ledger, pool) = setup().await;
    let account_id = AccountId::new();
    let subject_id = SubjectId::new();

    let period = ledger
        .periods
        .activate_new_period(account_id, "classroom-monthly", 50, Duration::days(30))
        .await
        .unwrap();

    for (count, unit) in [(12.0, "seconds"), (3.0, "images"), (101.0, "characters")] {
        ledger
            .quota
            .deduct(account_id, subject_id, "mixed", count, unit)
            .await
            .unwrap();
    }

    let reconciliation = ledger.invariants.reconcile_period(period.id).await.unwrap();
    assert_eq!(reconciliation.quota_used, 12 + 30 + 11);
    assert_eq!(reconciliation.drift, 0);
    assert_eq!(reconciliation.entry_count, 3);

    for check in ["ledger_reconciles", "ledger_snapshots_chain", "single_active_period"] {
        let violations = ledger.invariants.run_check(check).await.unwrap();
        assert!(
            violations
                .iter()
                .all(|v| !v.account_ids.contains(&account_id)),
            "{} reports this account",
            check
        );
    }

    cleanup_account(&pool, account_id).await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_drift_is_detected() {
    let (ledger, pool) = setup().await;
    let account_id = AccountId::new();

    let period = ledger
        .periods
        .activate_new_period(account_id, "classroom-monthly", 50, Duration::days(30))
        .await
        .unwrap();
    ledger
        .quota
        .deduct(account_id, SubjectId::new(), "recording", 10.0, "seconds")
        .await
        .unwrap();

    // Simulate a write that bypassed the ledger
    sqlx::query("UPDATE accounting_periods SET quota_used = quota_used + 5 WHERE id = $1")
        .bind(period.id)
        .execute(&pool)
        .await
        .unwrap();

    let reconciliation = ledger.invariants.reconcile_period(period.id).await.unwrap();
    assert_eq!(reconciliation.drift, 5);
    assert!(!reconciliation.is_reconciled());

    let violations = ledger
        .invariants
        .run_check("ledger_reconciles")
        .await
        .unwrap();
    assert!(violations.iter().any(|v| v.account_ids.contains(&account_id)));

    let summary = ledger.invariants.run_all().await.unwrap();
    assert!(!summary.healthy);

    cleanup_account(&pool, account_id).await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_reconcile_unknown_period_and_check() {
    let (ledger, _pool) = setup().await;

    let missing = ledger.invariants.reconcile_period(PeriodId::new()).await;
    assert!(matches!(missing, Err(LedgerError::NotFound(_))));

    let unknown = ledger.invariants.run_check("no_such_check").await;
    assert!(matches!(unknown, Err(LedgerError::InvalidInput(_))));
}
