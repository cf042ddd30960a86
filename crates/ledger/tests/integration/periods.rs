//! Period lifecycle: activation, supersession, lazy expiry

use lectern_ledger::{LedgerError, LedgerEventType};
use lectern_shared::{AccountId, PeriodStatus, SubjectId};
use time::Duration;

use crate::{cleanup_account, setup};

#[tokio::test]
#[ignore] // Requires database
async fn test_second_activation_expires_first_and_keeps_both_rows() {
    // Given: an account with one active period
    let (ledger, pool) = setup().await;
    let account_id = AccountId::new();

    let first = ledger
        .periods
        .activate_new_period(account_id, "classroom-monthly", 3_600, Duration::days(30))
        .await
        .expect("First activation failed");

    // When: a second payment is confirmed
    let second = ledger
        .periods
        .activate_new_period(account_id, "classroom-monthly", 3_600, Duration::days(30))
        .await
        .expect("Second activation failed");

    // Then: two periods exist, only the newest is active
    assert_ne!(first.id, second.id, "Activation is not idempotent");

    let history = ledger.periods.period_history(account_id, 10).await.unwrap();
    assert_eq!(history.len(), 2);

    let first_now = ledger.periods.get_period(first.id).await.unwrap();
    assert_eq!(first_now.status, PeriodStatus::Expired);

    let active = ledger.periods.get_active_period(account_id).await.unwrap();
    assert_eq!(active.map(|p| p.id), Some(second.id));

    let active_count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM accounting_periods WHERE account_id = $1 AND status = 'active'",
    )
    .bind(account_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(active_count, 1);

    let superseded = ledger
        .events
        .get_account_events_by_type(account_id, LedgerEventType::PeriodSuperseded, 10)
        .await
        .unwrap();
    assert_eq!(superseded.len(), 1);

    cleanup_account(&pool, account_id).await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_concurrent_activations_leave_one_active_period() {
    let (ledger, pool) = setup().await;
    let account_id = AccountId::new();

    let activations = (0..4).map(|_| {
        ledger
            .periods
            .activate_new_period(account_id, "classroom-monthly", 100, Duration::days(30))
    });
    let results = futures::future::join_all(activations).await;
    assert!(results.iter().all(|r| r.is_ok()), "All activations succeed");

    let history = ledger.periods.period_history(account_id, 10).await.unwrap();
    assert_eq!(history.len(), 4);
    assert_eq!(
        history
            .iter()
            .filter(|p| p.status == PeriodStatus::Active)
            .count(),
        1
    );

    cleanup_account(&pool, account_id).await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_negative_quota_is_rejected() {
    let (ledger, _pool) = setup().await;

    let result = ledger
        .periods
        .activate_new_period(AccountId::new(), "broken", -1, Duration::days(30))
        .await;

    assert!(matches!(result, Err(LedgerError::InvalidPlanParameters(_))));
}

#[tokio::test]
#[ignore] // Requires database
async fn test_lapsed_period_is_unusable_but_not_rewritten() {
    // Given: an active period whose end_time has passed
    let (ledger, pool) = setup().await;
    let account_id = AccountId::new();

    let period = ledger
        .periods
        .activate_new_period(account_id, "classroom-monthly", 100, Duration::days(30))
        .await
        .unwrap();

    sqlx::query(
        r#"
        UPDATE accounting_periods
        SET start_time = NOW() - INTERVAL '2 days', end_time = NOW() - INTERVAL '1 second'
        WHERE id = $1
        "#,
    )
    .bind(period.id)
    .execute(&pool)
    .await
    .unwrap();

    // Then: reads treat it as absent
    let active = ledger.periods.get_active_period(account_id).await.unwrap();
    assert!(active.is_none());
    let allowed = ledger
        .gate
        .can_perform_privileged_action(account_id)
        .await
        .unwrap();
    assert!(!allowed);

    let result = ledger
        .quota
        .deduct(account_id, SubjectId::new(), "recording", 10.0, "seconds")
        .await;
    assert!(matches!(result, Err(LedgerError::NoActiveSubscription(_))));

    // And: its stored status is untouched
    let stored = ledger.periods.get_period(period.id).await.unwrap();
    assert_eq!(stored.status, PeriodStatus::Active);

    // And: a new payment still supersedes it
    ledger
        .periods
        .activate_new_period(account_id, "classroom-monthly", 100, Duration::days(30))
        .await
        .unwrap();
    let stored = ledger.periods.get_period(period.id).await.unwrap();
    assert_eq!(stored.status, PeriodStatus::Expired);

    cleanup_account(&pool, account_id).await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_cancelled_period_closes_gate() {
    let (ledger, pool) = setup().await;
    let account_id = AccountId::new();

    let period = ledger
        .periods
        .activate_new_period(account_id, "classroom-monthly", 100, Duration::days(30))
        .await
        .unwrap();
    let allowed = ledger
        .gate
        .can_perform_privileged_action(account_id)
        .await
        .unwrap();
    assert!(allowed);

    let cancelled = ledger.periods.cancel_period(period.id).await.unwrap();
    assert_eq!(cancelled.status, PeriodStatus::Cancelled);

    let decision = ledger.gate.authorization_status(account_id).await.unwrap();
    assert!(!decision.allowed);
    assert!(decision.reason.is_some());

    // Cancelling twice finds no active period
    let again = ledger.periods.cancel_period(period.id).await;
    assert!(matches!(again, Err(LedgerError::NotFound(_))));

    cleanup_account(&pool, account_id).await;
}
