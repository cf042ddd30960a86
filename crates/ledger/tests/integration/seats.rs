//! Seat limit guard under concurrent invitations

use lectern_ledger::{LedgerError, LedgerEventType};
use lectern_shared::AccountId;

use crate::{cleanup_org, create_test_org, setup};

#[tokio::test]
#[ignore] // Requires database
async fn test_concurrent_binds_never_overshoot_limit() {
    // Given: an organization with 2 seats and no members
    let (ledger, pool) = setup().await;
    let org_id = create_test_org(&pool, Some(2)).await;

    // When: 5 invitations are accepted at once
    let binds = (0..5).map(|_| ledger.seats.bind_member(org_id, AccountId::new(), "teacher"));
    let results = futures::future::join_all(binds).await;

    // Then: exactly 2 succeed and 3 hit the limit
    let successes = results.iter().filter(|r| r.is_ok()).count();
    let rejections = results
        .iter()
        .filter(|r| matches!(r, Err(LedgerError::SeatLimitExceeded { .. })))
        .count();
    assert_eq!(successes, 2);
    assert_eq!(rejections, 3);

    let usage = ledger.seats.seat_usage(org_id).await.unwrap();
    assert_eq!(usage.seats_used, 2);
    assert_eq!(usage.seats_available, Some(0));

    let rejected_events = ledger
        .events
        .get_events_for_organization(org_id, 20)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.event_type == LedgerEventType::SeatRejected.to_string())
        .count();
    assert_eq!(rejected_events, 3);

    cleanup_org(&pool, org_id).await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_owner_does_not_consume_a_seat() {
    let (ledger, pool) = setup().await;
    let org_id = create_test_org(&pool, Some(1)).await;

    ledger
        .seats
        .bind_member(org_id, AccountId::new(), "teacher")
        .await
        .unwrap();
    ledger
        .seats
        .bind_member(org_id, AccountId::new(), "owner")
        .await
        .expect("Owner binds even when the license is full");

    let usage = ledger.seats.seat_usage(org_id).await.unwrap();
    assert_eq!(usage.seats_used, 1);
    assert_eq!(usage.owners, 1);

    let full = ledger
        .seats
        .bind_member(org_id, AccountId::new(), "teacher")
        .await;
    match full {
        Err(LedgerError::SeatLimitExceeded {
            seat_limit,
            seats_used,
            ..
        }) => {
            assert_eq!(seat_limit, 1);
            assert_eq!(seats_used, 1);
        }
        other => panic!("Expected SeatLimitExceeded, got {:?}", other),
    }

    cleanup_org(&pool, org_id).await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_unbind_frees_a_seat() {
    let (ledger, pool) = setup().await;
    let org_id = create_test_org(&pool, Some(1)).await;
    let first = AccountId::new();

    ledger
        .seats
        .bind_member(org_id, first, "teacher")
        .await
        .unwrap();
    let refused = ledger
        .seats
        .bind_member(org_id, AccountId::new(), "teacher")
        .await;
    assert!(refused.is_err());

    let released = ledger.seats.unbind_member(org_id, first).await.unwrap();
    assert!(!released.is_active);
    assert!(released.deactivated_at.is_some());

    ledger
        .seats
        .bind_member(org_id, AccountId::new(), "teacher")
        .await
        .expect("Freed seat is reusable");

    let again = ledger.seats.unbind_member(org_id, first).await;
    assert!(matches!(again, Err(LedgerError::NotFound(_))));

    cleanup_org(&pool, org_id).await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_duplicate_and_unknown_org_binds_fail() {
    let (ledger, pool) = setup().await;
    let org_id = create_test_org(&pool, None).await;
    let account_id = AccountId::new();

    ledger
        .seats
        .bind_member(org_id, account_id, "teacher")
        .await
        .unwrap();
    let duplicate = ledger
        .seats
        .bind_member(org_id, account_id, "teacher")
        .await;
    assert!(matches!(duplicate, Err(LedgerError::AlreadyExists(_))));

    let missing = ledger
        .seats
        .bind_member(lectern_shared::OrgId::new(), AccountId::new(), "teacher")
        .await;
    assert!(matches!(missing, Err(LedgerError::NotFound(_))));

    let usage = ledger.seats.seat_usage(org_id).await.unwrap();
    assert_eq!(usage.seat_limit, None);
    assert_eq!(usage.seats_available, None);

    cleanup_org(&pool, org_id).await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_lowering_limit_releases_newest_members() {
    let (ledger, pool) = setup().await;
    let org_id = create_test_org(&pool, Some(3)).await;

    let owner = AccountId::new();
    let oldest = AccountId::new();
    let middle = AccountId::new();
    let newest = AccountId::new();

    ledger
        .seats
        .bind_member(org_id, owner, "owner")
        .await
        .unwrap();
    for account in [oldest, middle, newest] {
        ledger
            .seats
            .bind_member(org_id, account, "teacher")
            .await
            .unwrap();
    }

    let change = ledger
        .seats
        .apply_seat_limit(org_id, Some(1))
        .await
        .unwrap();
    assert_eq!(change.previous_limit, Some(3));
    assert_eq!(change.new_limit, Some(1));

    let released: Vec<AccountId> = change.released.iter().map(|b| b.account_id).collect();
    assert_eq!(released.len(), 2);
    assert!(released.contains(&middle));
    assert!(released.contains(&newest));

    let remaining: Vec<AccountId> = ledger
        .seats
        .active_bindings(org_id)
        .await
        .unwrap()
        .iter()
        .map(|b| b.account_id)
        .collect();
    assert!(remaining.contains(&owner));
    assert!(remaining.contains(&oldest));
    assert_eq!(remaining.len(), 2);

    let negative = ledger.seats.apply_seat_limit(org_id, Some(-1)).await;
    assert!(matches!(negative, Err(LedgerError::InvalidInput(_))));

    cleanup_org(&pool, org_id).await;
}
