//! Database integration tests for the quota ledger
//!
//! ## Running Tests
//! ```bash
//! export DATABASE_URL="postgres://localhost/lectern_test"
//! cargo test -p lectern-ledger --test integration -- --ignored
//! ```
#![allow(clippy::unwrap_used, clippy::expect_used)]

mod invariants;
mod periods;
mod seats;

use lectern_ledger::LedgerService;
use lectern_shared::{AccountId, OrgId};
use sqlx::PgPool;

// ============================================================================
// Test Utilities
// ============================================================================

/// Connect to the test database and bring the schema up to date
pub async fn setup() -> (LedgerService, PgPool) {
    let database_url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for integration tests");

    let pool = lectern_shared::create_pool(&database_url, 10)
        .await
        .expect("Failed to connect to test database");

    lectern_shared::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");

    (LedgerService::new(pool.clone()), pool)
}

/// Create an organization with the given seat limit
pub async fn create_test_org(pool: &PgPool, seat_limit: Option<i32>) -> OrgId {
    let org_id = OrgId::new();

    sqlx::query(
        r#"
        INSERT INTO organizations (id, name, seat_limit, created_at, updated_at)
        VALUES ($1, $2, $3, NOW(), NOW())
        "#,
    )
    .bind(org_id)
    .bind(format!("Test School {}", org_id))
    .bind(seat_limit)
    .execute(pool)
    .await
    .expect("Failed to create test organization");

    org_id
}

/// Remove everything recorded for an account
pub async fn cleanup_account(pool: &PgPool, account_id: AccountId) {
    // Delete in order to respect foreign key constraints
    sqlx::query("DELETE FROM usage_ledger_entries WHERE account_id = $1")
        .bind(account_id)
        .execute(pool)
        .await
        .ok(); // Ignore errors during cleanup

    sqlx::query("DELETE FROM accounting_periods WHERE account_id = $1")
        .bind(account_id)
        .execute(pool)
        .await
        .ok();

    sqlx::query("DELETE FROM ledger_events WHERE account_id = $1")
        .bind(account_id)
        .execute(pool)
        .await
        .ok();
}

/// Remove an organization and its bindings
pub async fn cleanup_org(pool: &PgPool, org_id: OrgId) {
    sqlx::query("DELETE FROM organization_seat_bindings WHERE organization_id = $1")
        .bind(org_id)
        .execute(pool)
        .await
        .ok();

    sqlx::query("DELETE FROM ledger_events WHERE organization_id = $1")
        .bind(org_id)
        .execute(pool)
        .await
        .ok();

    sqlx::query("DELETE FROM organizations WHERE id = $1")
        .bind(org_id)
        .execute(pool)
        .await
        .ok();
}
