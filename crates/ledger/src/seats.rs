//! Seat Limit Guard
//!
//! Admits or rejects staff accounts binding to an organization's seat
//! license. Concurrent invitations for one organization each believe a seat is
//! free, so every count-then-insert runs under an exclusive lock on the
//! organization row (`SELECT ... FOR UPDATE`). Invitations for different
//! organizations never wait on each other.
//!
//! Owner bindings are never counted against the limit.
//!
//! ## Key Features
//! - Race-free admission: N concurrent binds with K free seats admit exactly min(N, K)
//! - Soft-delete release (history kept)
//! - Limit changes that release the newest excess members, preserving owners

use lectern_shared::{is_owner_role, AccountId, OrgId};
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{LedgerError, LedgerResult};
use crate::events::{LedgerEventBuilder, LedgerEventLogger, LedgerEventType};

/// One account bound to an organization
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SeatBinding {
    pub id: Uuid,
    pub organization_id: OrgId,
    pub account_id: AccountId,
    pub role: String,
    pub is_active: bool,
    pub created_at: OffsetDateTime,
    pub deactivated_at: Option<OffsetDateTime>,
}

/// Seat occupancy of an organization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeatUsage {
    pub organization_id: OrgId,
    /// `None` means unlimited
    pub seat_limit: Option<i32>,
    /// Active non-owner bindings
    pub seats_used: i64,
    /// Active owner bindings (not counted)
    pub owners: i64,
    /// `None` when unlimited
    pub seats_available: Option<i64>,
}

/// Result of changing an organization's seat limit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeatLimitChange {
    pub organization_id: OrgId,
    pub previous_limit: Option<i32>,
    pub new_limit: Option<i32>,
    /// Bindings released to bring the organization back under its limit
    pub released: Vec<SeatBinding>,
}

/// Whether another non-owner binding fits under the limit
pub fn has_free_seat(seat_limit: Option<i32>, seats_used: i64) -> bool {
    match seat_limit {
        Some(limit) => seats_used < limit as i64,
        None => true,
    }
}

/// Number of non-owner bindings above the limit
pub fn excess_seats(seat_limit: Option<i32>, seats_used: i64) -> i64 {
    match seat_limit {
        Some(limit) => (seats_used - limit as i64).max(0),
        None => 0,
    }
}

fn seats_available(seat_limit: Option<i32>, seats_used: i64) -> Option<i64> {
    seat_limit.map(|limit| (limit as i64 - seats_used).max(0))
}

/// Seat limit guard service
#[derive(Clone)]
pub struct SeatLimitGuard {
    pool: PgPool,
    events: LedgerEventLogger,
}

impl SeatLimitGuard {
    pub fn new(pool: PgPool) -> Self {
        Self {
            events: LedgerEventLogger::new(pool.clone()),
            pool,
        }
    }

    /// Bind an account to an organization, consuming a seat unless it is the owner
    pub async fn bind_member(
        &self,
        organization_id: OrgId,
        account_id: AccountId,
        role: &str,
    ) -> LedgerResult<SeatBinding> {
        let role = role.trim();
        if role.is_empty() {
            return Err(LedgerError::InvalidInput("role must not be empty".to_string()));
        }

        let mut tx = self.pool.begin().await?;

        // Concurrent binds for this organization queue here until commit/rollback
        let seat_limit = lock_organization(&mut tx, organization_id).await?;

        let already_bound: (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM organization_seat_bindings
                WHERE organization_id = $1 AND account_id = $2 AND is_active
            )
            "#,
        )
        .bind(organization_id)
        .bind(account_id)
        .fetch_one(&mut *tx)
        .await?;

        if already_bound.0 {
            return Err(LedgerError::AlreadyExists(format!(
                "Account {} is already bound to organization {}",
                account_id, organization_id
            )));
        }

        let seats_used = count_seats_used(&mut tx, organization_id).await?;

        if !is_owner_role(role) && !has_free_seat(seat_limit, seats_used) {
            tx.rollback().await?;

            // has_free_seat only fails with a limit present
            let seat_limit = seat_limit.unwrap_or_default();

            tracing::warn!(
                organization_id = %organization_id,
                account_id = %account_id,
                seat_limit = seat_limit,
                seats_used = seats_used,
                "Seat limit reached; binding rejected"
            );

            self.events
                .log_event_best_effort(
                    LedgerEventBuilder::new(LedgerEventType::SeatRejected)
                        .account(account_id)
                        .organization(organization_id)
                        .data(serde_json::json!({
                            "role": role,
                            "seat_limit": seat_limit,
                            "seats_used": seats_used,
                        })),
                )
                .await;

            return Err(LedgerError::SeatLimitExceeded {
                organization_id,
                seat_limit,
                seats_used,
            });
        }

        let binding: SeatBinding = sqlx::query_as(
            r#"
            INSERT INTO organization_seat_bindings (
                id, organization_id, account_id, role, is_active, created_at
            ) VALUES (
                $1, $2, $3, $4, TRUE, NOW()
            )
            RETURNING id, organization_id, account_id, role, is_active,
                      created_at, deactivated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(organization_id)
        .bind(account_id)
        .bind(role)
        .fetch_one(&mut *tx)
        .await?;

        LedgerEventBuilder::new(LedgerEventType::SeatBound)
            .account(account_id)
            .organization(organization_id)
            .data(serde_json::json!({
                "binding_id": binding.id,
                "role": role,
                "seat_limit": seat_limit,
                "seats_used_before": seats_used,
            }))
            .insert(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::info!(
            organization_id = %organization_id,
            account_id = %account_id,
            role = role,
            "Bound member to organization"
        );

        Ok(binding)
    }

    /// Release an account's seat
    ///
    /// Freeing a seat can never break the limit, so no lock is taken.
    pub async fn unbind_member(
        &self,
        organization_id: OrgId,
        account_id: AccountId,
    ) -> LedgerResult<SeatBinding> {
        let binding: Option<SeatBinding> = sqlx::query_as(
            r#"
            UPDATE organization_seat_bindings
            SET is_active = FALSE, deactivated_at = NOW()
            WHERE organization_id = $1 AND account_id = $2 AND is_active
            RETURNING id, organization_id, account_id, role, is_active,
                      created_at, deactivated_at
            "#,
        )
        .bind(organization_id)
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        let binding = binding.ok_or_else(|| {
            LedgerError::NotFound(format!(
                "Active binding for account {} in organization {}",
                account_id, organization_id
            ))
        })?;

        self.events
            .log_event_best_effort(
                LedgerEventBuilder::new(LedgerEventType::SeatReleased)
                    .account(account_id)
                    .organization(organization_id)
                    .data(serde_json::json!({
                        "binding_id": binding.id,
                        "role": binding.role,
                    })),
            )
            .await;

        tracing::info!(
            organization_id = %organization_id,
            account_id = %account_id,
            "Released member seat"
        );

        Ok(binding)
    }

    /// Current seat occupancy for an organization
    pub async fn seat_usage(&self, organization_id: OrgId) -> LedgerResult<SeatUsage> {
        let row: Option<(Option<i32>, i64, i64)> = sqlx::query_as(
            r#"
            SELECT
                o.seat_limit,
                COUNT(b.id) FILTER (WHERE LOWER(b.role) <> 'owner')::BIGINT as seats_used,
                COUNT(b.id) FILTER (WHERE LOWER(b.role) = 'owner')::BIGINT as owners
            FROM organizations o
            LEFT JOIN organization_seat_bindings b
                ON b.organization_id = o.id AND b.is_active
            WHERE o.id = $1
            GROUP BY o.seat_limit
            "#,
        )
        .bind(organization_id)
        .fetch_optional(&self.pool)
        .await?;

        let (seat_limit, seats_used, owners) = row.ok_or_else(|| {
            LedgerError::NotFound(format!("Organization {}", organization_id))
        })?;

        Ok(SeatUsage {
            organization_id,
            seat_limit,
            seats_used,
            owners,
            seats_available: seats_available(seat_limit, seats_used),
        })
    }

    /// Active bindings for an organization, oldest first
    pub async fn active_bindings(&self, organization_id: OrgId) -> LedgerResult<Vec<SeatBinding>> {
        let bindings: Vec<SeatBinding> = sqlx::query_as(
            r#"
            SELECT id, organization_id, account_id, role, is_active,
                   created_at, deactivated_at
            FROM organization_seat_bindings
            WHERE organization_id = $1 AND is_active
            ORDER BY created_at ASC
            "#,
        )
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(bindings)
    }

    /// Change an organization's seat limit
    ///
    /// When the new limit is below current occupancy the newest non-owner
    /// bindings are released, under the same lock `bind_member` takes.
    pub async fn apply_seat_limit(
        &self,
        organization_id: OrgId,
        new_limit: Option<i32>,
    ) -> LedgerResult<SeatLimitChange> {
        if let Some(limit) = new_limit {
            if limit < 0 {
                return Err(LedgerError::InvalidInput(format!(
                    "seat limit must be non-negative, got {}",
                    limit
                )));
            }
        }

        let mut tx = self.pool.begin().await?;

        let previous_limit = lock_organization(&mut tx, organization_id).await?;

        sqlx::query("UPDATE organizations SET seat_limit = $2, updated_at = NOW() WHERE id = $1")
            .bind(organization_id)
            .bind(new_limit)
            .execute(&mut *tx)
            .await?;

        let seats_used = count_seats_used(&mut tx, organization_id).await?;
        let excess = excess_seats(new_limit, seats_used);

        let released: Vec<SeatBinding> = if excess > 0 {
            sqlx::query_as(
                r#"
                UPDATE organization_seat_bindings
                SET is_active = FALSE, deactivated_at = NOW()
                WHERE id IN (
                    SELECT id FROM organization_seat_bindings
                    WHERE organization_id = $1
                      AND is_active
                      AND LOWER(role) <> 'owner'
                    ORDER BY created_at DESC
                    LIMIT $2
                )
                RETURNING id, organization_id, account_id, role, is_active,
                          created_at, deactivated_at
                "#,
            )
            .bind(organization_id)
            .bind(excess)
            .fetch_all(&mut *tx)
            .await?
        } else {
            Vec::new()
        };

        LedgerEventBuilder::new(LedgerEventType::SeatLimitChanged)
            .organization(organization_id)
            .data(serde_json::json!({
                "previous_limit": previous_limit,
                "new_limit": new_limit,
                "released_accounts": released.iter().map(|b| b.account_id).collect::<Vec<_>>(),
            }))
            .insert(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::info!(
            organization_id = %organization_id,
            previous_limit = ?previous_limit,
            new_limit = ?new_limit,
            released_count = released.len(),
            "Applied seat limit"
        );

        Ok(SeatLimitChange {
            organization_id,
            previous_limit,
            new_limit,
            released,
        })
    }
}

/// Lock the organization row for the rest of the transaction and read its limit
async fn lock_organization(
    conn: &mut PgConnection,
    organization_id: OrgId,
) -> LedgerResult<Option<i32>> {
    let row: Option<(Option<i32>,)> =
        sqlx::query_as("SELECT seat_limit FROM organizations WHERE id = $1 FOR UPDATE")
            .bind(organization_id)
            .fetch_optional(&mut *conn)
            .await?;

    row.map(|(limit,)| limit)
        .ok_or_else(|| LedgerError::NotFound(format!("Organization {}", organization_id)))
}

/// Count active non-owner bindings
async fn count_seats_used(conn: &mut PgConnection, organization_id: OrgId) -> LedgerResult<i64> {
    let count: (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*)
        FROM organization_seat_bindings
        WHERE organization_id = $1 AND is_active AND LOWER(role) <> 'owner'
        "#,
    )
    .bind(organization_id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(count.0)
}
