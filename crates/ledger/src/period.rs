//! Accounting period lifecycle
//!
//! Each confirmed payment opens a new quota-bearing period for an account and
//! retires whatever period was active before it. At most one period per
//! account is ever `active`.
//!
//! ## Lazy expiry
//!
//! Periods are not swept when `end_time` passes. A period is *usable* only
//! while `status = 'active' AND end_time > now`, and every read in this crate
//! applies that combined predicate instead of trusting `status` alone.

use lectern_shared::{AccountId, PeriodId, PeriodStatus};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};

use crate::error::{LedgerError, LedgerResult};
use crate::events::{ActorType, LedgerEventBuilder, LedgerEventType};

/// One quota-bearing interval for an account
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AccountingPeriod {
    pub id: PeriodId,
    pub account_id: AccountId,
    pub plan_name: String,
    /// Allotted quota in quota-seconds
    pub quota_total: i64,
    /// Running total of charges; may exceed `quota_total`
    pub quota_used: i64,
    pub start_time: OffsetDateTime,
    pub end_time: OffsetDateTime,
    pub status: PeriodStatus,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl AccountingPeriod {
    /// Combined usability predicate: stored status AND wall-clock bound
    pub fn is_usable_at(&self, now: OffsetDateTime) -> bool {
        self.status == PeriodStatus::Active && self.end_time > now
    }

    /// Signed remainder; negative when in overage
    pub fn balance(&self) -> i64 {
        self.quota_total - self.quota_used
    }

    /// Display remainder, clamped at zero
    ///
    /// Lossy: "exactly full" and "over by any amount" both read as 0.
    pub fn remaining(&self) -> i64 {
        self.balance().max(0)
    }

    pub fn is_over_quota(&self) -> bool {
        self.quota_used > self.quota_total
    }
}

/// Validate the inputs of a period activation
pub fn validate_plan_parameters(
    plan_name: &str,
    quota_total: i64,
    duration: Duration,
) -> LedgerResult<()> {
    if plan_name.trim().is_empty() {
        return Err(LedgerError::InvalidPlanParameters(
            "plan name must not be empty".to_string(),
        ));
    }
    if quota_total < 0 {
        return Err(LedgerError::InvalidPlanParameters(format!(
            "quota total must be non-negative, got {}",
            quota_total
        )));
    }
    if !duration.is_positive() {
        return Err(LedgerError::InvalidPlanParameters(format!(
            "duration must be positive, got {}",
            duration
        )));
    }
    Ok(())
}

/// Key for the per-account transaction lock that serializes activations
fn account_lock_key(account_id: AccountId) -> i64 {
    let (hi, lo) = account_id.0.as_u64_pair();
    (hi ^ lo) as i64
}

/// Period lifecycle service
#[derive(Clone)]
pub struct PeriodLifecycleManager {
    pool: PgPool,
}

impl PeriodLifecycleManager {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Retire the account's active period (if any) and open a new one
    ///
    /// Not idempotent: every call creates a new period. Suppressing duplicate
    /// payment deliveries is the payment collaborator's job.
    pub async fn activate_new_period(
        &self,
        account_id: AccountId,
        plan_name: &str,
        quota_total: i64,
        duration: Duration,
    ) -> LedgerResult<AccountingPeriod> {
        validate_plan_parameters(plan_name, quota_total, duration)?;

        let now = OffsetDateTime::now_utc();
        let end_time = now.checked_add(duration).ok_or_else(|| {
            LedgerError::InvalidPlanParameters(format!("duration {} overflows", duration))
        })?;

        let mut tx = self.pool.begin().await?;

        // Concurrent activations for one account queue here, so the UPDATE
        // below always sees the period the previous activation inserted.
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(account_lock_key(account_id))
            .execute(&mut *tx)
            .await?;

        let retired: Vec<(PeriodId,)> = sqlx::query_as(
            r#"
            UPDATE accounting_periods
            SET status = 'expired', updated_at = $2
            WHERE account_id = $1 AND status = 'active'
            RETURNING id
            "#,
        )
        .bind(account_id)
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        for (retired_id,) in &retired {
            LedgerEventBuilder::new(LedgerEventType::PeriodSuperseded)
                .account(account_id)
                .data(serde_json::json!({ "period_id": retired_id }))
                .actor_type(ActorType::Payment)
                .insert(&mut *tx)
                .await?;
        }

        let period: AccountingPeriod = sqlx::query_as(
            r#"
            INSERT INTO accounting_periods (
                id, account_id, plan_name, quota_total, quota_used,
                start_time, end_time, status, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, 0, $5, $6, 'active', $5, $5
            )
            RETURNING id, account_id, plan_name, quota_total, quota_used,
                      start_time, end_time, status, created_at, updated_at
            "#,
        )
        .bind(PeriodId::new())
        .bind(account_id)
        .bind(plan_name)
        .bind(quota_total)
        .bind(now)
        .bind(end_time)
        .fetch_one(&mut *tx)
        .await?;

        LedgerEventBuilder::new(LedgerEventType::PeriodActivated)
            .account(account_id)
            .data(serde_json::json!({
                "period_id": period.id,
                "plan_name": plan_name,
                "quota_total": quota_total,
                "end_time": end_time.unix_timestamp(),
                "superseded": retired.iter().map(|(id,)| *id).collect::<Vec<_>>(),
            }))
            .actor_type(ActorType::Payment)
            .insert(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::info!(
            account_id = %account_id,
            period_id = %period.id,
            plan_name = plan_name,
            quota_total = quota_total,
            superseded = retired.len(),
            "Activated new accounting period"
        );

        Ok(period)
    }

    /// The account's usable period, if any
    ///
    /// A row still marked `active` whose `end_time` has passed is treated as
    /// absent; its status is left untouched.
    pub async fn get_active_period(
        &self,
        account_id: AccountId,
    ) -> LedgerResult<Option<AccountingPeriod>> {
        let now = OffsetDateTime::now_utc();

        let period: Option<AccountingPeriod> = sqlx::query_as(
            r#"
            SELECT id, account_id, plan_name, quota_total, quota_used,
                   start_time, end_time, status, created_at, updated_at
            FROM accounting_periods
            WHERE account_id = $1
              AND status = 'active'
              AND end_time > $2
            "#,
        )
        .bind(account_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(period.filter(|p| p.is_usable_at(now)))
    }

    /// Fetch any period by id regardless of status
    pub async fn get_period(&self, period_id: PeriodId) -> LedgerResult<AccountingPeriod> {
        let period: Option<AccountingPeriod> = sqlx::query_as(
            r#"
            SELECT id, account_id, plan_name, quota_total, quota_used,
                   start_time, end_time, status, created_at, updated_at
            FROM accounting_periods
            WHERE id = $1
            "#,
        )
        .bind(period_id)
        .fetch_optional(&self.pool)
        .await?;

        period.ok_or_else(|| LedgerError::NotFound(format!("Accounting period {}", period_id)))
    }

    /// All periods for an account, newest first
    pub async fn period_history(
        &self,
        account_id: AccountId,
        limit: i64,
    ) -> LedgerResult<Vec<AccountingPeriod>> {
        let periods: Vec<AccountingPeriod> = sqlx::query_as(
            r#"
            SELECT id, account_id, plan_name, quota_total, quota_used,
                   start_time, end_time, status, created_at, updated_at
            FROM accounting_periods
            WHERE account_id = $1
            ORDER BY start_time DESC, created_at DESC
            LIMIT $2
            "#,
        )
        .bind(account_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(periods)
    }

    /// Cancel an active period (account closure or refund upstream)
    pub async fn cancel_period(&self, period_id: PeriodId) -> LedgerResult<AccountingPeriod> {
        let mut tx = self.pool.begin().await?;

        let period: Option<AccountingPeriod> = sqlx::query_as(
            r#"
            UPDATE accounting_periods
            SET status = 'cancelled', updated_at = NOW()
            WHERE id = $1 AND status = 'active'
            RETURNING id, account_id, plan_name, quota_total, quota_used,
                      start_time, end_time, status, created_at, updated_at
            "#,
        )
        .bind(period_id)
        .fetch_optional(&mut *tx)
        .await?;

        let period = period.ok_or_else(|| {
            LedgerError::NotFound(format!("Active accounting period {}", period_id))
        })?;

        LedgerEventBuilder::new(LedgerEventType::PeriodCancelled)
            .account(period.account_id)
            .data(serde_json::json!({
                "period_id": period.id,
                "quota_used": period.quota_used,
                "quota_total": period.quota_total,
            }))
            .insert(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::info!(
            account_id = %period.account_id,
            period_id = %period.id,
            "Cancelled accounting period"
        );

        Ok(period)
    }
}
