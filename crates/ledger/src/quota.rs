//! Usage metering and quota deduction
//!
//! Converts raw feature usage (seconds of audio, characters of text, images)
//! into quota-seconds and charges it against the account's usable period.
//!
//! ## Overage policy
//!
//! Usage is never refused for lack of quota. The only refusal is the absence
//! of a usable period. When a deduction pushes `quota_used` past
//! `quota_total` the deduction still commits and an overage warning is
//! emitted; display code clamps the remainder, enforcement never does.
//!
//! ## Reconciliation
//!
//! The ledger insert and the period's running-total update share one
//! transaction, so the sum of `quota_units_charged` over a period's entries
//! always equals its `quota_used`.

use lectern_shared::{AccountId, PeriodId, SubjectId, UnitType};
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{LedgerError, LedgerResult};
use crate::events::{ActorType, LedgerEventBuilder, LedgerEventType};
use crate::period::{AccountingPeriod, PeriodLifecycleManager};

/// Longest feature tag accepted (matches the column width)
const MAX_FEATURE_TYPE_LEN: usize = 64;

/// One immutable metering event
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UsageLedgerEntry {
    pub id: Uuid,
    pub period_id: PeriodId,
    pub account_id: AccountId,
    pub subject_id: SubjectId,
    pub feature_type: String,
    pub raw_unit_count: f64,
    pub raw_unit_type: UnitType,
    pub quota_units_charged: i64,
    pub quota_before: i64,
    pub quota_after: i64,
    pub created_at: OffsetDateTime,
}

/// Overage raised by a committed deduction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverageSignal {
    pub account_id: AccountId,
    pub period_id: PeriodId,
    pub quota_total: i64,
    pub quota_after: i64,
    /// How far past the allotment the period now is
    pub overage: i64,
    /// True only for the deduction that first crossed the allotment
    pub crossed_now: bool,
}

impl OverageSignal {
    /// Detect overage for a deduction moving `quota_before` to `quota_after`
    pub fn detect(period: &AccountingPeriod, quota_before: i64, quota_after: i64) -> Option<Self> {
        if quota_after <= period.quota_total {
            return None;
        }
        Some(Self {
            account_id: period.account_id,
            period_id: period.id,
            quota_total: period.quota_total,
            quota_after,
            overage: quota_after - period.quota_total,
            crossed_now: quota_before <= period.quota_total,
        })
    }
}

/// Convert a raw usage amount into quota units, rounding up
///
/// Scales by the unit's rational multiplier (numerator, then denominator)
/// rather than a decimal factor.
pub fn quota_units_for(raw_unit_count: f64, unit: UnitType) -> LedgerResult<i64> {
    if !raw_unit_count.is_finite() || raw_unit_count <= 0.0 {
        return Err(LedgerError::InvalidInput(format!(
            "raw unit count must be a positive number, got {}",
            raw_unit_count
        )));
    }

    let multiplier = unit.multiplier();
    let scaled = raw_unit_count * multiplier.numerator as f64 / multiplier.denominator as f64;
    let charged = scaled.ceil();

    if !charged.is_finite() || charged >= i64::MAX as f64 {
        return Err(LedgerError::InvalidInput(format!(
            "{} {} is too large to charge",
            raw_unit_count, unit
        )));
    }

    Ok(charged as i64)
}

/// Parse and validate the caller-supplied unit key
pub fn parse_unit_type(raw_unit_type: &str) -> LedgerResult<UnitType> {
    raw_unit_type
        .parse()
        .map_err(|_| LedgerError::UnknownUnitType(raw_unit_type.to_string()))
}

fn validate_feature_type(feature_type: &str) -> LedgerResult<()> {
    if feature_type.trim().is_empty() {
        return Err(LedgerError::InvalidInput(
            "feature type must not be empty".to_string(),
        ));
    }
    if feature_type.len() > MAX_FEATURE_TYPE_LEN {
        return Err(LedgerError::InvalidInput(format!(
            "feature type longer than {} bytes",
            MAX_FEATURE_TYPE_LEN
        )));
    }
    Ok(())
}

/// Quota position of an account's usable period, for dashboards and prompts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaStatus {
    pub account_id: AccountId,
    pub period_id: PeriodId,
    pub plan_name: String,
    pub quota_total: i64,
    pub quota_used: i64,
    /// Signed remainder (`quota_total - quota_used`)
    pub balance: i64,
    /// Remainder clamped at zero, display only
    pub remaining: i64,
    pub percentage_used: f64,
    pub is_over_quota: bool,
    pub period_start: OffsetDateTime,
    pub period_end: OffsetDateTime,
}

impl QuotaStatus {
    pub fn from_period(period: &AccountingPeriod) -> Self {
        let percentage_used = if period.quota_total > 0 {
            (period.quota_used as f64 / period.quota_total as f64) * 100.0
        } else if period.quota_used > 0 {
            100.0
        } else {
            0.0
        };

        Self {
            account_id: period.account_id,
            period_id: period.id,
            plan_name: period.plan_name.clone(),
            quota_total: period.quota_total,
            quota_used: period.quota_used,
            balance: period.balance(),
            remaining: period.remaining(),
            percentage_used,
            is_over_quota: period.is_over_quota(),
            period_start: period.start_time,
            period_end: period.end_time,
        }
    }
}

/// Usage breakdown by feature
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FeatureUsageBreakdown {
    pub feature_type: String,
    pub entry_count: i64,
    pub quota_units: i64,
}

/// Usage breakdown by end user
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SubjectUsageBreakdown {
    pub subject_id: SubjectId,
    pub entry_count: i64,
    pub quota_units: i64,
}

/// Quota enforcement and usage ledger service
#[derive(Clone)]
pub struct QuotaEnforcer {
    pool: PgPool,
    periods: PeriodLifecycleManager,
}

impl QuotaEnforcer {
    pub fn new(pool: PgPool) -> Self {
        Self {
            periods: PeriodLifecycleManager::new(pool.clone()),
            pool,
        }
    }

    /// Charge one metering event against the account's usable period
    ///
    /// Fails with `NoActiveSubscription` when no usable period exists; never
    /// fails because quota is exhausted.
    pub async fn deduct(
        &self,
        account_id: AccountId,
        subject_id: SubjectId,
        feature_type: &str,
        raw_unit_count: f64,
        raw_unit_type: &str,
    ) -> LedgerResult<UsageLedgerEntry> {
        let unit = parse_unit_type(raw_unit_type)?;
        validate_feature_type(feature_type)?;
        let charged = quota_units_for(raw_unit_count, unit)?;

        let mut tx = self.pool.begin().await?;
        let now = OffsetDateTime::now_utc();

        let period = match lock_usable_period(&mut tx, account_id, now).await? {
            Some(p) => p,
            // A concurrent activation may have just replaced the period this
            // statement was waiting on; a fresh statement sees its successor.
            None => lock_usable_period(&mut tx, account_id, now)
                .await?
                .ok_or(LedgerError::NoActiveSubscription(account_id))?,
        };

        let quota_before = period.quota_used;
        let quota_after = quota_before.checked_add(charged).ok_or_else(|| {
            LedgerError::InvalidInput(format!(
                "charge of {} overflows period {}",
                charged, period.id
            ))
        })?;

        sqlx::query(
            r#"
            UPDATE accounting_periods
            SET quota_used = $2, updated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(period.id)
        .bind(quota_after)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let entry: UsageLedgerEntry = sqlx::query_as(
            r#"
            INSERT INTO usage_ledger_entries (
                id, period_id, account_id, subject_id, feature_type,
                raw_unit_count, raw_unit_type, quota_units_charged,
                quota_before, quota_after, created_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11
            )
            RETURNING id, period_id, account_id, subject_id, feature_type,
                      raw_unit_count, raw_unit_type, quota_units_charged,
                      quota_before, quota_after, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(period.id)
        .bind(account_id)
        .bind(subject_id)
        .bind(feature_type)
        .bind(raw_unit_count)
        .bind(unit)
        .bind(charged)
        .bind(quota_before)
        .bind(quota_after)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        let overage = OverageSignal::detect(&period, quota_before, quota_after);

        if let Some(signal) = overage.as_ref().filter(|s| s.crossed_now) {
            LedgerEventBuilder::new(LedgerEventType::OverageRecorded)
                .account(account_id)
                .data(serde_json::json!({
                    "period_id": signal.period_id,
                    "quota_total": signal.quota_total,
                    "quota_after": signal.quota_after,
                    "entry_id": entry.id,
                }))
                .actor_type(ActorType::User)
                .insert(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        if let Some(signal) = overage {
            tracing::warn!(
                account_id = %signal.account_id,
                period_id = %signal.period_id,
                quota_total = signal.quota_total,
                quota_used = signal.quota_after,
                overage = signal.overage,
                crossed_now = signal.crossed_now,
                feature_type = feature_type,
                "Quota exceeded; usage allowed under overage policy"
            );
        } else {
            tracing::debug!(
                account_id = %account_id,
                period_id = %period.id,
                charged = charged,
                quota_used = quota_after,
                "Recorded usage"
            );
        }

        Ok(entry)
    }

    /// Clamped remaining quota of the usable period, or 0 without one
    pub async fn remaining(&self, account_id: AccountId) -> LedgerResult<i64> {
        Ok(self
            .periods
            .get_active_period(account_id)
            .await?
            .map(|p| p.remaining())
            .unwrap_or(0))
    }

    /// Full quota position of the usable period
    pub async fn quota_status(&self, account_id: AccountId) -> LedgerResult<Option<QuotaStatus>> {
        Ok(self
            .periods
            .get_active_period(account_id)
            .await?
            .map(|p| QuotaStatus::from_period(&p)))
    }

    /// Ledger entries of a period, newest first
    pub async fn entries_for_period(
        &self,
        period_id: PeriodId,
        limit: i64,
    ) -> LedgerResult<Vec<UsageLedgerEntry>> {
        let entries: Vec<UsageLedgerEntry> = sqlx::query_as(
            r#"
            SELECT id, period_id, account_id, subject_id, feature_type,
                   raw_unit_count, raw_unit_type, quota_units_charged,
                   quota_before, quota_after, created_at
            FROM usage_ledger_entries
            WHERE period_id = $1
            ORDER BY quota_after DESC
            LIMIT $2
            "#,
        )
        .bind(period_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }

    /// Quota consumed per feature within a period
    pub async fn usage_by_feature(
        &self,
        period_id: PeriodId,
    ) -> LedgerResult<Vec<FeatureUsageBreakdown>> {
        let rows: Vec<FeatureUsageBreakdown> = sqlx::query_as(
            r#"
            SELECT
                feature_type,
                COUNT(*)::BIGINT as entry_count,
                COALESCE(SUM(quota_units_charged), 0)::BIGINT as quota_units
            FROM usage_ledger_entries
            WHERE period_id = $1
            GROUP BY feature_type
            ORDER BY quota_units DESC
            "#,
        )
        .bind(period_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Quota consumed per end user within a period
    pub async fn usage_by_subject(
        &self,
        period_id: PeriodId,
    ) -> LedgerResult<Vec<SubjectUsageBreakdown>> {
        let rows: Vec<SubjectUsageBreakdown> = sqlx::query_as(
            r#"
            SELECT
                subject_id,
                COUNT(*)::BIGINT as entry_count,
                COALESCE(SUM(quota_units_charged), 0)::BIGINT as quota_units
            FROM usage_ledger_entries
            WHERE period_id = $1
            GROUP BY subject_id
            ORDER BY quota_units DESC
            "#,
        )
        .bind(period_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

/// Select the account's usable period and hold its row lock for the transaction
async fn lock_usable_period(
    conn: &mut PgConnection,
    account_id: AccountId,
    now: OffsetDateTime,
) -> LedgerResult<Option<AccountingPeriod>> {
    let period: Option<AccountingPeriod> = sqlx::query_as(
        r#"
        SELECT id, account_id, plan_name, quota_total, quota_used,
               start_time, end_time, status, created_at, updated_at
        FROM accounting_periods
        WHERE account_id = $1
          AND status = 'active'
          AND end_time > $2
        FOR UPDATE
        "#,
    )
    .bind(account_id)
    .bind(now)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(period.filter(|p| p.is_usable_at(now)))
}
