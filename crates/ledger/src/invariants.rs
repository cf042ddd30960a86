//! Ledger Invariants Module
//!
//! Runnable consistency checks over the quota ledger. They can be run on a
//! schedule or after a manual repair to confirm the database is in a valid
//! state. Checks only read, never write, and every violation carries enough
//! context to locate the offending rows.

use std::collections::HashSet;

use lectern_shared::{AccountId, OrgId, PeriodId};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{LedgerError, LedgerResult};

const SINGLE_ACTIVE_PERIOD: &str = "single_active_period";
const LEDGER_RECONCILES: &str = "ledger_reconciles";
const LEDGER_SNAPSHOTS_CHAIN: &str = "ledger_snapshots_chain";
const SEAT_LIMIT_RESPECTED: &str = "seat_limit_respected";

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Accounts affected
    pub account_ids: Vec<AccountId>,
    /// Organizations affected
    pub organization_ids: Vec<OrgId>,
    pub description: String,
    /// Offending values for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Quota or seat accounting is wrong
    Critical,
    /// History is inconsistent but totals still agree
    High,
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    fn from_violations(
        checked_at: OffsetDateTime,
        checks_run: usize,
        violations: Vec<InvariantViolation>,
    ) -> Self {
        let checks_failed = violations
            .iter()
            .map(|v| v.invariant.as_str())
            .collect::<HashSet<_>>()
            .len();

        Self {
            checked_at,
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }
}

/// Ledger total versus stored running total for one period
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodReconciliation {
    pub period_id: PeriodId,
    pub quota_used: i64,
    pub ledger_total: i64,
    /// `quota_used - ledger_total`; zero when reconciled
    pub drift: i64,
    pub entry_count: i64,
}

impl PeriodReconciliation {
    pub fn is_reconciled(&self) -> bool {
        self.drift == 0
    }
}

#[derive(Debug, sqlx::FromRow)]
struct MultipleActiveRow {
    account_id: AccountId,
    active_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct DriftRow {
    period_id: PeriodId,
    account_id: AccountId,
    quota_used: i64,
    ledger_total: i64,
    entry_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct BrokenChainRow {
    entry_id: Uuid,
    period_id: PeriodId,
    account_id: AccountId,
    quota_before: i64,
    quota_after: i64,
    quota_units_charged: i64,
    previous_after: Option<i64>,
}

#[derive(Debug, sqlx::FromRow)]
struct OverSeatLimitRow {
    organization_id: OrgId,
    seat_limit: i32,
    seats_used: i64,
}

/// Service for running ledger invariant checks
#[derive(Clone)]
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run every check and summarize
    pub async fn run_all(&self) -> LedgerResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_single_active_period().await?);
        violations.extend(self.check_ledger_reconciles().await?);
        violations.extend(self.check_ledger_snapshots_chain().await?);
        violations.extend(self.check_seat_limit_respected().await?);

        Ok(InvariantCheckSummary::from_violations(
            now,
            Self::available_checks().len(),
            violations,
        ))
    }

    /// At most one active period per account
    async fn check_single_active_period(&self) -> LedgerResult<Vec<InvariantViolation>> {
        let rows: Vec<MultipleActiveRow> = sqlx::query_as(
            r#"
            SELECT account_id, COUNT(*) as active_count
            FROM accounting_periods
            WHERE status = 'active'
            GROUP BY account_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: SINGLE_ACTIVE_PERIOD.to_string(),
                account_ids: vec![row.account_id],
                organization_ids: vec![],
                description: format!(
                    "Account has {} active periods (expected at most 1)",
                    row.active_count
                ),
                context: serde_json::json!({
                    "active_count": row.active_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Sum of ledger charges equals the period's running total
    async fn check_ledger_reconciles(&self) -> LedgerResult<Vec<InvariantViolation>> {
        let rows: Vec<DriftRow> = sqlx::query_as(
            r#"
            SELECT
                p.id as period_id,
                p.account_id,
                p.quota_used,
                COALESCE(SUM(e.quota_units_charged), 0)::BIGINT as ledger_total,
                COUNT(e.id) as entry_count
            FROM accounting_periods p
            LEFT JOIN usage_ledger_entries e ON e.period_id = p.id
            GROUP BY p.id, p.account_id, p.quota_used
            HAVING p.quota_used <> COALESCE(SUM(e.quota_units_charged), 0)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: LEDGER_RECONCILES.to_string(),
                account_ids: vec![row.account_id],
                organization_ids: vec![],
                description: format!(
                    "Period {} records {} used but its ledger sums to {}",
                    row.period_id, row.quota_used, row.ledger_total
                ),
                context: serde_json::json!({
                    "period_id": row.period_id,
                    "quota_used": row.quota_used,
                    "ledger_total": row.ledger_total,
                    "entry_count": row.entry_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Each entry starts where the previous entry of its period ended
    async fn check_ledger_snapshots_chain(&self) -> LedgerResult<Vec<InvariantViolation>> {
        let rows: Vec<BrokenChainRow> = sqlx::query_as(
            r#"
            SELECT entry_id, period_id, account_id, quota_before, quota_after,
                   quota_units_charged, previous_after
            FROM (
                SELECT
                    id as entry_id,
                    period_id,
                    account_id,
                    quota_before,
                    quota_after,
                    quota_units_charged,
                    LAG(quota_after) OVER (
                        PARTITION BY period_id
                        ORDER BY quota_after, created_at
                    ) as previous_after
                FROM usage_ledger_entries
            ) chained
            WHERE quota_after - quota_before <> quota_units_charged
               OR quota_before <> COALESCE(previous_after, 0)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: LEDGER_SNAPSHOTS_CHAIN.to_string(),
                account_ids: vec![row.account_id],
                organization_ids: vec![],
                description: format!(
                    "Ledger entry {} in period {} does not continue the previous snapshot",
                    row.entry_id, row.period_id
                ),
                context: serde_json::json!({
                    "entry_id": row.entry_id,
                    "period_id": row.period_id,
                    "quota_before": row.quota_before,
                    "quota_after": row.quota_after,
                    "quota_units_charged": row.quota_units_charged,
                    "previous_after": row.previous_after,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Active non-owner bindings never exceed a set seat limit
    async fn check_seat_limit_respected(&self) -> LedgerResult<Vec<InvariantViolation>> {
        let rows: Vec<OverSeatLimitRow> = sqlx::query_as(
            r#"
            SELECT o.id as organization_id, o.seat_limit, COUNT(b.id) as seats_used
            FROM organizations o
            JOIN organization_seat_bindings b
                ON b.organization_id = o.id
               AND b.is_active
               AND LOWER(b.role) <> 'owner'
            WHERE o.seat_limit IS NOT NULL
            GROUP BY o.id, o.seat_limit
            HAVING COUNT(b.id) > o.seat_limit
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: SEAT_LIMIT_RESPECTED.to_string(),
                account_ids: vec![],
                organization_ids: vec![row.organization_id],
                description: format!(
                    "Organization has {} seats in use with a limit of {}",
                    row.seats_used, row.seat_limit
                ),
                context: serde_json::json!({
                    "seat_limit": row.seat_limit,
                    "seats_used": row.seats_used,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Compare one period's running total to its ledger
    pub async fn reconcile_period(
        &self,
        period_id: PeriodId,
    ) -> LedgerResult<PeriodReconciliation> {
        let row: Option<(i64, i64, i64)> = sqlx::query_as(
            r#"
            SELECT
                p.quota_used,
                COALESCE(SUM(e.quota_units_charged), 0)::BIGINT,
                COUNT(e.id)
            FROM accounting_periods p
            LEFT JOIN usage_ledger_entries e ON e.period_id = p.id
            WHERE p.id = $1
            GROUP BY p.id, p.quota_used
            "#,
        )
        .bind(period_id)
        .fetch_optional(&self.pool)
        .await?;

        let (quota_used, ledger_total, entry_count) = row
            .ok_or_else(|| LedgerError::NotFound(format!("Accounting period {}", period_id)))?;

        Ok(PeriodReconciliation {
            period_id,
            quota_used,
            ledger_total,
            drift: quota_used - ledger_total,
            entry_count,
        })
    }

    /// Run a specific check by name
    pub async fn run_check(&self, name: &str) -> LedgerResult<Vec<InvariantViolation>> {
        match name {
            SINGLE_ACTIVE_PERIOD => self.check_single_active_period().await,
            LEDGER_RECONCILES => self.check_ledger_reconciles().await,
            LEDGER_SNAPSHOTS_CHAIN => self.check_ledger_snapshots_chain().await,
            SEAT_LIMIT_RESPECTED => self.check_seat_limit_respected().await,
            other => Err(LedgerError::InvalidInput(format!(
                "Unknown invariant check: {}",
                other
            ))),
        }
    }

    /// Names accepted by `run_check`
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            SINGLE_ACTIVE_PERIOD,
            LEDGER_RECONCILES,
            LEDGER_SNAPSHOTS_CHAIN,
            SEAT_LIMIT_RESPECTED,
        ]
    }
}
