//! Authorization gate
//!
//! Read-only predicate consulted before privileged writes in the
//! assignment layer. Only period state matters: an exhausted quota never
//! closes the gate, an absent or lapsed period always does.

use lectern_shared::{AccountId, PeriodId};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::error::LedgerResult;
use crate::period::{AccountingPeriod, PeriodLifecycleManager};

/// Refusal reason shown when no usable period exists
pub const NO_ACTIVE_SUBSCRIPTION_REASON: &str = "Your usage-sponsor's subscription is not active.";

/// Outcome of a gate check, with enough context to explain a refusal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateDecision {
    pub allowed: bool,
    pub reason: Option<String>,
    pub period_id: Option<PeriodId>,
    pub expires_at: Option<OffsetDateTime>,
}

impl GateDecision {
    /// Decide from a candidate period as of `now`
    pub fn from_period(period: Option<&AccountingPeriod>, now: OffsetDateTime) -> Self {
        match period.filter(|p| p.is_usable_at(now)) {
            Some(p) => Self {
                allowed: true,
                reason: None,
                period_id: Some(p.id),
                expires_at: Some(p.end_time),
            },
            None => Self {
                allowed: false,
                reason: Some(NO_ACTIVE_SUBSCRIPTION_REASON.to_string()),
                period_id: None,
                expires_at: None,
            },
        }
    }
}

/// Authorization gate service
#[derive(Clone)]
pub struct AuthorizationGate {
    periods: PeriodLifecycleManager,
}

impl AuthorizationGate {
    pub fn new(pool: PgPool) -> Self {
        Self {
            periods: PeriodLifecycleManager::new(pool),
        }
    }

    /// Whether the account may perform the privileged action right now
    pub async fn can_perform_privileged_action(&self, account_id: AccountId) -> LedgerResult<bool> {
        Ok(self.authorization_status(account_id).await?.allowed)
    }

    /// Full gate decision for the account
    pub async fn authorization_status(&self, account_id: AccountId) -> LedgerResult<GateDecision> {
        let period = self.periods.get_active_period(account_id).await?;
        let decision = GateDecision::from_period(period.as_ref(), OffsetDateTime::now_utc());

        if !decision.allowed {
            tracing::debug!(
                account_id = %account_id,
                "Privileged action refused: no usable period"
            );
        }

        Ok(decision)
    }
}
