// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Lectern Quota Ledger
//!
//! Resource governance for subscribing accounts and their organizations:
//! quota-bearing accounting periods, metered usage, and seat licenses.
//!
//! ## Features
//!
//! - **Period Lifecycle**: One active accounting period per account, replaced atomically on payment
//! - **Quota Enforcement**: Unit conversion, ledgered deductions, overage allowed with a warning
//! - **Seat Limits**: Race-free admission of staff members under an organization's seat license
//! - **Authorization Gate**: Privileged actions gated on period validity, never on quota level
//! - **Audit Events**: Append-only log of transitions, overage, and seat decisions
//! - **Invariant Checks**: Executable consistency checks over the whole ledger

pub mod error;
pub mod events;
pub mod gate;
pub mod invariants;
pub mod period;
pub mod quota;
pub mod seats;

// Error
pub use error::{LedgerError, LedgerResult};

// Events
pub use events::{ActorType, LedgerEvent, LedgerEventBuilder, LedgerEventLogger, LedgerEventType};

// Gate
pub use gate::{AuthorizationGate, GateDecision};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, PeriodReconciliation,
    ViolationSeverity,
};

// Periods
pub use period::{validate_plan_parameters, AccountingPeriod, PeriodLifecycleManager};

// Quota
pub use quota::{
    quota_units_for, FeatureUsageBreakdown, OverageSignal, QuotaEnforcer, QuotaStatus,
    SubjectUsageBreakdown, UsageLedgerEntry,
};

// Seats
pub use seats::{SeatBinding, SeatLimitChange, SeatLimitGuard, SeatUsage};

use sqlx::PgPool;

/// Main ledger service that combines all ledger functionality
#[derive(Clone)]
pub struct LedgerService {
    pub periods: PeriodLifecycleManager,
    pub quota: QuotaEnforcer,
    pub seats: SeatLimitGuard,
    pub gate: AuthorizationGate,
    pub events: LedgerEventLogger,
    pub invariants: InvariantChecker,
}

impl LedgerService {
    pub fn new(pool: PgPool) -> Self {
        Self {
            periods: PeriodLifecycleManager::new(pool.clone()),
            quota: QuotaEnforcer::new(pool.clone()),
            seats: SeatLimitGuard::new(pool.clone()),
            gate: AuthorizationGate::new(pool.clone()),
            events: LedgerEventLogger::new(pool.clone()),
            invariants: InvariantChecker::new(pool),
        }
    }
}
