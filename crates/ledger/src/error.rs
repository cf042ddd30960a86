//! Ledger error types

use lectern_shared::{AccountId, LecternError, OrgId};
use thiserror::Error;

use crate::gate::NO_ACTIVE_SUBSCRIPTION_REASON;

/// Ledger-specific errors
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Invalid plan parameters: {0}")]
    InvalidPlanParameters(String),

    #[error("No active subscription for account {0}")]
    NoActiveSubscription(AccountId),

    #[error("Unknown unit type: {0}")]
    UnknownUnitType(String),

    #[error("Seat limit reached for organization {organization_id} ({seats_used}/{seat_limit})")]
    SeatLimitExceeded {
        organization_id: OrgId,
        seat_limit: i32,
        seats_used: i64,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl LedgerError {
    /// Whether this error is an expected business condition shown to end users
    /// rather than a caller bug or an infrastructure failure
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            LedgerError::NoActiveSubscription(_) | LedgerError::SeatLimitExceeded { .. }
        )
    }

    /// Message suitable for the person who triggered the action
    pub fn user_message(&self) -> String {
        match self {
            LedgerError::NoActiveSubscription(_) => NO_ACTIVE_SUBSCRIPTION_REASON.to_string(),
            LedgerError::SeatLimitExceeded { seat_limit, .. } => format!(
                "All {} seats on this organization's license are in use. \
                 Free a seat or raise the limit.",
                seat_limit
            ),
            _ => "The request could not be completed.".to_string(),
        }
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        LedgerError::Database(err.to_string())
    }
}

impl From<LecternError> for LedgerError {
    fn from(err: LecternError) -> Self {
        match err {
            LecternError::Validation(msg) => LedgerError::InvalidInput(msg),
            other => LedgerError::Database(other.to_string()),
        }
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;
