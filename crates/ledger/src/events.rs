//! Ledger Events Module
//!
//! Append-only audit trail for the quota ledger. Events record period
//! transitions, overage, and seat admission so that questions like "why was
//! this invitation refused?" can be answered after the fact.
//!
//! Events can be written against the pool or inside an open transaction; the
//! latter commits (or rolls back) together with the change it describes.

use lectern_shared::{AccountId, OrgId};
use serde::{Deserialize, Serialize};
use sqlx::{PgExecutor, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::LedgerResult;

/// Types of ledger events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEventType {
    // Period lifecycle
    PeriodActivated,
    PeriodSuperseded,
    PeriodCancelled,

    // Metering
    OverageRecorded,

    // Seats
    SeatBound,
    SeatRejected,
    SeatReleased,
    SeatLimitChanged,
}

impl std::fmt::Display for LedgerEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LedgerEventType::PeriodActivated => "PERIOD_ACTIVATED",
            LedgerEventType::PeriodSuperseded => "PERIOD_SUPERSEDED",
            LedgerEventType::PeriodCancelled => "PERIOD_CANCELLED",
            LedgerEventType::OverageRecorded => "OVERAGE_RECORDED",
            LedgerEventType::SeatBound => "SEAT_BOUND",
            LedgerEventType::SeatRejected => "SEAT_REJECTED",
            LedgerEventType::SeatReleased => "SEAT_RELEASED",
            LedgerEventType::SeatLimitChanged => "SEAT_LIMIT_CHANGED",
        };
        write!(f, "{}", s)
    }
}

/// Who triggered the event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorType {
    /// End user through the product
    User,
    /// Admin user
    Admin,
    /// System automation
    System,
    /// Payment collaborator delivering a confirmed payment
    Payment,
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorType::User => write!(f, "user"),
            ActorType::Admin => write!(f, "admin"),
            ActorType::System => write!(f, "system"),
            ActorType::Payment => write!(f, "payment"),
        }
    }
}

/// A ledger event record
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LedgerEvent {
    pub id: Uuid,
    pub account_id: Option<AccountId>,
    pub organization_id: Option<OrgId>,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub actor_id: Option<Uuid>,
    pub actor_type: String,
    pub created_at: OffsetDateTime,
}

/// Builder for creating ledger events
#[derive(Debug, Clone)]
pub struct LedgerEventBuilder {
    account_id: Option<AccountId>,
    organization_id: Option<OrgId>,
    event_type: LedgerEventType,
    event_data: serde_json::Value,
    actor_id: Option<Uuid>,
    actor_type: ActorType,
}

impl LedgerEventBuilder {
    /// Create a new event builder
    pub fn new(event_type: LedgerEventType) -> Self {
        Self {
            account_id: None,
            organization_id: None,
            event_type,
            event_data: serde_json::json!({}),
            actor_id: None,
            actor_type: ActorType::System,
        }
    }

    /// Attach the account the event is about
    pub fn account(mut self, account_id: AccountId) -> Self {
        self.account_id = Some(account_id);
        self
    }

    /// Attach the organization the event is about
    pub fn organization(mut self, organization_id: OrgId) -> Self {
        self.organization_id = Some(organization_id);
        self
    }

    /// Set the event data
    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.event_data = data;
        self
    }

    /// Set the actor (user who triggered the event)
    pub fn actor(mut self, actor_id: Uuid, actor_type: ActorType) -> Self {
        self.actor_id = Some(actor_id);
        self.actor_type = actor_type;
        self
    }

    /// Set the actor type without a specific user
    pub fn actor_type(mut self, actor_type: ActorType) -> Self {
        self.actor_type = actor_type;
        self
    }

    /// Insert the event using any Postgres executor (pool or open transaction)
    pub async fn insert<'e, E>(self, executor: E) -> LedgerResult<Uuid>
    where
        E: PgExecutor<'e>,
    {
        let event_id: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO ledger_events (
                id,
                account_id,
                organization_id,
                event_type,
                event_data,
                actor_id,
                actor_type
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(self.account_id)
        .bind(self.organization_id)
        .bind(self.event_type.to_string())
        .bind(&self.event_data)
        .bind(self.actor_id)
        .bind(self.actor_type.to_string())
        .fetch_one(executor)
        .await?;

        Ok(event_id.0)
    }
}

/// Service for logging and querying ledger events
#[derive(Clone)]
pub struct LedgerEventLogger {
    pool: PgPool,
}

impl LedgerEventLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Log an event outside of any transaction
    pub async fn log_event(&self, builder: LedgerEventBuilder) -> LedgerResult<Uuid> {
        builder.insert(&self.pool).await
    }

    /// Log an event, reporting failures only through tracing
    ///
    /// Used for audit rows that must not turn a completed operation into an error.
    pub async fn log_event_best_effort(&self, builder: LedgerEventBuilder) {
        let event_type = builder.event_type;
        if let Err(e) = builder.insert(&self.pool).await {
            tracing::error!(
                event_type = %event_type,
                error = %e,
                "Failed to record ledger event"
            );
        }
    }

    /// Get recent events for an account
    pub async fn get_events_for_account(
        &self,
        account_id: AccountId,
        limit: i64,
    ) -> LedgerResult<Vec<LedgerEvent>> {
        let events: Vec<LedgerEvent> = sqlx::query_as(
            r#"
            SELECT id, account_id, organization_id, event_type, event_data,
                   actor_id, actor_type, created_at
            FROM ledger_events
            WHERE account_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(account_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }

    /// Get recent events for an organization
    pub async fn get_events_for_organization(
        &self,
        organization_id: OrgId,
        limit: i64,
    ) -> LedgerResult<Vec<LedgerEvent>> {
        let events: Vec<LedgerEvent> = sqlx::query_as(
            r#"
            SELECT id, account_id, organization_id, event_type, event_data,
                   actor_id, actor_type, created_at
            FROM ledger_events
            WHERE organization_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(organization_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }

    /// Get events of one type for an account
    pub async fn get_account_events_by_type(
        &self,
        account_id: AccountId,
        event_type: LedgerEventType,
        limit: i64,
    ) -> LedgerResult<Vec<LedgerEvent>> {
        let events: Vec<LedgerEvent> = sqlx::query_as(
            r#"
            SELECT id, account_id, organization_id, event_type, event_data,
                   actor_id, actor_type, created_at
            FROM ledger_events
            WHERE account_id = $1 AND event_type = $2
            ORDER BY created_at DESC
            LIMIT $3
            "#,
        )
        .bind(account_id)
        .bind(event_type.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }
}
