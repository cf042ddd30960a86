//! Payment Event Queue Processor
//!
//! Drains "payment confirmed" events written by the payment collaborator and
//! turns each into a period activation. Rows are claimed with
//! `FOR UPDATE SKIP LOCKED` so several workers can drain the queue at once.
//!
//! Activation is not idempotent: a payment delivered twice opens two periods.
//! Deduplicating deliveries is left to the collaborator.

use lectern_ledger::{LedgerError, PeriodLifecycleManager};
use lectern_shared::AccountId;
use sqlx::PgPool;
use tracing::{error, info, warn};
use uuid::Uuid;

/// A claimed queue row
#[derive(Debug, sqlx::FromRow)]
struct PaymentEvent {
    id: Uuid,
    account_id: AccountId,
    plan_name: String,
    quota_total: i64,
    duration_seconds: i64,
    attempts: i32,
    max_attempts: i32,
}

/// What to do with a queue row after a failed activation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Leave retryable; picked up again after the backoff window
    Retry,
    /// Give up; never picked up again
    Permanent,
}

/// Classify a failed activation
///
/// Bad plan parameters will fail the same way on every attempt.
pub fn failure_disposition(
    err: &LedgerError,
    attempts: i32,
    max_attempts: i32,
) -> FailureDisposition {
    if matches!(err, LedgerError::InvalidPlanParameters(_)) || attempts >= max_attempts {
        FailureDisposition::Permanent
    } else {
        FailureDisposition::Retry
    }
}

/// Counts from one queue drain
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueueRunStats {
    pub claimed: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Process pending payment events from the queue
///
/// Returns what this drain did; an empty or unreachable queue yields zero counts.
pub async fn process_payment_queue(
    pool: &PgPool,
    periods: &PeriodLifecycleManager,
    batch_size: i64,
) -> QueueRunStats {
    let mut stats = QueueRunStats::default();

    // Claim pending rows and failed rows whose backoff has elapsed
    let events: Vec<PaymentEvent> = match sqlx::query_as(
        r#"
        UPDATE payment_event_queue
        SET status = 'processing', last_attempt_at = NOW(), attempts = attempts + 1
        WHERE id IN (
            SELECT id FROM payment_event_queue
            WHERE (status = 'pending' OR (status = 'failed' AND attempts < max_attempts))
              AND (last_attempt_at IS NULL OR last_attempt_at < NOW() - INTERVAL '5 minutes')
            ORDER BY created_at ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
        )
        RETURNING id, account_id, plan_name, quota_total, duration_seconds,
                  attempts, max_attempts
        "#,
    )
    .bind(batch_size)
    .fetch_all(pool)
    .await
    {
        Ok(events) => events,
        Err(e) => {
            error!(error = %e, "Failed to claim payment events from queue");
            return stats;
        }
    };

    if events.is_empty() {
        return stats;
    }

    stats.claimed = events.len();
    info!(count = events.len(), "Processing payment events from queue");

    for event in events {
        let result = periods
            .activate_new_period(
                event.account_id,
                &event.plan_name,
                event.quota_total,
                time::Duration::seconds(event.duration_seconds),
            )
            .await;

        match result {
            Ok(period) => {
                stats.completed += 1;

                if let Err(e) = sqlx::query(
                    r#"
                    UPDATE payment_event_queue
                    SET status = 'completed', processed_at = NOW(), last_error = NULL
                    WHERE id = $1
                    "#,
                )
                .bind(event.id)
                .execute(pool)
                .await
                {
                    error!(
                        queue_id = %event.id,
                        error = %e,
                        "Failed to mark payment event as completed"
                    );
                }

                info!(
                    queue_id = %event.id,
                    account_id = %event.account_id,
                    period_id = %period.id,
                    "Payment event activated a new period"
                );
            }
            Err(err) => {
                stats.failed += 1;
                let error_msg = err.to_string();
                let disposition = failure_disposition(&err, event.attempts, event.max_attempts);

                let update = match disposition {
                    FailureDisposition::Permanent => sqlx::query(
                        r#"
                        UPDATE payment_event_queue
                        SET status = 'failed', last_error = $2,
                            attempts = GREATEST(attempts, max_attempts), processed_at = NOW()
                        WHERE id = $1
                        "#,
                    ),
                    FailureDisposition::Retry => sqlx::query(
                        r#"
                        UPDATE payment_event_queue
                        SET status = 'failed', last_error = $2
                        WHERE id = $1
                        "#,
                    ),
                };

                if let Err(e) = update.bind(event.id).bind(&error_msg).execute(pool).await {
                    error!(
                        queue_id = %event.id,
                        error = %e,
                        "Failed to mark payment event as failed"
                    );
                }

                match disposition {
                    FailureDisposition::Permanent => error!(
                        queue_id = %event.id,
                        account_id = %event.account_id,
                        attempts = event.attempts,
                        error = %error_msg,
                        "Payment event permanently failed"
                    ),
                    FailureDisposition::Retry => warn!(
                        queue_id = %event.id,
                        account_id = %event.account_id,
                        attempts = event.attempts,
                        max_attempts = event.max_attempts,
                        error = %error_msg,
                        "Payment event failed, will retry"
                    ),
                }
            }
        }
    }

    stats
}

/// Delete finished queue rows older than the retention window
pub async fn cleanup_processed_events(pool: &PgPool, retention_days: i32) {
    let result = sqlx::query(
        r#"
        DELETE FROM payment_event_queue
        WHERE processed_at < NOW() - make_interval(days => $1)
          AND status IN ('completed', 'failed')
        "#,
    )
    .bind(retention_days)
    .execute(pool)
    .await;

    match result {
        Ok(rows) => {
            if rows.rows_affected() > 0 {
                info!(
                    deleted = rows.rows_affected(),
                    retention_days = retention_days,
                    "Cleaned up old payment queue entries"
                );
            }
        }
        Err(e) => {
            error!(error = %e, "Failed to clean up payment queue");
        }
    }
}
