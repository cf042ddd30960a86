// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Lectern background worker
//!
//! - Drains the payment event queue into period activations
//! - Runs the ledger invariant checks on a schedule
//! - Prunes finished queue rows daily

mod config;
mod payment_queue;

use std::time::Duration;

use lectern_ledger::{InvariantChecker, LedgerService, PeriodLifecycleManager};
use sqlx::PgPool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, WorkerConfig};

const CLEANUP_CRON: &str = "0 0 3 * * *";

fn init_logging(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("lectern_worker=info,lectern_ledger=info"));

    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().flatten_event(true))
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer())
            .init(),
    }
}

/// Backoff for the initial connection: 8 attempts, at most 30s apart
fn connect_retry_strategy() -> impl Iterator<Item = Duration> {
    ExponentialBackoff::from_millis(500)
        .max_delay(Duration::from_secs(30))
        .take(8)
        .map(jitter)
}

/// Connect with exponential backoff and bring the schema up to date
///
/// The database may start after the worker, so migrations run only once a
/// connection has been established.
async fn connect_and_migrate(config: &WorkerConfig) -> anyhow::Result<PgPool> {
    let database_url = config.database_url.clone();
    let max_connections = config.database_max_connections;

    let pool = Retry::spawn(connect_retry_strategy(), || {
        let database_url = database_url.clone();
        async move {
            lectern_shared::create_pool(&database_url, max_connections)
                .await
                .map_err(|e| {
                    warn!(error = %e, "Database connection failed, retrying");
                    e
                })
        }
    })
    .await?;

    lectern_shared::run_migrations(&pool).await?;

    Ok(pool)
}

async fn drain_payment_queue(pool: &PgPool, periods: &PeriodLifecycleManager, batch_size: i64) {
    let stats = payment_queue::process_payment_queue(pool, periods, batch_size).await;

    if stats.claimed > 0 {
        info!(
            claimed = stats.claimed,
            completed = stats.completed,
            failed = stats.failed,
            "Payment queue drained"
        );
    }
}

async fn run_invariant_checks(checker: &InvariantChecker) {
    match checker.run_all().await {
        Ok(summary) if summary.healthy => {
            info!(checks_run = summary.checks_run, "Ledger invariants hold");
        }
        Ok(summary) => {
            for violation in &summary.violations {
                error!(
                    invariant = %violation.invariant,
                    severity = %violation.severity,
                    accounts = ?violation.account_ids,
                    organizations = ?violation.organization_ids,
                    context = %violation.context,
                    "{}",
                    violation.description
                );
            }
            error!(
                checks_failed = summary.checks_failed,
                violations = summary.violations.len(),
                "Ledger invariant violations found"
            );
        }
        Err(e) => error!(error = %e, "Failed to run ledger invariant checks"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = WorkerConfig::from_env()?;
    init_logging(config.log_format);

    info!("Starting lectern worker");

    let pool = connect_and_migrate(&config).await?;
    let ledger = LedgerService::new(pool.clone());

    let mut scheduler = JobScheduler::new().await?;

    {
        let pool = pool.clone();
        let periods = ledger.periods.clone();
        let batch_size = config.payment_queue_batch_size;
        scheduler
            .add(Job::new_async(
                config.payment_queue_poll_cron.as_str(),
                move |_id, _scheduler| {
                    let pool = pool.clone();
                    let periods = periods.clone();
                    Box::pin(async move {
                        drain_payment_queue(&pool, &periods, batch_size).await;
                    })
                },
            )?)
            .await?;
    }

    {
        let checker = ledger.invariants.clone();
        scheduler
            .add(Job::new_async(
                config.invariant_check_cron.as_str(),
                move |_id, _scheduler| {
                    let checker = checker.clone();
                    Box::pin(async move {
                        run_invariant_checks(&checker).await;
                    })
                },
            )?)
            .await?;
    }

    {
        let pool = pool.clone();
        let retention_days = config.event_retention_days;
        scheduler
            .add(Job::new_async(CLEANUP_CRON, move |_id, _scheduler| {
                let pool = pool.clone();
                Box::pin(async move {
                    payment_queue::cleanup_processed_events(&pool, retention_days).await;
                })
            })?)
            .await?;
    }

    scheduler.start().await?;

    info!(
        poll_cron = %config.payment_queue_poll_cron,
        invariant_cron = %config.invariant_check_cron,
        "Worker started"
    );

    // Drain once immediately rather than waiting for the first tick
    drain_payment_queue(&pool, &ledger.periods, config.payment_queue_batch_size).await;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    scheduler.shutdown().await?;
    pool.close().await;

    info!("Worker stopped");
    Ok(())
}
