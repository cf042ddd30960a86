//! Worker configuration

use std::env;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable (development)
    Text,
    /// One JSON object per line (production)
    Json,
}

/// Worker configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    // Database
    pub database_url: String,
    pub database_max_connections: u32,

    // Payment queue
    pub payment_queue_batch_size: i64,
    pub payment_queue_poll_cron: String,

    // Maintenance
    pub invariant_check_cron: String,
    pub event_retention_days: i32,

    // Logging
    pub log_format: LogFormat,
}

impl WorkerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            // Database
            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .unwrap_or(5),

            // Payment queue
            payment_queue_batch_size: {
                let size: i64 = env::var("PAYMENT_QUEUE_BATCH_SIZE")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()
                    .unwrap_or(10);
                if size < 1 {
                    return Err(ConfigError::Invalid(
                        "PAYMENT_QUEUE_BATCH_SIZE must be at least 1",
                    ));
                }
                size
            },
            payment_queue_poll_cron: env::var("PAYMENT_QUEUE_POLL_CRON")
                .unwrap_or_else(|_| "*/15 * * * * *".to_string()),

            // Maintenance
            invariant_check_cron: env::var("INVARIANT_CHECK_CRON")
                .unwrap_or_else(|_| "0 */10 * * * *".to_string()),
            event_retention_days: {
                let days: i32 = env::var("EVENT_RETENTION_DAYS")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()
                    .unwrap_or(30);
                if days < 1 {
                    return Err(ConfigError::Invalid(
                        "EVENT_RETENTION_DAYS must be at least 1",
                    ));
                }
                days
            },

            // Logging
            log_format: match env::var("LOG_FORMAT").as_deref() {
                Ok("json") | Ok("JSON") => LogFormat::Json,
                _ => LogFormat::Text,
            },
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}
