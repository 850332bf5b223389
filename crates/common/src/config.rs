use std::str::FromStr;

use serde::Deserialize;

/// Where circuit breaker state lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakerBackend {
    /// Per-process map. State resets on restart.
    Memory,
    /// Shared across processes through Redis.
    Redis,
}

impl FromStr for BreakerBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(BreakerBackend::Memory),
            "redis" => Ok(BreakerBackend::Redis),
            other => Err(format!("unknown breaker backend '{other}'")),
        }
    }
}

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Redis connection string
    pub redis_url: String,

    /// Circuit breaker state backend (default: memory)
    pub breaker_backend: BreakerBackend,

    /// Socket address the API server binds to
    pub api_bind_addr: String,

    /// Delay before the first retry, in milliseconds (default: 1000)
    pub retry_base_delay_ms: u64,

    /// Upper bound on any single retry delay, in milliseconds (default: 30000)
    pub retry_max_delay_ms: u64,

    /// Backoff multiplier applied per attempt (default: 2.0)
    pub retry_multiplier: f64,

    /// Total provider calls allowed per attempt, first call included (default: 4)
    pub retry_max_attempts: u32,

    /// Failures within the window that open a breaker (default: 5)
    pub breaker_failure_threshold: u32,

    /// Observation window for breaker failures, in seconds (default: 60)
    pub breaker_window_secs: u64,

    /// Time an open breaker waits before allowing a trial call (default: 30)
    pub breaker_reset_timeout_secs: u64,

    /// Caller deadline for a dispatch, in seconds (default: 120)
    pub dispatch_deadline_secs: u64,

    /// Age after which delivery attempts move to cold storage (default: 90)
    pub attempt_retention_days: i64,

    /// Age after which notification records move to cold storage (default: 180)
    pub notification_retention_days: i64,

    /// Rows moved per archival batch (default: 500)
    pub archive_batch_size: i64,

    /// Batches per table per archival run (default: 20)
    pub archive_max_batches: u32,

    /// Interval between archival runs, in seconds (default: 86400)
    pub archive_interval_secs: u64,

    /// Resend API key for email delivery
    pub resend_api_key: Option<String>,

    /// Override for the Resend send endpoint, e.g. a local mock
    pub resend_api_url: Option<String>,

    /// Email sender address
    pub email_from: Option<String>,

    /// SMS gateway endpoint
    pub sms_provider_url: Option<String>,

    /// SMS gateway bearer token
    pub sms_provider_token: Option<String>,

    /// Push gateway endpoint
    pub push_provider_url: Option<String>,

    /// Push gateway bearer token
    pub push_provider_token: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            db_max_connections: 20,
            redis_url: "redis://localhost:6379".to_string(),
            breaker_backend: BreakerBackend::Memory,
            api_bind_addr: "0.0.0.0:3000".to_string(),
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 30_000,
            retry_multiplier: 2.0,
            retry_max_attempts: 4,
            breaker_failure_threshold: 5,
            breaker_window_secs: 60,
            breaker_reset_timeout_secs: 30,
            dispatch_deadline_secs: 120,
            attempt_retention_days: 90,
            notification_retention_days: 180,
            archive_batch_size: 500,
            archive_max_batches: 20,
            archive_interval_secs: 86_400,
            resend_api_key: None,
            resend_api_url: None,
            email_from: None,
            sms_provider_url: None,
            sms_provider_token: None,
            push_provider_url: None,
            push_provider_token: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            db_max_connections: parse_var("DB_MAX_CONNECTIONS", defaults.db_max_connections)?,
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            breaker_backend: parse_var("BREAKER_BACKEND", defaults.breaker_backend)?,
            api_bind_addr: std::env::var("API_BIND_ADDR").unwrap_or(defaults.api_bind_addr),
            retry_base_delay_ms: parse_var("RETRY_BASE_DELAY_MS", defaults.retry_base_delay_ms)?,
            retry_max_delay_ms: parse_var("RETRY_MAX_DELAY_MS", defaults.retry_max_delay_ms)?,
            retry_multiplier: parse_var("RETRY_MULTIPLIER", defaults.retry_multiplier)?,
            retry_max_attempts: parse_var("RETRY_MAX_ATTEMPTS", defaults.retry_max_attempts)?,
            breaker_failure_threshold: parse_var(
                "BREAKER_FAILURE_THRESHOLD",
                defaults.breaker_failure_threshold,
            )?,
            breaker_window_secs: parse_var("BREAKER_WINDOW_SECS", defaults.breaker_window_secs)?,
            breaker_reset_timeout_secs: parse_var(
                "BREAKER_RESET_TIMEOUT_SECS",
                defaults.breaker_reset_timeout_secs,
            )?,
            dispatch_deadline_secs: parse_var(
                "DISPATCH_DEADLINE_SECS",
                defaults.dispatch_deadline_secs,
            )?,
            attempt_retention_days: parse_var(
                "ATTEMPT_RETENTION_DAYS",
                defaults.attempt_retention_days,
            )?,
            notification_retention_days: parse_var(
                "NOTIFICATION_RETENTION_DAYS",
                defaults.notification_retention_days,
            )?,
            archive_batch_size: parse_var("ARCHIVE_BATCH_SIZE", defaults.archive_batch_size)?,
            archive_max_batches: parse_var("ARCHIVE_MAX_BATCHES", defaults.archive_max_batches)?,
            archive_interval_secs: parse_var(
                "ARCHIVE_INTERVAL_SECS",
                defaults.archive_interval_secs,
            )?,
            resend_api_key: std::env::var("RESEND_API_KEY").ok(),
            resend_api_url: std::env::var("RESEND_API_URL").ok().filter(|u| !u.is_empty()),
            email_from: std::env::var("EMAIL_FROM").ok(),
            sms_provider_url: std::env::var("SMS_PROVIDER_URL").ok(),
            sms_provider_token: std::env::var("SMS_PROVIDER_TOKEN").ok(),
            push_provider_url: std::env::var("PUSH_PROVIDER_URL").ok(),
            push_provider_token: std::env::var("PUSH_PROVIDER_TOKEN").ok(),
        })
    }
}

/// Read `key`, falling back to `default` when unset. A set but malformed value is an error.
fn parse_var<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("{key} is invalid ('{raw}'): {e}")),
        Err(_) => Ok(default),
    }
}
