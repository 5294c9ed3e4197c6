use std::net::SocketAddr;
use std::time::Duration;

use chrono::TimeDelta;

use crate::retry::RetryPolicy;
use crate::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Environment {
    Development,
    Test,
    Production,
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Development => write!(f, "development"),
            Environment::Test => write!(f, "test"),
            Environment::Production => write!(f, "production"),
        }
    }
}

/// Which halves of the system this process runs.
///
/// The scheduler ticks must have exactly one active instance system-wide;
/// worker pools may be replicated freely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    /// Scheduler ticks, reaper, API and worker pools in one process.
    All,
    /// Generation scheduler, delivery scheduler, reaper and API.
    Scheduler,
    /// Generation workers only.
    Worker,
}

impl ProcessRole {
    #[must_use]
    pub fn runs_scheduler(self) -> bool {
        matches!(self, ProcessRole::All | ProcessRole::Scheduler)
    }

    #[must_use]
    pub fn runs_workers(self) -> bool {
        matches!(self, ProcessRole::All | ProcessRole::Worker)
    }
}

impl std::fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessRole::All => write!(f, "all"),
            ProcessRole::Scheduler => write!(f, "scheduler"),
            ProcessRole::Worker => write!(f, "worker"),
        }
    }
}

#[derive(Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub env: Environment,
    pub bind_addr: SocketAddr,
    pub log_level: String,
    pub role: ProcessRole,
    pub db_max_connections: u32,
    pub db_min_connections: u32,
    pub db_acquire_timeout_secs: u64,
    pub scheduler_tick_secs: u64,
    pub generation_workers: usize,
    pub delivery_concurrency: usize,
    pub worker_poll_min_ms: u64,
    pub worker_poll_max_ms: u64,
    pub generation_timeout_secs: u64,
    pub send_timeout_secs: u64,
    pub job_max_retries: i32,
    pub delivery_max_retries: i32,
    pub retry_backoff_secs: Vec<u64>,
    pub stale_job_after_secs: u64,
    pub stale_delivery_after_secs: u64,
    pub generation_lead_minutes: i64,
    pub generation_window_minutes: i64,
    pub generator_url: Option<String>,
    pub sender_url: Option<String>,
    pub api_keys: Vec<String>,
    pub api_rate_limit: u32,
    pub api_rate_window_secs: u64,
}

impl AppConfig {
    /// Checks the settings only the long-running server needs.
    ///
    /// Loading stays role-agnostic so the CLI can run with just
    /// `DATABASE_URL`; the server calls this before starting anything.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` for the first collaborator URL or
    /// key list this process's role and environment need but lack.
    pub fn validate_for_server(&self) -> Result<(), ConfigError> {
        if self.role.runs_workers() && self.generator_url.is_none() {
            return Err(ConfigError::MissingEnvVar("HERALD_GENERATOR_URL".to_string()));
        }
        if self.role.runs_scheduler() && self.sender_url.is_none() {
            return Err(ConfigError::MissingEnvVar("HERALD_SENDER_URL".to_string()));
        }
        if self.api_keys_required() && self.api_keys.is_empty() {
            return Err(ConfigError::MissingEnvVar("HERALD_API_KEYS".to_string()));
        }
        Ok(())
    }

    /// Whether the API must refuse to start without bearer keys.
    ///
    /// Outside production an empty key list leaves the API open.
    #[must_use]
    pub fn api_keys_required(&self) -> bool {
        self.env == Environment::Production
    }

    #[must_use]
    pub fn api_rate_window(&self) -> Duration {
        Duration::from_secs(self.api_rate_window_secs)
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_backoff_secs
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
        )
    }

    #[must_use]
    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_secs(self.scheduler_tick_secs)
    }

    #[must_use]
    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs)
    }

    #[must_use]
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    #[must_use]
    pub fn stale_job_after(&self) -> TimeDelta {
        secs_delta(self.stale_job_after_secs)
    }

    #[must_use]
    pub fn stale_delivery_after(&self) -> TimeDelta {
        secs_delta(self.stale_delivery_after_secs)
    }

    #[must_use]
    pub fn generation_lead(&self) -> TimeDelta {
        TimeDelta::minutes(self.generation_lead_minutes)
    }

    #[must_use]
    pub fn generation_window(&self) -> TimeDelta {
        TimeDelta::minutes(self.generation_window_minutes)
    }
}

fn secs_delta(secs: u64) -> TimeDelta {
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .unwrap_or(TimeDelta::MAX)
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("env", &self.env)
            .field("bind_addr", &self.bind_addr)
            .field("log_level", &self.log_level)
            .field("role", &self.role)
            .field("database_url", &"[redacted]")
            .field("db_max_connections", &self.db_max_connections)
            .field("db_min_connections", &self.db_min_connections)
            .field("db_acquire_timeout_secs", &self.db_acquire_timeout_secs)
            .field("scheduler_tick_secs", &self.scheduler_tick_secs)
            .field("generation_workers", &self.generation_workers)
            .field("delivery_concurrency", &self.delivery_concurrency)
            .field("worker_poll_min_ms", &self.worker_poll_min_ms)
            .field("worker_poll_max_ms", &self.worker_poll_max_ms)
            .field("generation_timeout_secs", &self.generation_timeout_secs)
            .field("send_timeout_secs", &self.send_timeout_secs)
            .field("job_max_retries", &self.job_max_retries)
            .field("delivery_max_retries", &self.delivery_max_retries)
            .field("retry_backoff_secs", &self.retry_backoff_secs)
            .field("stale_job_after_secs", &self.stale_job_after_secs)
            .field("stale_delivery_after_secs", &self.stale_delivery_after_secs)
            .field("generation_lead_minutes", &self.generation_lead_minutes)
            .field("generation_window_minutes", &self.generation_window_minutes)
            .field("generator_url", &self.generator_url)
            .field("sender_url", &self.sender_url)
            .field(
                "api_keys",
                &format_args!("[{} redacted]", self.api_keys.len()),
            )
            .field("api_rate_limit", &self.api_rate_limit)
            .field("api_rate_window_secs", &self.api_rate_window_secs)
            .finish()
    }
}
