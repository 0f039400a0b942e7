//! Configuration module
//!
//! Env-driven configuration for the API tier and the worker binary. Defaults
//! follow the queue's operating assumptions: long leases (tasks run tens of
//! seconds to minutes), short jittered idle polls, heartbeats well inside the
//! lease window.

use std::env;
use std::str::FromStr;

use anyhow::{Context, Result};

const SERVER_PORT: u16 = 8000;
const MAX_CONNECTIONS: u32 = 20;
const CONNECTION_TIMEOUT_SECS: u64 = 30;

const LEASE_DURATION_SECS: i64 = 30 * 60;
const RETRY_BASE_BACKOFF_SECS: i64 = 5 * 60;
const RETRY_MAX_BACKOFF_SECS: i64 = 60 * 60;
const MAX_ATTEMPTS: i32 = 3;
const LEASE_SWEEP_INTERVAL_SECS: u64 = 60;
const HEARTBEAT_INTERVAL_SECS: u64 = 10;
const WORKER_PRUNE_RETENTION_SECS: i64 = 24 * 60 * 60;
const TASK_RETENTION_DAYS: i32 = 30;

/// Parse an env var, falling back to a default when unset.
fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("Invalid value for {}: {:?}", key, raw)),
        Err(_) => Ok(default),
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Base configuration shared by both services
#[derive(Clone, Debug)]
pub struct BaseConfig {
    pub server_port: u16,
    pub cors_origins: Vec<String>,
    pub db_max_connections: u32,
    pub db_timeout_seconds: u64,
    pub environment: String,
}

impl BaseConfig {
    fn from_env() -> Result<Self> {
        let cors_origins = env_or("CORS_ORIGINS", "*")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            server_port: parse_env("SERVER_PORT", SERVER_PORT)?,
            cors_origins,
            db_max_connections: parse_env("DB_MAX_CONNECTIONS", MAX_CONNECTIONS)?,
            db_timeout_seconds: parse_env("DB_TIMEOUT_SECONDS", CONNECTION_TIMEOUT_SECS)?,
            environment: env_or("ENVIRONMENT", "development"),
        })
    }
}

/// Queue behaviour knobs: leases, retries, sweeps, retention.
#[derive(Clone, Debug)]
pub struct QueueConfig {
    /// Hard timeout per claim; a worker that cannot renew inside this window
    /// loses exclusivity.
    pub lease_duration_secs: i64,
    /// First retry delay; doubles each attempt.
    pub retry_base_backoff_secs: i64,
    /// Ceiling on the computed backoff.
    pub retry_max_backoff_secs: i64,
    pub max_attempts: i32,
    /// Interval between runs of the lease-expiry / retry-promotion sweep.
    pub lease_sweep_interval_secs: u64,
    /// Expected worker heartbeat cadence; the grace window derives from it.
    pub worker_heartbeat_interval_secs: u64,
    /// Seconds without a heartbeat before a worker is marked inactive.
    pub worker_grace_secs: i64,
    /// Seconds an inactive worker is kept before pruning.
    pub worker_prune_retention_secs: i64,
    /// Retention in days for finished tasks. 0 disables cleanup.
    pub task_retention_days: i32,
}

impl QueueConfig {
    fn from_env() -> Result<Self> {
        let worker_heartbeat_interval_secs: u64 =
            parse_env("WORKER_HEARTBEAT_INTERVAL_SECS", HEARTBEAT_INTERVAL_SECS)?;
        let default_grace = Self::default_grace(worker_heartbeat_interval_secs);

        Ok(Self {
            lease_duration_secs: parse_env("LEASE_DURATION_SECS", LEASE_DURATION_SECS)?,
            retry_base_backoff_secs: parse_env(
                "RETRY_BASE_BACKOFF_SECS",
                RETRY_BASE_BACKOFF_SECS,
            )?,
            retry_max_backoff_secs: parse_env("RETRY_MAX_BACKOFF_SECS", RETRY_MAX_BACKOFF_SECS)?,
            max_attempts: parse_env("MAX_ATTEMPTS", MAX_ATTEMPTS)?,
            lease_sweep_interval_secs: parse_env(
                "LEASE_SWEEP_INTERVAL_SECS",
                LEASE_SWEEP_INTERVAL_SECS,
            )?,
            worker_heartbeat_interval_secs,
            worker_grace_secs: parse_env("WORKER_GRACE_SECS", default_grace)?,
            worker_prune_retention_secs: parse_env(
                "WORKER_PRUNE_RETENTION_SECS",
                WORKER_PRUNE_RETENTION_SECS,
            )?,
            task_retention_days: parse_env("TASK_RETENTION_DAYS", TASK_RETENTION_DAYS)?,
        })
    }

    /// Grace window: 3x the heartbeat interval, never below 60 s.
    pub fn default_grace(heartbeat_interval_secs: u64) -> i64 {
        (heartbeat_interval_secs as i64 * 3).max(60)
    }

    fn validate(&self) -> Result<()> {
        if self.lease_duration_secs <= 0 {
            anyhow::bail!("LEASE_DURATION_SECS must be positive");
        }
        if self.max_attempts < 1 {
            anyhow::bail!("MAX_ATTEMPTS must be at least 1");
        }
        if self.retry_base_backoff_secs <= 0 || self.retry_max_backoff_secs <= 0 {
            anyhow::bail!("retry backoff settings must be positive");
        }
        if self.retry_max_backoff_secs < self.retry_base_backoff_secs {
            anyhow::bail!("RETRY_MAX_BACKOFF_SECS must not be below RETRY_BASE_BACKOFF_SECS");
        }
        Ok(())
    }
}

/// API-tier configuration.
#[derive(Clone, Debug)]
pub struct Config {
    pub base: BaseConfig,
    pub database_url: String,
    pub queue: QueueConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            base: BaseConfig::from_env()?,
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            queue: QueueConfig::from_env()?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.queue.validate()
    }

    /// Check if the application is running in production mode
    pub fn is_production(&self) -> bool {
        let env = self.base.environment.to_lowercase();
        env == "production" || env == "prod"
    }
}

/// Worker-process configuration. The worker talks to the API over HTTP and to
/// the GPU processor through `processor_url`.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub api_url: String,
    pub api_key: Option<String>,
    /// Stable identity; defaults to `<hostname>-<pid>`.
    pub worker_id: String,
    /// `cpu` or `gpu`.
    pub worker_kind: String,
    pub capabilities: Vec<String>,
    pub max_concurrent_tasks: usize,
    pub claim_poll_min_secs: u64,
    pub claim_poll_max_secs: u64,
    pub heartbeat_interval_secs: u64,
    /// Cadence of progress reports while the analyser runs; each report also
    /// renews the lease.
    pub progress_interval_secs: u64,
    /// GPU analyser endpoint.
    pub processor_url: String,
    /// Per-analysis HTTP timeout against the processor.
    pub processor_timeout_secs: u64,
    /// How long shutdown waits for in-flight tasks before releasing leases.
    pub shutdown_grace_secs: u64,
}

impl WorkerConfig {
    pub fn from_env(default_worker_id: String) -> Result<Self> {
        dotenvy::dotenv().ok();

        let capabilities = env_or("WORKER_CAPABILITIES", "")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let config = Self {
            api_url: env_or("DECKFLOW_API_URL", "http://localhost:8000"),
            api_key: env::var("DECKFLOW_API_KEY").ok(),
            worker_id: env_or("WORKER_ID", &default_worker_id),
            worker_kind: env_or("WORKER_KIND", "gpu"),
            capabilities,
            max_concurrent_tasks: parse_env("MAX_CONCURRENT_TASKS", 1)?,
            claim_poll_min_secs: parse_env("CLAIM_POLL_MIN_SECS", 2)?,
            claim_poll_max_secs: parse_env("CLAIM_POLL_MAX_SECS", 5)?,
            heartbeat_interval_secs: parse_env(
                "HEARTBEAT_INTERVAL_SECS",
                HEARTBEAT_INTERVAL_SECS,
            )?,
            progress_interval_secs: parse_env("PROGRESS_INTERVAL_SECS", 30)?,
            processor_url: env::var("PROCESSOR_URL").context("PROCESSOR_URL must be set")?,
            processor_timeout_secs: parse_env("PROCESSOR_TIMEOUT_SECS", 1800)?,
            shutdown_grace_secs: parse_env("SHUTDOWN_GRACE_SECS", 30)?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.worker_id.trim().is_empty() {
            anyhow::bail!("WORKER_ID must not be empty");
        }
        if self.max_concurrent_tasks == 0 {
            anyhow::bail!("MAX_CONCURRENT_TASKS must be at least 1");
        }
        if self.claim_poll_min_secs > self.claim_poll_max_secs {
            anyhow::bail!("CLAIM_POLL_MIN_SECS must not exceed CLAIM_POLL_MAX_SECS");
        }
        Ok(())
    }
}
