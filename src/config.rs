//! Configuration types.
//!
//! Every value has a default and can be overridden from the environment.
//! Unparseable values fall back to the default with a warning.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Server-side job service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// HTTP listen port.
    pub port: u16,
    /// libSQL database path. `None` keeps jobs in memory only.
    pub db_path: Option<PathBuf>,
    /// Maximum number of pending + processing jobs.
    pub max_active_jobs: usize,
    /// Upper bound on a single provider call (`None` = unbounded).
    pub provider_timeout: Option<Duration>,
    /// Terminal jobs older than this are evicted.
    pub job_ttl: Duration,
    /// How often the eviction sweep runs.
    pub eviction_interval: Duration,
    /// How often a worker re-reads the cancel flag from the store.
    pub cancel_check_interval: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            db_path: None,
            max_active_jobs: 32,
            provider_timeout: Some(Duration::from_secs(600)), // 10 minutes
            job_ttl: Duration::from_secs(86_400),             // 1 day
            eviction_interval: Duration::from_secs(300),
            cancel_check_interval: Duration::from_millis(500),
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let timeout_secs: u64 = env_or(
            "GENJOB_PROVIDER_TIMEOUT_SECS",
            defaults.provider_timeout.map(|d| d.as_secs()).unwrap_or(0),
        );
        Self {
            port: env_or("GENJOB_PORT", defaults.port),
            db_path: std::env::var("GENJOB_DB_PATH")
                .ok()
                .filter(|p| !p.is_empty())
                .map(PathBuf::from),
            max_active_jobs: env_or("GENJOB_MAX_ACTIVE_JOBS", defaults.max_active_jobs),
            provider_timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
            job_ttl: Duration::from_secs(env_or(
                "GENJOB_JOB_TTL_SECS",
                defaults.job_ttl.as_secs(),
            )),
            eviction_interval: Duration::from_secs(env_or(
                "GENJOB_EVICTION_INTERVAL_SECS",
                defaults.eviction_interval.as_secs(),
            ))
            .max(Duration::from_secs(1)),
            cancel_check_interval: Duration::from_millis(env_or(
                "GENJOB_CANCEL_CHECK_MS",
                defaults.cancel_check_interval.as_millis() as u64,
            ))
            .max(Duration::from_millis(10)),
        }
    }
}

/// Client-side polling configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the job service.
    pub server_url: String,
    /// Delay between status polls.
    pub poll_interval: Duration,
    /// Handles older than this (since their last reset) are discarded.
    pub staleness_window: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".to_string(),
            poll_interval: Duration::from_millis(2000),
            staleness_window: Duration::from_secs(3600), // 1 hour
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            server_url: std::env::var("GENJOB_SERVER_URL").unwrap_or(defaults.server_url),
            poll_interval: Duration::from_millis(env_or(
                "GENJOB_POLL_INTERVAL_MS",
                defaults.poll_interval.as_millis() as u64,
            ))
            .max(Duration::from_millis(10)),
            staleness_window: Duration::from_secs(env_or(
                "GENJOB_STALENESS_SECS",
                defaults.staleness_window.as_secs(),
            )),
        }
    }
}

fn env_or<T: FromStr + Copy>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => parse_or(key, &raw, default),
        Err(_) => default,
    }
}

fn parse_or<T: FromStr + Copy>(key: &str, raw: &str, default: T) -> T {
    raw.trim().parse().unwrap_or_else(|_| {
        tracing::warn!(key, value = raw, "Ignoring invalid configuration value");
        default
    })
}
