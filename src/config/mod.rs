//! Typed configuration, loaded from the environment.
//!
//! Generalizes the base crate's `Settings::load()`/`Settings::default()`
//! pattern (`cli/config.rs`) from a TOML settings file to environment
//! variables, since this service is meant to run as a twelve-factor
//! process deployed alongside the broker and backend rather than read a
//! desktop config file.

use std::time::Duration;

use crate::error::ConfigError;

/// Every option from spec.md §6, with its documented default.
#[derive(Debug, Clone)]
pub struct Config {
    pub queue_key: String,
    pub status_prefix: String,
    pub channel_prefix: String,
    pub job_ttl_seconds: u64,
    pub worker_heartbeat_seconds: u64,
    pub heartbeat_stale_after_seconds: u64,
    pub watchdog_interval_seconds: u64,
    pub chunk_char_limit: usize,
    pub bot_request_timeout_seconds: u64,
    pub completion_wait_timeout_seconds: u64,

    /// Not in spec.md's table directly, but required to construct a
    /// `RedisBroker`/`HttpBackendClient` at startup.
    pub redis_url: String,
    pub backend_url: String,
    pub worker_count: usize,
    pub bind_addr: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue_key: "agent:jobs".to_string(),
            status_prefix: "agent:status:".to_string(),
            channel_prefix: "agent:events:".to_string(),
            job_ttl_seconds: 6 * 60 * 60,
            worker_heartbeat_seconds: 5,
            heartbeat_stale_after_seconds: 60,
            watchdog_interval_seconds: 5,
            chunk_char_limit: 600,
            bot_request_timeout_seconds: 60,
            completion_wait_timeout_seconds: 210,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            backend_url: "http://127.0.0.1:8000".to_string(),
            worker_count: 1,
            bind_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl Config {
    /// Active-jobs set key, derived from `status_prefix` per spec.md §4.2.
    pub fn active_set_key(&self) -> String {
        format!("{}active_jobs", self.status_prefix)
    }

    pub fn status_key(&self, job_id: &str) -> String {
        format!("{}{}", self.status_prefix, job_id)
    }

    pub fn channel_key(&self, job_id: &str) -> String {
        format!("{}{}", self.channel_prefix, job_id)
    }

    pub fn job_ttl(&self) -> Duration {
        Duration::from_secs(self.job_ttl_seconds)
    }

    pub fn worker_heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.worker_heartbeat_seconds)
    }

    pub fn heartbeat_stale_after(&self) -> Duration {
        Duration::from_secs(self.heartbeat_stale_after_seconds)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_seconds)
    }

    pub fn bot_request_timeout(&self) -> Duration {
        Duration::from_secs(self.bot_request_timeout_seconds)
    }

    pub fn completion_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.completion_wait_timeout_seconds)
    }

    /// Load from environment, falling back to defaults. Call
    /// `dotenvy::dotenv()` before this in `main` to pick up a `.env` file,
    /// matching the base crate's startup sequence.
    pub fn from_env() -> Result<Config, ConfigError> {
        let mut cfg = Config::default();

        if let Ok(v) = std::env::var("QUEUE_KEY") {
            cfg.queue_key = v;
        }
        if let Ok(v) = std::env::var("STATUS_PREFIX") {
            cfg.status_prefix = v;
        }
        if let Ok(v) = std::env::var("CHANNEL_PREFIX") {
            cfg.channel_prefix = v;
        }
        cfg.job_ttl_seconds = parse_env_u64("JOB_TTL_SECONDS", cfg.job_ttl_seconds)?;
        cfg.worker_heartbeat_seconds =
            parse_env_u64("WORKER_HEARTBEAT_SECONDS", cfg.worker_heartbeat_seconds)?;
        cfg.heartbeat_stale_after_seconds = parse_env_u64(
            "HEARTBEAT_STALE_AFTER_SECONDS",
            cfg.heartbeat_stale_after_seconds,
        )?;
        cfg.watchdog_interval_seconds =
            parse_env_u64("WATCHDOG_INTERVAL_SECONDS", cfg.watchdog_interval_seconds)?;
        cfg.chunk_char_limit = parse_env_usize("CHUNK_CHAR_LIMIT", cfg.chunk_char_limit)?;
        cfg.bot_request_timeout_seconds = parse_env_u64(
            "BOT_REQUEST_TIMEOUT_SECONDS",
            cfg.bot_request_timeout_seconds,
        )?;
        cfg.completion_wait_timeout_seconds = parse_env_u64(
            "COMPLETION_WAIT_TIMEOUT_SECONDS",
            cfg.completion_wait_timeout_seconds,
        )?;
        cfg.worker_count = parse_env_usize("WORKER_COUNT", cfg.worker_count)?;

        if let Ok(v) = std::env::var("REDIS_URL") {
            cfg.redis_url = v;
        }
        if let Ok(v) = std::env::var("BACKEND_URL") {
            cfg.backend_url = v;
        }
        if let Ok(v) = std::env::var("BIND_ADDR") {
            cfg.bind_addr = v;
        }

        validate(&cfg)?;
        Ok(cfg)
    }

    /// Listing used by the `taskbridge config` introspection subcommand,
    /// mirroring the base crate's `Settings::list()`.
    pub fn list(&self) -> Vec<(&'static str, String)> {
        vec![
            ("queue_key", self.queue_key.clone()),
            ("status_prefix", self.status_prefix.clone()),
            ("channel_prefix", self.channel_prefix.clone()),
            ("job_ttl_seconds", self.job_ttl_seconds.to_string()),
            (
                "worker_heartbeat_seconds",
                self.worker_heartbeat_seconds.to_string(),
            ),
            (
                "heartbeat_stale_after_seconds",
                self.heartbeat_stale_after_seconds.to_string(),
            ),
            (
                "watchdog_interval_seconds",
                self.watchdog_interval_seconds.to_string(),
            ),
            ("chunk_char_limit", self.chunk_char_limit.to_string()),
            (
                "bot_request_timeout_seconds",
                self.bot_request_timeout_seconds.to_string(),
            ),
            (
                "completion_wait_timeout_seconds",
                self.completion_wait_timeout_seconds.to_string(),
            ),
            ("redis_url", self.redis_url.clone()),
            ("backend_url", self.backend_url.clone()),
            ("worker_count", self.worker_count.to_string()),
            ("bind_addr", self.bind_addr.clone()),
        ]
    }
}

fn parse_env_u64(key: &str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(key) {
        Ok(v) => v.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: v,
        }),
        Err(_) => Ok(default),
    }
}

fn parse_env_usize(key: &str, default: usize) -> Result<usize, ConfigError> {
    match std::env::var(key) {
        Ok(v) => v.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: v,
        }),
        Err(_) => Ok(default),
    }
}

/// Enforces spec.md §5's strict ordering: heartbeat < stale_after < TTL.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.worker_heartbeat_seconds >= cfg.heartbeat_stale_after_seconds {
        return Err(ConfigError::InvalidValue {
            key: "HEARTBEAT_STALE_AFTER_SECONDS".to_string(),
            value: cfg.heartbeat_stale_after_seconds.to_string(),
        });
    }
    if cfg.heartbeat_stale_after_seconds >= cfg.job_ttl_seconds {
        return Err(ConfigError::InvalidValue {
            key: "JOB_TTL_SECONDS".to_string(),
            value: cfg.job_ttl_seconds.to_string(),
        });
    }
    Ok(())
}
