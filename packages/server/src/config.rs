use std::collections::HashMap;
use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// NATS endpoint for the cross-replica stream bus. When unset the
    /// process falls back to an in-process bus (single-replica mode).
    pub nats_url: Option<String>,
    pub port: u16,
    pub jobs: JobsConfig,
    pub sse: SseConfig,
}

/// Tuning knobs for the job dispatcher, store and retry schedule.
#[derive(Debug, Clone)]
pub struct JobsConfig {
    /// Max in-flight jobs per worker replica.
    pub worker_pool_size: usize,
    /// Idle sleep between claim attempts (jittered).
    pub poll_interval: Duration,
    /// Period for lease heartbeat updates on running jobs.
    pub heartbeat_interval: Duration,
    /// A running row silent for this long is reaped.
    pub lease_timeout: Duration,
    /// Hard wall-clock budget per handler invocation.
    pub job_max_runtime: Duration,
    /// Default retry cap applied at enqueue time.
    pub max_attempts_default: i32,
    /// Retry schedule bounds.
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Whether a restarted job starts over with a fresh attempts budget
    /// instead of copying the original's cap.
    pub restart_resets_attempts: bool,
    /// Per-type concurrency caps; types absent here default to the pool size.
    pub type_concurrency: HashMap<String, usize>,
}

/// Tuning knobs for the SSE hub and edge.
#[derive(Debug, Clone)]
pub struct SseConfig {
    /// Per-user replay buffer depth.
    pub ring_size: usize,
    /// Keep-alive period for connected clients.
    pub heartbeat: Duration,
    /// Per-client queue depth before the client is considered too slow
    /// and dropped. Must hold a full ring replay.
    pub client_buffer: usize,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 8,
            poll_interval: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(10),
            lease_timeout: Duration::from_secs(60),
            job_max_runtime: Duration::from_secs(24 * 60 * 60),
            max_attempts_default: 3,
            backoff_base: Duration::from_secs(2),
            backoff_cap: Duration::from_secs(10 * 60),
            restart_resets_attempts: false,
            type_concurrency: HashMap::new(),
        }
    }
}

impl Default for SseConfig {
    fn default() -> Self {
        Self {
            ring_size: 256,
            heartbeat: Duration::from_secs(15),
            client_buffer: 512,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            nats_url: env::var("NATS_URL").ok(),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("PORT must be a valid number")?,
            jobs: JobsConfig::from_env()?,
            sse: SseConfig::from_env()?,
        })
    }
}

impl JobsConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let mut config = Self {
            worker_pool_size: env_usize("WORKER_POOL_SIZE", defaults.worker_pool_size)?,
            poll_interval: env_secs("JOB_POLL_INTERVAL_SECS", defaults.poll_interval)?,
            heartbeat_interval: env_secs("JOB_HEARTBEAT_INTERVAL_SECS", defaults.heartbeat_interval)?,
            lease_timeout: env_secs("JOB_LEASE_TIMEOUT_SECS", defaults.lease_timeout)?,
            job_max_runtime: env_secs("JOB_MAX_RUNTIME_SECS", defaults.job_max_runtime)?,
            max_attempts_default: env_usize("JOB_MAX_ATTEMPTS", defaults.max_attempts_default as usize)?
                as i32,
            backoff_base: env_secs("JOB_BACKOFF_BASE_SECS", defaults.backoff_base)?,
            backoff_cap: env_secs("JOB_BACKOFF_CAP_SECS", defaults.backoff_cap)?,
            restart_resets_attempts: env::var("JOB_RESTART_RESETS_ATTEMPTS")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.restart_resets_attempts),
            type_concurrency: parse_type_concurrency(
                &env::var("JOB_TYPE_CONCURRENCY").unwrap_or_default(),
            )?,
        };

        // The heartbeat must fire several times within one lease window or
        // healthy workers get reaped.
        let max_heartbeat = config.lease_timeout / 3;
        if config.heartbeat_interval > max_heartbeat {
            tracing::warn!(
                configured_secs = config.heartbeat_interval.as_secs(),
                clamped_secs = max_heartbeat.as_secs(),
                "JOB_HEARTBEAT_INTERVAL_SECS exceeds a third of the lease timeout; clamping"
            );
            config.heartbeat_interval = max_heartbeat;
        }

        Ok(config)
    }
}

impl SseConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            ring_size: env_usize("SSE_RING_SIZE", defaults.ring_size)?,
            heartbeat: env_secs("SSE_HEARTBEAT_SECS", defaults.heartbeat)?,
            client_buffer: env_usize("SSE_CLIENT_BUFFER", defaults.client_buffer)?,
        })
    }
}

/// Parse `type=cap,type=cap` pairs, e.g. `course_build=2,media_transcode=4`.
fn parse_type_concurrency(raw: &str) -> Result<HashMap<String, usize>> {
    let mut caps = HashMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (job_type, cap) = pair
            .split_once('=')
            .with_context(|| format!("JOB_TYPE_CONCURRENCY entry '{pair}' must be type=cap"))?;
        let cap: usize = cap
            .trim()
            .parse()
            .with_context(|| format!("JOB_TYPE_CONCURRENCY cap in '{pair}' must be a number"))?;
        caps.insert(job_type.trim().to_string(), cap);
    }
    Ok(caps)
}

fn env_usize(key: &str, default: usize) -> Result<usize> {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{key} must be a valid number")),
        Err(_) => Ok(default),
    }
}

fn env_secs(key: &str, default: Duration) -> Result<Duration> {
    match env::var(key) {
        Ok(raw) => {
            let secs: u64 = raw
                .parse()
                .with_context(|| format!("{key} must be a number of seconds"))?;
            Ok(Duration::from_secs(secs))
        }
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_concurrency_parses_pairs() {
        let caps = parse_type_concurrency("course_build=2, media_transcode=4").unwrap();
        assert_eq!(caps.get("course_build"), Some(&2));
        assert_eq!(caps.get("media_transcode"), Some(&4));
    }

    #[test]
    fn type_concurrency_empty_is_empty() {
        assert!(parse_type_concurrency("").unwrap().is_empty());
    }

    #[test]
    fn type_concurrency_rejects_garbage() {
        assert!(parse_type_concurrency("no_equals_sign").is_err());
        assert!(parse_type_concurrency("t=abc").is_err());
    }

    #[test]
    fn jobs_defaults_are_sane() {
        let config = JobsConfig::default();
        assert!(config.heartbeat_interval <= config.lease_timeout / 3);
        assert!(config.backoff_base < config.backoff_cap);
        assert_eq!(config.max_attempts_default, 3);
    }

    #[test]
    fn sse_defaults_hold_a_full_replay() {
        let config = SseConfig::default();
        assert!(config.client_buffer >= config.ring_size);
    }
}
