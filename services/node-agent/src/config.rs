//! Configuration for the node agent.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

/// Node agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the coordinator's fleet listener.
    pub coordinator_url: String,

    /// Interval announced to the coordinator and used by the heartbeat loop.
    pub heartbeat_interval: Duration,

    /// Delay between polls when the coordinator gives no reconnect advice.
    pub poll_interval: Duration,

    /// Upload chunk size for object pushes.
    pub chunk_bytes: usize,

    /// Per-request timeout.
    pub request_timeout: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            coordinator_url: "http://127.0.0.1:9092".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            poll_interval: Duration::from_secs(3),
            chunk_bytes: 1024 * 1024,
            request_timeout: Duration::from_secs(30),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let coordinator_url = std::env::var("FLEET_COORDINATOR_URL")
            .unwrap_or(defaults.coordinator_url)
            .trim_end_matches('/')
            .to_string();

        let heartbeat_interval = env_secs(
            "FLEET_NODE_HEARTBEAT_INTERVAL_SECS",
            defaults.heartbeat_interval,
        )?;
        let poll_interval = env_secs("FLEET_NODE_POLL_INTERVAL_SECS", defaults.poll_interval)?;
        let chunk_bytes = env_or("FLEET_NODE_CHUNK_BYTES", defaults.chunk_bytes)?;
        let log_level = std::env::var("FLEET_LOG_LEVEL").unwrap_or(defaults.log_level);

        if heartbeat_interval.is_zero() {
            anyhow::bail!("FLEET_NODE_HEARTBEAT_INTERVAL_SECS must be positive");
        }
        if chunk_bytes == 0 {
            anyhow::bail!("FLEET_NODE_CHUNK_BYTES must be positive");
        }

        Ok(Self {
            coordinator_url,
            heartbeat_interval,
            poll_interval,
            chunk_bytes,
            request_timeout: defaults.request_timeout,
            log_level,
        })
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        Err(_) => Ok(default),
    }
}

fn env_secs(key: &str, default: Duration) -> Result<Duration> {
    let secs: f64 = env_or(key, default.as_secs_f64())?;
    Duration::try_from_secs_f64(secs).with_context(|| format!("invalid duration for {key}: {secs}"))
}
