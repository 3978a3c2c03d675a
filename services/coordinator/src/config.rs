use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

/// Process configuration, read from `FLEET_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub admin_listen_addr: SocketAddr,
    pub database_path: String,
    pub log_level: String,
    pub admin_token: Option<String>,
    pub max_request_bytes: usize,
    pub sweep_interval: Duration,
    pub fleet: FleetSettings,
}

/// Protocol limits and timeouts used by the coordinator core.
#[derive(Debug, Clone)]
pub struct FleetSettings {
    /// Deadline is `now + interval * grace_factor`.
    pub heartbeat_grace_factor: f64,
    pub min_heartbeat_interval: Duration,
    pub max_heartbeat_interval: Duration,

    pub default_message_ttl: Duration,
    pub max_message_ttl: Duration,

    pub max_pull_messages: usize,
    pub max_chunk_bytes: usize,
    pub max_tree_nodes: usize,
    pub max_tree_depth: usize,

    /// Reserved objects untouched for this long are reclaimed.
    pub reservation_timeout: Duration,
    /// Unreferenced objects are kept this long after their last reference change.
    pub unreferenced_object_grace: Duration,

    pub load_shed_threshold: usize,
    pub reconnect_backoff: Duration,
    pub not_ready_retry: Duration,
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            heartbeat_grace_factor: 2.0,
            min_heartbeat_interval: Duration::from_secs(1),
            max_heartbeat_interval: Duration::from_secs(3600),
            default_message_ttl: Duration::from_secs(3600),
            max_message_ttl: Duration::from_secs(86_400),
            max_pull_messages: 64,
            max_chunk_bytes: 4 * 1024 * 1024,
            max_tree_nodes: 4096,
            max_tree_depth: 32,
            reservation_timeout: Duration::from_secs(600),
            unreferenced_object_grace: Duration::from_secs(60),
            load_shed_threshold: 256,
            reconnect_backoff: Duration::from_secs(5),
            not_ready_retry: Duration::from_secs(1),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9092)),
            admin_listen_addr: SocketAddr::from(([127, 0, 0, 1], 9093)),
            database_path: "fleet-state.db".to_string(),
            log_level: "info".to_string(),
            admin_token: None,
            max_request_bytes: 64 * 1024 * 1024,
            sweep_interval: Duration::from_secs(5),
            fleet: FleetSettings::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let listen_addr = env_or("FLEET_LISTEN_ADDR", defaults.listen_addr)?;
        let admin_listen_addr = env_or("FLEET_ADMIN_LISTEN_ADDR", defaults.admin_listen_addr)?;

        let database_path =
            std::env::var("FLEET_DATABASE_PATH").unwrap_or(defaults.database_path);

        let log_level = std::env::var("FLEET_LOG_LEVEL").unwrap_or(defaults.log_level);

        let admin_token = std::env::var("FLEET_ADMIN_TOKEN")
            .ok()
            .filter(|token| !token.trim().is_empty());

        let max_request_bytes = env_or("FLEET_MAX_REQUEST_BYTES", defaults.max_request_bytes)?;
        let sweep_interval = env_secs("FLEET_SWEEP_INTERVAL_SECS", defaults.sweep_interval)?;

        let d = defaults.fleet;
        let fleet = FleetSettings {
            heartbeat_grace_factor: env_or(
                "FLEET_HEARTBEAT_GRACE_FACTOR",
                d.heartbeat_grace_factor,
            )?,
            min_heartbeat_interval: env_secs(
                "FLEET_MIN_HEARTBEAT_INTERVAL_SECS",
                d.min_heartbeat_interval,
            )?,
            max_heartbeat_interval: env_secs(
                "FLEET_MAX_HEARTBEAT_INTERVAL_SECS",
                d.max_heartbeat_interval,
            )?,
            default_message_ttl: env_secs("FLEET_DEFAULT_MESSAGE_TTL_SECS", d.default_message_ttl)?,
            max_message_ttl: env_secs("FLEET_MAX_MESSAGE_TTL_SECS", d.max_message_ttl)?,
            max_pull_messages: env_or("FLEET_MAX_PULL_MESSAGES", d.max_pull_messages)?,
            max_chunk_bytes: env_or("FLEET_MAX_CHUNK_BYTES", d.max_chunk_bytes)?,
            max_tree_nodes: env_or("FLEET_MAX_TREE_NODES", d.max_tree_nodes)?,
            max_tree_depth: env_or("FLEET_MAX_TREE_DEPTH", d.max_tree_depth)?,
            reservation_timeout: env_secs("FLEET_RESERVATION_TIMEOUT_SECS", d.reservation_timeout)?,
            unreferenced_object_grace: env_secs(
                "FLEET_UNREFERENCED_OBJECT_GRACE_SECS",
                d.unreferenced_object_grace,
            )?,
            load_shed_threshold: env_or("FLEET_LOAD_SHED_THRESHOLD", d.load_shed_threshold)?,
            reconnect_backoff: env_secs("FLEET_RECONNECT_BACKOFF_SECS", d.reconnect_backoff)?,
            not_ready_retry: env_secs("FLEET_NOT_READY_RETRY_SECS", d.not_ready_retry)?,
        };

        if !(fleet.heartbeat_grace_factor.is_finite() && fleet.heartbeat_grace_factor >= 1.0) {
            anyhow::bail!("FLEET_HEARTBEAT_GRACE_FACTOR must be a finite number >= 1.0");
        }
        if fleet.min_heartbeat_interval > fleet.max_heartbeat_interval {
            anyhow::bail!("heartbeat interval bounds are inverted");
        }
        if fleet.default_message_ttl > fleet.max_message_ttl {
            anyhow::bail!("FLEET_DEFAULT_MESSAGE_TTL_SECS exceeds FLEET_MAX_MESSAGE_TTL_SECS");
        }

        Ok(Self {
            listen_addr,
            admin_listen_addr,
            database_path,
            log_level,
            admin_token,
            max_request_bytes,
            sweep_interval,
            fleet,
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
    let secs = env_or(key, default.as_secs())?;
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ports() {
        let config = Config::default();
        assert_eq!(config.listen_addr.port(), 9092);
        assert_eq!(config.admin_listen_addr.port(), 9093);
        assert!(config.admin_token.is_none());
    }

    #[test]
    fn test_default_fleet_settings() {
        let settings = FleetSettings::default();
        assert_eq!(settings.heartbeat_grace_factor, 2.0);
        assert_eq!(settings.max_chunk_bytes, 4 * 1024 * 1024);
        assert!(settings.default_message_ttl <= settings.max_message_ttl);
    }

    #[test]
    fn test_env_or_rejects_garbage() {
        // Key is unique to this test so parallel tests don't race on it.
        std::env::set_var("FLEET_TEST_ENV_OR_GARBAGE", "not-a-number");
        let result: Result<u64> = env_or("FLEET_TEST_ENV_OR_GARBAGE", 3);
        std::env::remove_var("FLEET_TEST_ENV_OR_GARBAGE");
        assert!(result.is_err());
    }

    #[test]
    fn test_env_or_falls_back_to_default() {
        let value: u64 = env_or("FLEET_TEST_ENV_OR_UNSET", 7).unwrap();
        assert_eq!(value, 7);
    }
}
