//! Environment-driven settings. Every knob has a default; unparsable values fall back to it.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

pub const DEFAULT_FIELD_MANAGER: &str = "pilot";

/// Read `key` from the environment, falling back to `default` when unset or invalid.
pub fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                warn!(key, value = %raw, "ignoring unparsable environment value");
                default
            }
        },
        Err(_) => default,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// `tracing_subscriber::EnvFilter` directive (`PILOT_LOG`).
    pub log_filter: String,
    /// Prometheus listener (`PILOT_METRICS_ADDR`), disabled when unset.
    pub metrics_addr: Option<SocketAddr>,
    /// Server-side apply field manager (`PILOT_FIELD_MANAGER`).
    pub field_manager: String,
    /// Upper bound on one apply payload (`PILOT_MAX_YAML_BYTES`).
    pub max_manifest_bytes: usize,
    /// Upper bound on JSON nodes per document (`PILOT_MAX_YAML_NODES`).
    pub max_manifest_nodes: usize,
    /// Default readiness poll cadence (`PILOT_WAIT_INTERVAL_MS`).
    pub poll_interval: Duration,
    /// Default readiness deadline (`PILOT_WAIT_TIMEOUT_SECS`).
    pub wait_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_filter: "info".to_string(),
            metrics_addr: None,
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
            max_manifest_bytes: 1_000_000, // 1 MiB
            max_manifest_nodes: 100_000,
            poll_interval: Duration::from_secs(2),
            wait_timeout: Duration::from_secs(300),
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let d = Settings::default();
        let metrics_addr = std::env::var("PILOT_METRICS_ADDR").ok().and_then(|addr| match addr.parse() {
            Ok(sock) => Some(sock),
            Err(_) => {
                warn!(addr = %addr, "invalid PILOT_METRICS_ADDR; expected host:port");
                None
            }
        });
        let field_manager = std::env::var("PILOT_FIELD_MANAGER")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(d.field_manager);
        Self {
            log_filter: std::env::var("PILOT_LOG").unwrap_or(d.log_filter),
            metrics_addr,
            field_manager,
            max_manifest_bytes: env_or("PILOT_MAX_YAML_BYTES", d.max_manifest_bytes),
            max_manifest_nodes: env_or("PILOT_MAX_YAML_NODES", d.max_manifest_nodes),
            poll_interval: Duration::from_millis(env_or("PILOT_WAIT_INTERVAL_MS", d.poll_interval.as_millis() as u64).max(1)),
            wait_timeout: Duration::from_secs(env_or("PILOT_WAIT_TIMEOUT_SECS", d.wait_timeout.as_secs())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_or_falls_back_on_garbage() {
        std::env::set_var("PILOT_TEST_ENV_OR_NUM", "12");
        std::env::set_var("PILOT_TEST_ENV_OR_BAD", "twelve");
        assert_eq!(env_or("PILOT_TEST_ENV_OR_NUM", 1usize), 12);
        assert_eq!(env_or("PILOT_TEST_ENV_OR_BAD", 1usize), 1);
        assert_eq!(env_or("PILOT_TEST_ENV_OR_UNSET", 7u64), 7);
    }

    #[test]
    fn defaults_are_sane() {
        let s = Settings::default();
        assert_eq!(s.field_manager, "pilot");
        assert!(s.wait_timeout >= s.poll_interval);
        assert!(s.metrics_addr.is_none());
    }
}
