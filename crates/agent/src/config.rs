//! Agent configuration.
//!
//! All settings come from `TALOS_AUTO_BOOTSTRAP_*` environment variables;
//! the agent takes no command-line arguments. Duration values accept
//! humantime suffixes (e.g. `TALOS_AUTO_BOOTSTRAP_SCAN_INTERVAL=30s`,
//! `TALOS_AUTO_BOOTSTRAP_MAX_BACKOFF=2m`).

use std::{collections::HashMap, time::Duration};

use serde::Deserialize;

/// Runtime configuration for the auto-bootstrap agent.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Time between network discovery scans while quorum is not reached.
    #[serde(default = "default_scan_interval", with = "humantime_serde")]
    pub scan_interval: Duration,

    /// How often followers re-check whether the leader has bootstrapped.
    #[serde(default = "default_follower_check_interval", with = "humantime_serde")]
    pub follower_check_interval: Duration,

    /// Number of control plane nodes (including this one) required before
    /// the election proceeds.
    #[serde(default = "default_quorum_nodes")]
    pub quorum_nodes: usize,

    /// Grace period before the elected leader executes bootstrap, closing
    /// the window where another node observed a different peer set.
    #[serde(default = "default_pre_bootstrap_delay", with = "humantime_serde")]
    pub pre_bootstrap_delay: Duration,

    /// Upper bound for the exponential retry backoff.
    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,

    /// Per-host probe timeout during discovery scans.
    #[serde(default = "default_scan_timeout", with = "humantime_serde")]
    pub scan_timeout: Duration,

    /// Maximum number of in-flight probes during a scan.
    #[serde(default = "default_scan_concurrency")]
    pub scan_concurrency: usize,
}

fn default_scan_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_follower_check_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_quorum_nodes() -> usize {
    1
}

fn default_pre_bootstrap_delay() -> Duration {
    Duration::from_secs(10)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(120)
}

fn default_scan_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_scan_concurrency() -> usize {
    50
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scan_interval: default_scan_interval(),
            follower_check_interval: default_follower_check_interval(),
            quorum_nodes: default_quorum_nodes(),
            pre_bootstrap_delay: default_pre_bootstrap_delay(),
            max_backoff: default_max_backoff(),
            scan_timeout: default_scan_timeout(),
            scan_concurrency: default_scan_concurrency(),
        }
    }
}

impl Config {
    /// Load configuration from `TALOS_AUTO_BOOTSTRAP_*` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_env_source(None)
    }

    /// Build configuration from an explicit variable map instead of the
    /// process environment. Used by tests; `load` passes `None`.
    fn from_env_source(source: Option<HashMap<String, String>>) -> Result<Self, ConfigError> {
        let env = config::Environment::with_prefix("TALOS_AUTO_BOOTSTRAP").source(source);

        let settings = config::Config::builder()
            .add_source(env)
            .build()
            .map_err(|e| ConfigError::Load(e.to_string()))?;

        settings.try_deserialize().map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the environment source.
    Load(String),
    /// Failed to parse a configuration value.
    Parse(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Load(msg) => write!(f, "failed to load config: {}", msg),
            ConfigError::Parse(msg) => write!(f, "failed to parse config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.scan_interval, Duration::from_secs(30));
        assert_eq!(config.follower_check_interval, Duration::from_secs(15));
        assert_eq!(config.quorum_nodes, 1);
        assert_eq!(config.pre_bootstrap_delay, Duration::from_secs(10));
        assert_eq!(config.max_backoff, Duration::from_secs(120));
        assert_eq!(config.scan_timeout, Duration::from_secs(2));
        assert_eq!(config.scan_concurrency, 50);
    }

    #[test]
    fn test_empty_environment_yields_defaults() {
        let config = Config::from_env_source(Some(HashMap::new())).expect("load defaults");
        assert_eq!(config.quorum_nodes, 1);
        assert_eq!(config.scan_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_env_overrides_with_humantime_suffixes() {
        let vars = HashMap::from([
            ("TALOS_AUTO_BOOTSTRAP_SCAN_INTERVAL".to_string(), "45s".to_string()),
            ("TALOS_AUTO_BOOTSTRAP_MAX_BACKOFF".to_string(), "3m".to_string()),
            ("TALOS_AUTO_BOOTSTRAP_QUORUM_NODES".to_string(), "3".to_string()),
            ("TALOS_AUTO_BOOTSTRAP_SCAN_CONCURRENCY".to_string(), "10".to_string()),
        ]);

        let config = Config::from_env_source(Some(vars)).expect("load overrides");
        assert_eq!(config.scan_interval, Duration::from_secs(45));
        assert_eq!(config.max_backoff, Duration::from_secs(180));
        assert_eq!(config.quorum_nodes, 3);
        assert_eq!(config.scan_concurrency, 10);
        // Unset values keep their defaults
        assert_eq!(config.pre_bootstrap_delay, Duration::from_secs(10));
    }

    #[test]
    fn test_invalid_duration_rejected() {
        let vars = HashMap::from([(
            "TALOS_AUTO_BOOTSTRAP_SCAN_TIMEOUT".to_string(),
            "not-a-duration".to_string(),
        )]);

        let result = Config::from_env_source(Some(vars));
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
