//! Configuration management for Turnstile.
//!
//! Settings come from an optional YAML (or TOML/JSON) file, overridden by
//! `TURNSTILE_*` environment variables. Nested keys use a double underscore,
//! e.g. `TURNSTILE_REDIS__URL=redis://cache:6379/`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, TurnstileError};

/// Environment variable prefix for settings overrides.
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateConfig {
    /// Path to the rate limit rules file
    #[serde(default = "default_rules_path")]
    pub rules_path: PathBuf,

    /// Optional prefix for every counter key, to share a Redis between deployments
    #[serde(default)]
    pub key_namespace: Option<String>,

    /// Counting store configuration
    #[serde(default)]
    pub redis: RedisConfig,

    /// Rules hot-reload configuration
    #[serde(default)]
    pub reload: ReloadConfig,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            rules_path: default_rules_path(),
            key_namespace: None,
            redis: RedisConfig::default(),
            reload: ReloadConfig::default(),
            log: LogConfig::default(),
        }
    }
}

fn default_rules_path() -> PathBuf {
    PathBuf::from("config.yaml")
}

/// Redis connection configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Upper bound on a single counter operation, in milliseconds
    #[serde(default = "default_redis_timeout")]
    pub timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            timeout_ms: default_redis_timeout(),
        }
    }
}

impl RedisConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

fn default_redis_timeout() -> u64 {
    250
}

/// Rules hot-reload configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReloadConfig {
    /// Watch the rules file and reload it on change
    #[serde(default = "default_reload_enabled")]
    pub enabled: bool,

    /// How long to let a burst of file events settle before reloading, in milliseconds
    #[serde(default = "default_debounce")]
    pub debounce_ms: u64,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            enabled: default_reload_enabled(),
            debounce_ms: default_debounce(),
        }
    }
}

impl ReloadConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

fn default_reload_enabled() -> bool {
    true
}

fn default_debounce() -> u64 {
    100
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable text
    #[serde(default)]
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl GateConfig {
    /// Load configuration from an optional settings file plus the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_from(path, None)
    }

    /// Layer `env` over the settings file. `None` reads the process environment.
    fn load_from(path: Option<&Path>, env: Option<config::Map<String, String>>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| TurnstileError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn env(vars: &[(&str, &str)]) -> Option<config::Map<String, String>> {
        Some(
            vars.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_defaults() {
        let config = GateConfig::default();
        assert_eq!(config.rules_path, PathBuf::from("config.yaml"));
        assert_eq!(config.redis.url, "redis://127.0.0.1:6379/");
        assert_eq!(config.redis.timeout(), Duration::from_millis(250));
        assert!(config.reload.enabled);
        assert_eq!(config.reload.debounce(), Duration::from_millis(100));
        assert_eq!(config.log.level, "info");
        assert!(config.key_namespace.is_none());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "rules_path: /etc/turnstile/rules.yaml\nredis:\n  url: redis://cache:6379/\nkey_namespace: eu"
        )
        .unwrap();

        let config = GateConfig::load_from(Some(file.path()), env(&[])).unwrap();
        assert_eq!(config.rules_path, PathBuf::from("/etc/turnstile/rules.yaml"));
        assert_eq!(config.redis.url, "redis://cache:6379/");
        assert_eq!(config.redis.timeout_ms, 250);
        assert_eq!(config.key_namespace.as_deref(), Some("eu"));
    }

    #[test]
    fn test_load_layers_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "reload:\n  enabled: false\n  debounce_ms: 500\nlog:\n  json: true").unwrap();

        let config = GateConfig::load_from(Some(file.path()), env(&[])).unwrap();
        assert!(!config.reload.enabled);
        assert_eq!(config.reload.debounce_ms, 500);
        assert!(config.log.json);
        assert_eq!(config.redis, RedisConfig::default());
    }

    #[test]
    fn test_no_file_and_no_env_gives_defaults() {
        let config = GateConfig::load_from(None, env(&[])).unwrap();
        assert_eq!(config, GateConfig::default());
    }

    #[test]
    fn test_env_overrides_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "redis:\n  url: redis://file:6379/\n  timeout_ms: 100").unwrap();

        let config = GateConfig::load_from(
            Some(file.path()),
            env(&[
                ("TURNSTILE_REDIS__URL", "redis://cache:6379/"),
                ("TURNSTILE_RELOAD__ENABLED", "false"),
                ("TURNSTILE_RULES_PATH", "/etc/turnstile/rules.yaml"),
                ("TURNSTILE_KEY_NAMESPACE", "eu"),
                ("TURNSTILEX_LOG__LEVEL", "trace"),
                ("PATH", "/usr/bin"),
            ]),
        )
        .unwrap();

        assert_eq!(config.redis.url, "redis://cache:6379/");
        assert_eq!(config.redis.timeout_ms, 100);
        assert!(!config.reload.enabled);
        assert_eq!(config.rules_path, PathBuf::from("/etc/turnstile/rules.yaml"));
        assert_eq!(config.key_namespace.as_deref(), Some("eu"));
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_load_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = GateConfig::load(Some(dir.path().join("missing.yaml").as_path())).unwrap_err();
        assert!(matches!(err, TurnstileError::Config(_)));
    }
}
