//! judging-live configuration
//!
//! Loaded from an optional TOML file; every field has a compiled default so
//! a missing or partial file still starts the service.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use judging_common::config::{load_toml_or_default, ConfigOrigin};
use judging_common::time::{millis_to_duration, secs_to_duration};

/// Service configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root folder override (normally resolved by the caller)
    pub root_folder: Option<PathBuf>,
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub engine: EngineSettings,
    pub feed: FeedSettings,
    pub store: StoreSettings,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:5780".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Explicit database file; defaults to `<root>/judging.db`
    pub path: Option<PathBuf>,
}

/// Actor lifecycle and queue sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// How long an event without subscribers keeps its actors warm
    pub grace_period_secs: u64,
    /// Score inactivity required (on top of the grace period) before eviction
    pub idle_timeout_secs: u64,
    /// Reaper tick
    pub eviction_interval_secs: u64,
    /// Per-actor command queue capacity
    pub actor_mailbox: usize,
    /// Per-subscriber push queue capacity
    pub subscriber_queue: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            grace_period_secs: 120,
            idle_timeout_secs: 600,
            eviction_interval_secs: 30,
            actor_mailbox: 256,
            subscriber_queue: 16,
        }
    }
}

impl EngineSettings {
    pub fn grace_period(&self) -> Duration {
        secs_to_duration(self.grace_period_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        secs_to_duration(self.idle_timeout_secs)
    }

    pub fn eviction_interval(&self) -> Duration {
        secs_to_duration(self.eviction_interval_secs.max(1))
    }
}

/// Change feed reconnect policy (exponential backoff)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedSettings {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl FeedSettings {
    pub fn initial_backoff(&self) -> Duration {
        millis_to_duration(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        millis_to_duration(self.max_backoff_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Capacity of the store's change broadcast channel
    pub change_buffer: usize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self { change_buffer: 1024 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load from `path` (missing file: defaults) and validate
    ///
    /// The origin is returned so it can be logged after tracing is set up.
    pub fn load(path: Option<&Path>) -> Result<(Self, ConfigOrigin)> {
        let (config, origin) = load_toml_or_default::<Config>(path)?;
        config.validate()?;
        Ok((config, origin))
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.engine.actor_mailbox == 0 {
            return Err(Error::Config("engine.actor_mailbox must be > 0".to_string()));
        }
        if self.engine.subscriber_queue == 0 {
            return Err(Error::Config("engine.subscriber_queue must be > 0".to_string()));
        }
        if self.store.change_buffer == 0 {
            return Err(Error::Config("store.change_buffer must be > 0".to_string()));
        }
        if !(self.feed.backoff_multiplier >= 1.0) {
            return Err(Error::Config("feed.backoff_multiplier must be >= 1.0".to_string()));
        }
        if self.feed.initial_backoff_ms == 0 || self.feed.initial_backoff_ms > self.feed.max_backoff_ms {
            return Err(Error::Config(
                "feed.initial_backoff_ms must be in 1..=feed.max_backoff_ms".to_string(),
            ));
        }
        Ok(())
    }

    /// Database file location under the resolved root folder
    pub fn database_path(&self, root_folder: &Path) -> PathBuf {
        self.database
            .path
            .clone()
            .unwrap_or_else(|| root_folder.join("judging.db"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.bind_addr, "127.0.0.1:5780");
        assert_eq!(config.engine.grace_period(), Duration::from_secs(120));
        assert_eq!(config.feed.initial_backoff(), Duration::from_millis(500));
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [engine]
            subscriber_queue = 4

            [feed]
            max_backoff_ms = 5000
            "#,
        )
        .unwrap();

        assert_eq!(config.engine.subscriber_queue, 4);
        assert_eq!(config.engine.actor_mailbox, 256);
        assert_eq!(config.feed.max_backoff_ms, 5000);
        assert_eq!(config.feed.initial_backoff_ms, 500);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_load_reports_origin() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        let (config, origin) = Config::load(Some(&missing)).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(origin, ConfigOrigin::Defaults(Some(missing)));

        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[logging]\nlevel = \"debug\"\n").unwrap();
        let (config, origin) = Config::load(Some(&path)).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(origin, ConfigOrigin::File(path));
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[engine]\nactor_mailbox = 0\n").unwrap();
        assert!(matches!(Config::load(Some(&path)), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_queues() {
        let mut config = Config::default();
        config.engine.subscriber_queue = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_shrinking_backoff() {
        let mut config = Config::default();
        config.feed.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.feed.initial_backoff_ms = 60_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_database_path_defaults_under_root() {
        let config = Config::default();
        let path = config.database_path(Path::new("/srv/judging"));
        assert_eq!(path, PathBuf::from("/srv/judging/judging.db"));
    }
}
