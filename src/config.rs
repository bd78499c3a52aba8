//! Configuration for the persistence engine.
//!
//! Layered the usual way:
//!
//! 1. **Compiled defaults**
//! 2. **User config file** - `~/.config/tweetstore/config.toml`
//! 3. **Environment variables** - `TWEETSTORE_*` prefix
//!
//! # Example Configuration File
//!
//! ```toml
//! [paths]
//! db = "~/.local/share/tweetstore/tweetstore.sqlite3"
//!
//! [store]
//! busy_initial_delay_ms = 25
//! busy_max_retries = 20
//! busy_max_delay_ms = 10000
//! threading = "auto"
//! wal = true
//!
//! [worker]
//! thread_name = "tweetstore-db"
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// File locations.
    pub paths: PathsConfig,
    /// Store connection behaviour.
    pub store: StoreConfig,
    /// Background worker settings.
    pub worker: WorkerConfig,
}

/// Path configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Path to the store file.
    /// Environment variable: `TWEETSTORE_DB`
    pub db: Option<PathBuf>,
}

/// How store commands are executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadingMode {
    /// Use the background worker if the store library is thread-safe.
    #[default]
    Auto,
    /// Always execute on the calling thread.
    Synchronous,
}

impl std::str::FromStr for ThreadingMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" | "threaded" => Ok(Self::Auto),
            "sync" | "synchronous" => Ok(Self::Synchronous),
            _ => Err(format!("Invalid threading mode: {s}")),
        }
    }
}

/// Connection behaviour shared by both store connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// First backoff sleep after a busy store, doubled per retry.
    pub busy_initial_delay_ms: u64,
    /// Retries before a busy statement is abandoned.
    /// Environment variable: `TWEETSTORE_BUSY_RETRIES`
    pub busy_max_retries: u32,
    /// Upper bound on a single backoff sleep.
    pub busy_max_delay_ms: u64,
    /// Environment variable: `TWEETSTORE_THREADING`
    pub threading: ThreadingMode,
    /// Use write-ahead logging.
    pub wal: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            busy_initial_delay_ms: 25,
            busy_max_retries: 20,
            busy_max_delay_ms: 10_000,
            threading: ThreadingMode::Auto,
            wal: true,
        }
    }
}

impl StoreConfig {
    /// The retry policy described by this config.
    #[must_use]
    pub const fn busy_policy(&self) -> BusyPolicy {
        BusyPolicy {
            initial: Duration::from_millis(self.busy_initial_delay_ms),
            max_retries: self.busy_max_retries,
            max_delay: Duration::from_millis(self.busy_max_delay_ms),
        }
    }
}

/// Background worker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Name given to the worker thread.
    pub thread_name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            thread_name: "tweetstore-db".to_string(),
        }
    }
}

/// Exponential backoff for a busy or locked store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusyPolicy {
    pub initial: Duration,
    pub max_retries: u32,
    pub max_delay: Duration,
}

impl Default for BusyPolicy {
    fn default() -> Self {
        StoreConfig::default().busy_policy()
    }
}

impl BusyPolicy {
    /// Sleep before retry number `retry` (zero based), or `None` once the
    /// budget is spent.
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Option<Duration> {
        if retry >= self.max_retries {
            return None;
        }
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        Some(
            self.initial
                .checked_mul(factor)
                .map_or(self.max_delay, |d| d.min(self.max_delay)),
        )
    }
}

impl Config {
    /// Load configuration from all sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(user_config) = Self::load_user_config() {
            config.merge(user_config);
        }

        config.apply_env_overrides();

        debug!("Configuration loaded: {:?}", config);
        config
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from_file(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            debug!("Config file not found: {}", path.display());
            return Ok(None);
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| StoreError::path_error("read config", path, e))?;
        let config = toml::from_str(&content).map_err(|e| StoreError::ConfigError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        info!("Loaded config from: {}", path.display());
        Ok(Some(config))
    }

    fn load_user_config() -> Option<Self> {
        let path = Self::user_config_path()?;
        match Self::load_from_file(&path) {
            Ok(config) => config,
            Err(e) => {
                warn!("Ignoring config file: {e}");
                None
            }
        }
    }

    /// Get the path to the user configuration file.
    #[must_use]
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("tweetstore").join("config.toml"))
    }

    /// Apply `TWEETSTORE_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(db) = std::env::var("TWEETSTORE_DB") {
            self.paths.db = Some(PathBuf::from(db));
        }
        if let Ok(mode) = std::env::var("TWEETSTORE_THREADING") {
            match mode.parse() {
                Ok(mode) => self.store.threading = mode,
                Err(e) => warn!("{e}"),
            }
        }
        if let Ok(retries) = std::env::var("TWEETSTORE_BUSY_RETRIES") {
            if let Ok(n) = retries.parse() {
                self.store.busy_max_retries = n;
            }
        }
    }

    /// Merge another config into this one (other takes precedence).
    fn merge(&mut self, other: Self) {
        if other.paths.db.is_some() {
            self.paths.db = other.paths.db;
        }
        self.store = other.store;
        self.worker = other.worker;
    }

    /// Get the store path, using the default location if not configured.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.paths.db.clone().unwrap_or_else(default_db_path)
    }

    /// Config for a store at `path` with everything else defaulted.
    #[must_use]
    pub fn for_path(path: impl Into<PathBuf>) -> Self {
        Self {
            paths: PathsConfig {
                db: Some(path.into()),
            },
            ..Self::default()
        }
    }

    /// Save the current configuration to the user config file.
    ///
    /// # Errors
    ///
    /// Returns an error if the config directory cannot be determined or the
    /// file cannot be written.
    pub fn save(&self) -> Result<()> {
        let config_path = Self::user_config_path().ok_or_else(|| {
            StoreError::IoError(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "Could not determine config directory",
            ))
        })?;

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::path_error("create", parent, e))?;
        }

        let content = toml::to_string_pretty(self).map_err(|e| StoreError::ConfigError {
            path: config_path.clone(),
            reason: e.to_string(),
        })?;

        std::fs::write(&config_path, content)
            .map_err(|e| StoreError::path_error("write", &config_path, e))?;
        info!("Saved config to: {}", config_path.display());
        Ok(())
    }

    /// Generate a default configuration file content.
    #[must_use]
    pub fn default_config_content() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

/// Default store location under the platform data directory.
#[must_use]
pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tweetstore")
        .join("tweetstore.sqlite3")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.store.busy_initial_delay_ms, 25);
        assert_eq!(config.store.busy_max_retries, 20);
        assert_eq!(config.store.threading, ThreadingMode::Auto);
        assert_eq!(config.worker.thread_name, "tweetstore-db");
    }

    #[test]
    fn test_config_serialization() {
        let mut config = Config::default();
        config.store.threading = ThreadingMode::Synchronous;
        let toml = toml::to_string(&config).unwrap();
        assert!(toml.contains("threading = \"synchronous\""));
        let parsed: Config = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.store.threading, ThreadingMode::Synchronous);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let parsed: Config = toml::from_str("[store]\nbusy_max_retries = 3\n").unwrap();
        assert_eq!(parsed.store.busy_max_retries, 3);
        assert_eq!(parsed.store.busy_initial_delay_ms, 25);
        assert!(parsed.paths.db.is_none());
    }

    #[test]
    fn test_config_merge() {
        let mut base = Config::default();
        let mut other = Config::default();
        other.paths.db = Some(PathBuf::from("/custom/store.db"));
        other.store.wal = false;

        base.merge(other);

        assert_eq!(base.paths.db, Some(PathBuf::from("/custom/store.db")));
        assert!(!base.store.wal);
    }

    #[test]
    fn test_load_from_missing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(Config::load_from_file(&dir.path().join("nope.toml")).unwrap().is_none());
    }

    #[test]
    fn test_load_from_invalid_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[store\n").unwrap();
        assert!(matches!(
            Config::load_from_file(&path),
            Err(StoreError::ConfigError { .. })
        ));
    }

    #[test]
    fn busy_policy_doubles_until_budget_spent() {
        let policy = BusyPolicy::default();
        assert_eq!(policy.delay_for(0), Some(Duration::from_millis(25)));
        assert_eq!(policy.delay_for(1), Some(Duration::from_millis(50)));
        assert_eq!(policy.delay_for(3), Some(Duration::from_millis(200)));
        assert_eq!(policy.delay_for(19), Some(Duration::from_secs(10)));
        assert_eq!(policy.delay_for(20), None);
    }

    #[test]
    fn busy_policy_survives_large_shifts() {
        let policy = BusyPolicy {
            initial: Duration::from_millis(25),
            max_retries: 64,
            max_delay: Duration::from_millis(100),
        };
        assert_eq!(policy.delay_for(40), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay_for(64), None);
    }

    #[test]
    fn threading_mode_from_str() {
        assert_eq!("sync".parse::<ThreadingMode>().unwrap(), ThreadingMode::Synchronous);
        assert_eq!("auto".parse::<ThreadingMode>().unwrap(), ThreadingMode::Auto);
        assert!("maybe".parse::<ThreadingMode>().is_err());
    }

    #[test]
    fn test_default_config_content() {
        let content = Config::default_config_content();
        assert!(content.contains("[store]"));
        assert!(content.contains("[worker]"));
    }
}
