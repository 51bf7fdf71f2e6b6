//! Configuration handling
//!
//! Settings live in `fleetsync.toml`. A missing file means defaults.
//!
//! ## Environment Variables
//!
//! Loaded after the file, so they win. A `.env` file next to the
//! configuration file is read first.
//!
//! - `FLEETSYNC_DB_PATH` - Local store database file
//! - `FLEETSYNC_CACHE_TTL_SECS` - Default cache entry TTL
//! - `FLEETSYNC_MAX_RETRIES` - Reconnect attempts before giving up
//! - `FLEETSYNC_REMOTE_URL` - Remote store base URL
//! - `FLEETSYNC_DATABASE` - Remote database name
//! - `FLEETSYNC_API_KEY` - Remote API key

use crate::connection::MonitorConfig;
use crate::store::QueueConfig;
use crate::sync::CoordinatorConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "fleetsync.toml";

pub const ENV_DB_PATH: &str = "FLEETSYNC_DB_PATH";
pub const ENV_CACHE_TTL_SECS: &str = "FLEETSYNC_CACHE_TTL_SECS";
pub const ENV_MAX_RETRIES: &str = "FLEETSYNC_MAX_RETRIES";
pub const ENV_REMOTE_URL: &str = "FLEETSYNC_REMOTE_URL";
pub const ENV_DATABASE: &str = "FLEETSYNC_DATABASE";
pub const ENV_API_KEY: &str = "FLEETSYNC_API_KEY";

/// Application directory under the user data dir
pub const APP_NAME: &str = "fleetsync";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub sync: CoordinatorConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
}

/// Local store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database file; the user data directory when unset
    pub path: Option<PathBuf>,
    pub default_ttl_secs: u64,
    pub queue_max_count: usize,
    pub queue_max_bytes: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            default_ttl_secs: 300,
            queue_max_count: 10_000,
            queue_max_bytes: 100 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig::new(self.queue_max_count, self.queue_max_bytes)
    }
}

/// Connection monitor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_retries: u32,
    pub health_check_secs: u64,
    pub jitter: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 2_000,
            max_delay_ms: 30_000,
            max_retries: 3,
            health_check_secs: 30,
            jitter: false,
        }
    }
}

impl ConnectionConfig {
    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            max_retries: self.max_retries,
            health_check_interval: Duration::from_secs(self.health_check_secs),
            jitter: self.jitter,
        }
    }
}

/// Remote store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub url: Option<String>,
    pub database: String,
    pub api_key: Option<String>,
    pub poll_interval_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: None,
            database: "fleet".to_string(),
            api_key: None,
            poll_interval_ms: 2_000,
        }
    }
}

impl RemoteConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl SyncConfig {
    /// Load configuration from a directory
    ///
    /// Reads `.env` from the same directory first, then applies environment
    /// overrides on top of the file (or the defaults when there is none).
    pub fn load(dir: &Path) -> anyhow::Result<Self> {
        let env_path = dir.join(".env");
        if env_path.exists() {
            let _ = dotenvy::from_path(&env_path);
        }

        let config_path = dir.join(CONFIG_FILE_NAME);
        let mut config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            toml::from_str(&content).map_err(|e| {
                anyhow::anyhow!("Invalid {}: {}", config_path.display(), e)
            })?
        } else {
            SyncConfig::default()
        };

        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the runtime cannot honour.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.connection.health_check_secs == 0 {
            anyhow::bail!("connection.health_check_secs must be greater than 0");
        }
        if self.remote.poll_interval_ms == 0 {
            anyhow::bail!("remote.poll_interval_ms must be greater than 0");
        }
        if self.connection.max_delay_ms < self.connection.base_delay_ms {
            anyhow::bail!(
                "connection.max_delay_ms ({}) is below base_delay_ms ({})",
                self.connection.max_delay_ms,
                self.connection.base_delay_ms
            );
        }
        Ok(())
    }

    /// Apply overrides from a variable lookup. Empty and unparsable values
    /// are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |name: &str| lookup(name).filter(|v| !v.is_empty());

        if let Some(path) = get(ENV_DB_PATH) {
            self.store.path = Some(PathBuf::from(path));
        }
        if let Some(ttl) = get(ENV_CACHE_TTL_SECS).and_then(|v| v.parse().ok()) {
            self.store.default_ttl_secs = ttl;
        }
        if let Some(retries) = get(ENV_MAX_RETRIES).and_then(|v| v.parse().ok()) {
            self.connection.max_retries = retries;
        }
        if let Some(url) = get(ENV_REMOTE_URL) {
            self.remote.url = Some(url);
        }
        if let Some(database) = get(ENV_DATABASE) {
            self.remote.database = database;
        }
        if let Some(api_key) = get(ENV_API_KEY) {
            self.remote.api_key = Some(api_key);
        }
    }

    pub fn save(&self, dir: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(dir.join(CONFIG_FILE_NAME), content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig::load(dir.path()).unwrap();

        assert_eq!(config.store.default_ttl_secs, 300);
        assert_eq!(config.connection.max_retries, 3);
        assert_eq!(config.sync.max_replay_attempts, 5);
        assert!(config.sync.drain_on_start);
        assert_eq!(config.remote.poll_interval_ms, 2_000);
    }

    #[test]
    fn test_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            "[connection]\nbase_delay_ms = 500\n\n[remote]\ndatabase = \"depot\"\n",
        )
        .unwrap();

        let config = SyncConfig::load(dir.path()).unwrap();
        assert_eq!(config.connection.base_delay_ms, 500);
        assert_eq!(config.connection.max_delay_ms, 30_000);
        assert_eq!(
            config.connection.monitor_config().base_delay,
            Duration::from_millis(500)
        );
        assert_eq!(config.store.queue_max_count, 10_000);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "[store\n").unwrap();
        assert!(SyncConfig::load(dir.path()).is_err());
    }

    #[test]
    fn test_zero_intervals_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);

        std::fs::write(&path, "[connection]\nhealth_check_secs = 0\n").unwrap();
        let err = SyncConfig::load(dir.path()).unwrap_err();
        assert!(err.to_string().contains("health_check_secs"));

        std::fs::write(&path, "[remote]\npoll_interval_ms = 0\n").unwrap();
        let err = SyncConfig::load(dir.path()).unwrap_err();
        assert!(err.to_string().contains("poll_interval_ms"));

        std::fs::write(&path, "[connection]\nbase_delay_ms = 5000\nmax_delay_ms = 1000\n")
            .unwrap();
        assert!(SyncConfig::load(dir.path()).is_err());

        assert!(SyncConfig::default().validate().is_ok());
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            (ENV_DB_PATH, "/tmp/fleet.db"),
            (ENV_CACHE_TTL_SECS, "60"),
            (ENV_MAX_RETRIES, "not-a-number"),
            (ENV_DATABASE, ""),
            (ENV_API_KEY, "secret"),
        ]
        .into_iter()
        .collect();

        let mut config = SyncConfig::default();
        config.apply_overrides(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.store.path, Some(PathBuf::from("/tmp/fleet.db")));
        assert_eq!(config.store.default_ttl_secs, 60);
        assert_eq!(config.connection.max_retries, 3);
        assert_eq!(config.remote.database, "fleet");
        assert_eq!(config.remote.api_key.as_deref(), Some("secret"));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SyncConfig::default();
        config.remote.url = Some("http://localhost:6745".to_string());
        config.save(dir.path()).unwrap();

        let loaded = SyncConfig::load(dir.path()).unwrap();
        assert_eq!(loaded.remote.url.as_deref(), Some("http://localhost:6745"));
    }
}
