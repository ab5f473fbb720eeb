//! Configuration loading and persistence.
//!
//! Settings are layered, later layers winning:
//!
//! 1. Built-in defaults (see [`crate::constants`])
//! 2. `config.json` in the config directory
//! 3. `SCBRIDGE_*` environment variables
//! 4. Command-line flags (applied by `main`)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use std::{fs, path::Path, path::PathBuf};

use crate::bridge::{BridgeConfig, PayloadDelivery};
use crate::constants;

/// Name of the configuration file inside the config directory.
const CONFIG_FILE: &str = "config.json";

/// Configuration for the bridge server.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Address the WebSocket server binds.
    pub listen_addr: String,
    /// Authoring executable.
    pub executable: PathBuf,
    /// Model cache directory passed to the executable.
    pub cache_dir: PathBuf,
    /// Model the executable authors into.
    pub model_id: String,
    /// Native library directory exported to the executable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub library_path: Option<PathBuf>,
    /// Environment variable `library_path` is exported as.
    pub library_path_var: String,
    /// How the payload reaches the executable.
    pub payload_delivery: PayloadDelivery,
    /// Authoring processes allowed to run at once.
    pub max_workers: usize,
    /// Submissions allowed to wait for a worker.
    pub queue_capacity: usize,
    /// Seconds before a running process is killed.
    pub submission_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        let cache_dir = dirs::cache_dir()
            .map(|d| d.join("scbridge"))
            .unwrap_or_else(|| PathBuf::from("scbridge-cache"));

        Self {
            listen_addr: constants::DEFAULT_LISTEN_ADDR.to_string(),
            executable: PathBuf::from(constants::DEFAULT_EXECUTABLE),
            cache_dir,
            model_id: constants::DEFAULT_MODEL_ID.to_string(),
            library_path: None,
            library_path_var: constants::DEFAULT_LIBRARY_PATH_VAR.to_string(),
            payload_delivery: PayloadDelivery::default(),
            max_workers: constants::DEFAULT_MAX_WORKERS,
            queue_capacity: constants::DEFAULT_QUEUE_CAPACITY,
            submission_timeout_secs: constants::DEFAULT_SUBMISSION_TIMEOUT.as_secs(),
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// `SCBRIDGE_CONFIG_DIR` overrides the platform config directory
    /// (Linux: `~/.config/scbridge`, macOS: `~/Library/Application Support/scbridge`).
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("SCBRIDGE_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("scbridge")
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory {}", dir.display()))?;
        Ok(dir)
    }

    /// Loads configuration from file, with environment variable overrides.
    ///
    /// A missing file means defaults. An unreadable one is an error.
    pub fn load() -> Result<Self> {
        let dir = Self::config_dir()?;
        let mut config = Self::load_from_dir(&dir)?.unwrap_or_default();
        config.apply_env_overrides();
        Ok(config)
    }

    /// Reads `config.json` from `dir`, `None` if it does not exist.
    pub fn load_from_dir(dir: &Path) -> Result<Option<Self>> {
        let config_path = dir.join(CONFIG_FILE);
        if !config_path.exists() {
            log::debug!("[Config] No config file at {}", config_path.display());
            return Ok(None);
        }
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        let config = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;
        log::info!("[Config] Loaded {}", config_path.display());
        Ok(Some(config))
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply `SCBRIDGE_*` overrides from `lookup`.
    ///
    /// Values that fail to parse are ignored with a warning.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(addr) = lookup("SCBRIDGE_LISTEN_ADDR") {
            self.listen_addr = addr;
        }

        if let Some(executable) = lookup("SCBRIDGE_EXECUTABLE") {
            self.executable = PathBuf::from(executable);
        }

        if let Some(cache_dir) = lookup("SCBRIDGE_CACHE_DIR") {
            self.cache_dir = PathBuf::from(cache_dir);
        }

        if let Some(model_id) = lookup("SCBRIDGE_MODEL_ID") {
            self.model_id = model_id;
        }

        if let Some(library_path) = lookup("SCBRIDGE_LIBRARY_PATH") {
            self.library_path = Some(PathBuf::from(library_path));
        }

        if let Some(var) = lookup("SCBRIDGE_LIBRARY_PATH_VAR") {
            self.library_path_var = var;
        }

        if let Some(delivery) = lookup("SCBRIDGE_PAYLOAD_DELIVERY") {
            match delivery.parse() {
                Ok(delivery) => self.payload_delivery = delivery,
                Err(e) => log::warn!("[Config] Ignoring SCBRIDGE_PAYLOAD_DELIVERY: {e}"),
            }
        }

        if let Some(max_workers) = lookup("SCBRIDGE_MAX_WORKERS") {
            match max_workers.parse::<usize>() {
                Ok(max) => self.max_workers = max,
                Err(e) => log::warn!("[Config] Ignoring SCBRIDGE_MAX_WORKERS={max_workers}: {e}"),
            }
        }

        if let Some(capacity) = lookup("SCBRIDGE_QUEUE_CAPACITY") {
            match capacity.parse::<usize>() {
                Ok(capacity) => self.queue_capacity = capacity,
                Err(e) => log::warn!("[Config] Ignoring SCBRIDGE_QUEUE_CAPACITY: {e}"),
            }
        }

        if let Some(timeout) = lookup("SCBRIDGE_SUBMISSION_TIMEOUT") {
            match timeout.parse::<u64>() {
                Ok(secs) => self.submission_timeout_secs = secs,
                Err(e) => log::warn!("[Config] Ignoring SCBRIDGE_SUBMISSION_TIMEOUT: {e}"),
            }
        }
    }

    /// Persists the current configuration to the config directory.
    pub fn save(&self) -> Result<PathBuf> {
        self.save_to_dir(&Self::config_dir()?)
    }

    /// Writes `config.json` into `dir`.
    pub fn save_to_dir(&self, dir: &Path) -> Result<PathBuf> {
        let config_path = dir.join(CONFIG_FILE);
        fs::write(&config_path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;
        Ok(config_path)
    }

    /// Bridge settings derived from this configuration.
    pub fn bridge_config(&self) -> BridgeConfig {
        if self.max_workers == 0 {
            log::warn!("[Config] max_workers is 0, running with 1 worker");
        }
        BridgeConfig {
            executable: self.executable.clone(),
            cache_dir: self.cache_dir.clone(),
            model_id: self.model_id.clone(),
            library_path: self.library_path.clone(),
            library_path_var: self.library_path_var.clone(),
            payload_delivery: self.payload_delivery,
            max_workers: self.max_workers.max(1),
            queue_capacity: self.queue_capacity,
            timeout: Duration::from_secs(self.submission_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.listen_addr, "127.0.0.1:5000");
        assert_eq!(config.model_id, "microengine");
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.queue_capacity, 16);
        assert_eq!(config.submission_timeout_secs, 300);
        assert_eq!(config.payload_delivery, PayloadDelivery::Stdin);
        assert!(config.library_path.is_none());
    }

    #[test]
    fn test_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load_from_dir(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("config.json"),
            r#"{"executable": "/opt/sc/author", "max_workers": 2, "payload_delivery": "argument"}"#,
        )
        .unwrap();

        let config = Config::load_from_dir(dir.path()).unwrap().unwrap();
        assert_eq!(config.executable, PathBuf::from("/opt/sc/author"));
        assert_eq!(config.max_workers, 2);
        assert_eq!(config.payload_delivery, PayloadDelivery::Argument);
        assert_eq!(config.queue_capacity, 16);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("config.json"), "{ not json").unwrap();
        assert!(Config::load_from_dir(dir.path()).is_err());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.library_path = Some(PathBuf::from("/opt/sc/lib"));
        config.save_to_dir(dir.path()).unwrap();

        let loaded = Config::load_from_dir(dir.path()).unwrap().unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_overrides_applied() {
        let env: HashMap<&str, &str> = [
            ("SCBRIDGE_LISTEN_ADDR", "0.0.0.0:6000"),
            ("SCBRIDGE_LIBRARY_PATH", "/opt/sc/lib"),
            ("SCBRIDGE_MAX_WORKERS", "8"),
            ("SCBRIDGE_SUBMISSION_TIMEOUT", "30"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|name| env.get(name).map(|v| (*v).to_string()));

        assert_eq!(config.listen_addr, "0.0.0.0:6000");
        assert_eq!(config.library_path, Some(PathBuf::from("/opt/sc/lib")));
        assert_eq!(config.max_workers, 8);
        assert_eq!(config.submission_timeout_secs, 30);
    }

    #[test]
    fn test_unparseable_override_ignored() {
        let mut config = Config::default();
        config.apply_overrides(|name| match name {
            "SCBRIDGE_MAX_WORKERS" => Some("many".to_string()),
            "SCBRIDGE_PAYLOAD_DELIVERY" => Some("carrier-pigeon".to_string()),
            _ => None,
        });
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.payload_delivery, PayloadDelivery::Stdin);
    }

    #[test]
    fn test_bridge_config_clamps_workers() {
        let mut config = Config::default();
        config.max_workers = 0;
        config.submission_timeout_secs = 12;

        let bridge = config.bridge_config();
        assert_eq!(bridge.max_workers, 1);
        assert_eq!(bridge.timeout, Duration::from_secs(12));
        assert_eq!(bridge.model_id, config.model_id);
    }
}
