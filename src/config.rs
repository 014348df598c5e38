//! Configuration for the taskboard host

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::presence::DEFAULT_TTL;
use crate::recycle_bin::DEFAULT_UNDO_WINDOW;
use crate::storage::DEFAULT_QUOTA_BYTES;

/// Host configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub timing: TimingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite file backing local storage
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,

    /// Total bytes (keys plus values) storage may hold
    #[serde(default = "default_quota_bytes")]
    pub quota_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// How long a deleted task can still be restored
    #[serde(default = "default_undo_window_ms")]
    pub undo_window_ms: u64,

    #[serde(default = "default_autosave_debounce_ms")]
    pub autosave_debounce_ms: u64,

    /// Quiet period before the last used filters are remembered
    #[serde(default = "default_filter_debounce_ms")]
    pub filter_debounce_ms: u64,

    /// Sessions silent for longer than this are no longer active
    #[serde(default = "default_presence_ttl_secs")]
    pub presence_ttl_secs: u64,

    #[serde(default = "default_presence_heartbeat_secs")]
    pub presence_heartbeat_secs: u64,
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3030
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("taskboard.sqlite")
}

fn default_quota_bytes() -> u64 {
    DEFAULT_QUOTA_BYTES
}

fn default_undo_window_ms() -> u64 {
    DEFAULT_UNDO_WINDOW.as_millis() as u64
}

fn default_autosave_debounce_ms() -> u64 {
    100
}

fn default_filter_debounce_ms() -> u64 {
    400
}

fn default_presence_ttl_secs() -> u64 {
    DEFAULT_TTL.as_secs()
}

fn default_presence_heartbeat_secs() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
            quota_bytes: default_quota_bytes(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            undo_window_ms: default_undo_window_ms(),
            autosave_debounce_ms: default_autosave_debounce_ms(),
            filter_debounce_ms: default_filter_debounce_ms(),
            presence_ttl_secs: default_presence_ttl_secs(),
            presence_heartbeat_secs: default_presence_heartbeat_secs(),
        }
    }
}

impl TimingConfig {
    pub fn undo_window(&self) -> Duration {
        Duration::from_millis(self.undo_window_ms)
    }

    pub fn autosave_debounce(&self) -> Duration {
        Duration::from_millis(self.autosave_debounce_ms)
    }

    pub fn filter_debounce(&self) -> Duration {
        Duration::from_millis(self.filter_debounce_ms)
    }

    pub fn presence_ttl(&self) -> Duration {
        Duration::from_secs(self.presence_ttl_secs)
    }

    pub fn presence_heartbeat(&self) -> Duration {
        Duration::from_secs(self.presence_heartbeat_secs.max(1))
    }
}

impl Config {
    /// Default config path
    pub fn default_path() -> Result<PathBuf> {
        // Check environment variable first
        if let Ok(env_path) = std::env::var("TASKBOARD_CONFIG") {
            return Ok(PathBuf::from(env_path));
        }

        // Check for config in current directory
        let local = PathBuf::from("config.toml");
        if local.exists() {
            return Ok(local);
        }

        // Then check XDG config
        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?
            .join("taskboard");

        Ok(config_dir.join("config.toml"))
    }

    /// Load config from default path
    pub fn load() -> Result<Self> {
        let path = Self::default_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from specific path
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path).context("Failed to read config file")?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }

    /// Save config to specific path
    pub fn save_to(&self, path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        let with_comments = format!(
            "# taskboard configuration\n\
             # Timings are in milliseconds unless the key says otherwise.\n\n\
             {}",
            content
        );

        std::fs::write(path, with_comments).context("Failed to write config file")?;

        Ok(())
    }
}
