//! Process-wide SSH defaults, stored as JSON in `~/.sshtunnel/settings.json`.

use crate::services::ssh::{ConnectionConfig, DEFAULT_BUFFER_SIZE, ReconnectConfig};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// SSH defaults applied to every new tunnel config.
///
/// Timeouts are in seconds. Fields missing from the file keep their
/// defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSettings {
    pub connect_timeout: u64,
    pub read_write_timeout: u64,
    pub command_timeout: u64,
    pub command_retry_count: u32,
    pub buffer_size: usize,
    pub keepalive: u64,
    /// OpenSSH client config consulted by session backends
    pub config_file: String,
    /// Where `known_hosts` is kept; empty means `~/.ssh`
    pub options_dir: String,
    pub reconnect_attempts: u32,
    pub reconnect_initial_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
}

impl Default for SshSettings {
    fn default() -> Self {
        let config_file = dirs::home_dir()
            .map(|home| home.join(".ssh").join("config").display().to_string())
            .unwrap_or_else(|| "~/.ssh/config".to_string());
        let reconnect = ReconnectConfig::default();
        Self {
            connect_timeout: 10,
            read_write_timeout: 5,
            command_timeout: 1,
            command_retry_count: 3,
            buffer_size: DEFAULT_BUFFER_SIZE,
            keepalive: 60,
            config_file,
            options_dir: String::new(),
            reconnect_attempts: reconnect.max_attempts,
            reconnect_initial_delay_ms: reconnect.initial_delay.as_millis() as u64,
            reconnect_max_delay_ms: reconnect.max_delay.as_millis() as u64,
        }
    }
}

impl SshSettings {
    /// Default location of the settings file
    pub fn default_path() -> Result<PathBuf> {
        let home =
            dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Could not find home directory"))?;
        Ok(home.join(".sshtunnel").join("settings.json"))
    }

    /// Load from the default location. A missing file gives the defaults.
    pub fn load_default() -> Result<Self> {
        Self::load(&Self::default_path()?)
    }

    /// Load from `path`. A missing or empty file gives the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read SSH settings from {}", path.display()))?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid SSH settings in {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write SSH settings to {}", path.display()))?;
        Ok(())
    }

    /// Copy the tunable fields into a tunnel config. Routing fields are left
    /// alone.
    pub fn apply_to(&self, config: &mut ConnectionConfig) {
        config.connect_timeout = self.connect_timeout;
        config.read_write_timeout = self.read_write_timeout;
        config.command_timeout = self.command_timeout;
        config.command_retry_count = self.command_retry_count;
        config.buffer_size = self.buffer_size;
        config.keepalive = self.keepalive;
        config.config_file = Some(self.config_file.clone()).filter(|f| !f.is_empty());
        config.options_dir = Some(self.options_dir.clone()).filter(|d| !d.is_empty());
    }

    pub fn reconnect_config(&self) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_millis(self.reconnect_initial_delay_ms),
            max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
            max_attempts: self.reconnect_attempts,
            ..ReconnectConfig::default()
        }
    }
}
