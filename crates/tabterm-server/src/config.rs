//! Server configuration.

use anyhow::Result;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tabterm_core::{PtyExecutionService, SessionManagerConfig, DEFAULT_SCROLLBACK_CAP};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Shell for tabs created without one. Falls back to `$SHELL`.
    #[serde(default)]
    pub default_shell: Option<String>,
    /// Working directory for tabs created without one.
    #[serde(default = "default_working_directory")]
    pub default_working_directory: PathBuf,
    #[serde(default = "default_scrollback_lines")]
    pub scrollback_lines: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_flush_debounce_ms")]
    pub flush_debounce_ms: u64,
    #[serde(default = "default_resubscribe_attempts")]
    pub resubscribe_attempts: u32,
    #[serde(default = "default_resubscribe_backoff_ms")]
    pub resubscribe_backoff_ms: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8790
}

fn default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tabterm")
        .join("sessions.db")
}

fn default_working_directory() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"))
}

fn default_scrollback_lines() -> usize {
    DEFAULT_SCROLLBACK_CAP
}

fn default_flush_interval_ms() -> u64 {
    5_000
}

fn default_flush_debounce_ms() -> u64 {
    500
}

fn default_resubscribe_attempts() -> u32 {
    3
}

fn default_resubscribe_backoff_ms() -> u64 {
    250
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            db_path: default_db_path(),
            default_shell: None,
            default_working_directory: default_working_directory(),
            scrollback_lines: default_scrollback_lines(),
            flush_interval_ms: default_flush_interval_ms(),
            flush_debounce_ms: default_flush_debounce_ms(),
            resubscribe_attempts: default_resubscribe_attempts(),
            resubscribe_backoff_ms: default_resubscribe_backoff_ms(),
        }
    }
}

impl Config {
    /// Load config from a specific file path.
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load config from default location (config/default.toml) or fall back to defaults.
    pub fn load() -> Result<Self> {
        let config_path = PathBuf::from("config/default.toml");
        if config_path.exists() {
            return Self::load_from(&config_path);
        }
        Ok(Config::default())
    }

    pub fn shell(&self) -> String {
        self.default_shell
            .clone()
            .unwrap_or_else(PtyExecutionService::default_shell)
    }

    /// Session manager settings derived from this config.
    pub fn session_config(&self) -> SessionManagerConfig {
        SessionManagerConfig {
            db_path: self.db_path.clone(),
            scrollback_cap: self.scrollback_lines,
            flush_interval: Duration::from_millis(self.flush_interval_ms),
            flush_debounce: Duration::from_millis(self.flush_debounce_ms),
            resubscribe_attempts: self.resubscribe_attempts,
            resubscribe_backoff: Duration::from_millis(self.resubscribe_backoff_ms),
            ..Default::default()
        }
    }
}
