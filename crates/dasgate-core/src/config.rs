//! dasgate configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{GatewayError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Identifier used as log prefix for this gateway instance.
    #[serde(default = "default_gateway_id")]
    pub id: String,
    #[serde(default)]
    pub tasks: TasksConfig,
    #[serde(default)]
    pub alerts: AlertConfig,
}

fn default_gateway_id() -> String { "dasgate".into() }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            id: default_gateway_id(),
            tasks: TasksConfig::default(),
            alerts: AlertConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Load config from the default path (~/.dasgate/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::Config(format!("Failed to read config: {e}")))?;
        Self::parse(&content)
    }

    /// Parse config from TOML text.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| GatewayError::Config(format!("Failed to parse config: {e}")))?;
        config.tasks.validate()?;
        Ok(config)
    }

    /// Save config to the given path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| GatewayError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the dasgate home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".dasgate")
    }

    /// Task file location, resolved against the home directory when relative.
    pub fn tasks_file(&self) -> PathBuf {
        let file = PathBuf::from(&self.tasks.file);
        if file.is_absolute() {
            file
        } else {
            Self::home_dir().join(file)
        }
    }
}

/// Task engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TasksConfig {
    /// Manager id, shown in every task log line.
    #[serde(default = "default_manager_id")]
    pub id: String,
    /// Task list file (TOML).
    #[serde(default = "default_tasks_file")]
    pub file: String,
    /// Size of the shared worker pool backing every scheduled task.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    /// Arm auto-start tasks as soon as they are loaded.
    #[serde(default = "bool_true")]
    pub start_on_load: bool,
    /// Period of the interval recheck sweep, 0 disables it.
    #[serde(default = "default_recheck_secs")]
    pub recheck_secs: u64,
    /// Delay before the first stream restore check.
    #[serde(default = "default_restore_first_secs")]
    pub restore_first_secs: u64,
    /// Delay between subsequent stream restore checks.
    #[serde(default = "default_restore_again_secs")]
    pub restore_again_secs: u64,
}

fn bool_true() -> bool { true }
fn default_manager_id() -> String { "tasks".into() }
fn default_tasks_file() -> String { "tasks.toml".into() }
fn default_worker_threads() -> usize { 3 }
fn default_recheck_secs() -> u64 { 60 }
fn default_restore_first_secs() -> u64 { 15 }
fn default_restore_again_secs() -> u64 { 10 }

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            id: default_manager_id(),
            file: default_tasks_file(),
            worker_threads: default_worker_threads(),
            start_on_load: true,
            recheck_secs: default_recheck_secs(),
            restore_first_secs: default_restore_first_secs(),
            restore_again_secs: default_restore_again_secs(),
        }
    }
}

impl TasksConfig {
    fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 {
            return Err(GatewayError::Config(
                "tasks.worker_threads must be at least 1".into(),
            ));
        }
        if self.restore_again_secs == 0 {
            return Err(GatewayError::Config(
                "tasks.restore_again_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Operator alert routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Recipient reference handed to the email sink for operator alerts.
    #[serde(default = "default_admin")]
    pub admin: String,
}

fn default_admin() -> String { "admin".into() }

impl Default for AlertConfig {
    fn default() -> Self {
        Self { admin: default_admin() }
    }
}
