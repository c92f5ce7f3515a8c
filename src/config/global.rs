
use crate::error::{DevServeError, Result};
use crate::process::{RestartPolicy, SupervisorSettings};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GlobalConfig {
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub ports: PortsConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub bundler: BundlerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_max_restart_attempts")]
    pub max_restart_attempts: u32,
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
    #[serde(default = "default_refresh_retry_delay_ms")]
    pub refresh_retry_delay_ms: u64,
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortsConfig {
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    #[serde(default = "default_probe_count")]
    pub probe_count: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_node_path")]
    pub node_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BundlerConfig {
    /// Path to the esbuild binary. If None, `node_modules/.bin/esbuild` or PATH is used.
    pub engine_path: Option<String>,
    /// One of "npm", "pnpm", "yarn", "bun". If None, detected from the lockfile.
    pub package_manager: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_file_enabled")]
    pub file_enabled: bool,
    pub file_path: Option<String>, // If None, uses ~/.devserve/logs/
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_restart_attempts: default_max_restart_attempts(),
            restart_delay_ms: default_restart_delay_ms(),
            refresh_retry_delay_ms: default_refresh_retry_delay_ms(),
            ready_timeout_secs: default_ready_timeout_secs(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            base_port: default_base_port(),
            probe_count: default_probe_count(),
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            node_path: default_node_path(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_enabled: default_file_enabled(),
            file_path: None,
        }
    }
}

impl GlobalConfig {
    pub async fn load() -> Result<Self> {
        let config_dir = get_config_dir()?;
        Self::load_from_path(&config_dir.join("config.toml")).await
    }

    pub async fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path).await?;
        let config: Self = toml::from_str(&content)?;

        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ports.base_port == 0 {
            return Err(DevServeError::ConfigError(
                "Base port must be between 1 and 65535".to_string(),
            ));
        }

        if self.ports.probe_count == 0 {
            return Err(DevServeError::ConfigError(
                "Port probe count must be greater than 0".to_string(),
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(DevServeError::ConfigError(format!(
                "Invalid logging level: {}",
                self.logging.level
            )));
        }

        if let Some(manager) = &self.bundler.package_manager {
            if !["npm", "pnpm", "yarn", "bun"].contains(&manager.as_str()) {
                return Err(DevServeError::ConfigError(format!(
                    "Unsupported package manager: {manager}"
                )));
            }
        }

        Ok(())
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            max_attempts: self.supervisor.max_restart_attempts,
            backoff: Duration::from_millis(self.supervisor.restart_delay_ms),
        }
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            node_path: PathBuf::from(&self.runtime.node_path),
            ready_timeout: Duration::from_secs(self.supervisor.ready_timeout_secs),
            shutdown_grace: Duration::from_millis(self.supervisor.shutdown_grace_ms),
            refresh_retry_delay: Duration::from_millis(self.supervisor.refresh_retry_delay_ms),
        }
    }

    pub fn get_log_dir(&self) -> PathBuf {
        match &self.logging.file_path {
            Some(path) => PathBuf::from(path),
            None => {
                let config_dir = get_config_dir().unwrap_or_else(|_| PathBuf::from(".devserve"));
                config_dir.join("logs")
            }
        }
    }
}

pub fn get_config_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("DEVSERVE_HOME") {
        return Ok(PathBuf::from(dir));
    }

    let home_dir = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map_err(|_| DevServeError::ConfigError("Could not determine home directory".to_string()))?;

    Ok(PathBuf::from(home_dir).join(".devserve"))
}

// Default value functions for serde
fn default_max_restart_attempts() -> u32 {
    3
}
fn default_restart_delay_ms() -> u64 {
    1000
}
fn default_refresh_retry_delay_ms() -> u64 {
    1500
}
fn default_ready_timeout_secs() -> u64 {
    30
}
fn default_shutdown_grace_ms() -> u64 {
    5000
}
fn default_base_port() -> u16 {
    4111
}
fn default_probe_count() -> u16 {
    21
}
fn default_debounce_ms() -> u64 {
    100
}
fn default_node_path() -> String {
    "node".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_file_enabled() -> bool {
    false
}
