//! Configuration management with hierarchical overrides using figment.
//!
//! Sources, lowest precedence first:
//! 1. Embedded defaults
//! 2. System configuration file (/etc/bastion/config.toml)
//! 3. User configuration file (`<config dir>/bastion/config.toml`)
//! 4. An explicit file passed by the caller (e.g. `--config`)
//! 5. Environment variables (`BASTION_AGENT_*`, `__` separates nested keys)

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default installation root.
pub const DEFAULT_INSTALL_ROOT: &str = "/opt/bastion";

/// Default directory for IPC endpoints.
pub const DEFAULT_SOCKET_DIR: &str = "/opt/bastion/var/ipc";

const SYSTEM_CONFIG_PATH: &str = "/etc/bastion/config.toml";

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration format: {0}")]
    InvalidFormat(#[from] Box<figment::Error>),

    #[error("Configuration validation failed: {message}")]
    ValidationError { message: String },
}

/// Top-level configuration shared by the agent and plugins.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Config {
    /// Transport settings
    pub ipc: IpcSettings,
    /// Well-known directories and files
    pub paths: PathsConfig,
    /// Health polling
    pub health: HealthConfig,
    /// Logging
    pub logging: LoggingConfig,
}

/// Transport settings applied to every endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IpcSettings {
    /// Directory holding the agent and plugin endpoints
    pub socket_dir: PathBuf,
    /// Maximum frame size in bytes
    pub max_frame_bytes: usize,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
}

/// Directories the agent and plugins exchange files through.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    /// One JSON registry file per installed plugin
    pub registry_dir: PathBuf,
    /// Policy files delivered by the management service
    pub policy_dir: PathBuf,
    /// Action files delivered by the management service
    pub action_dir: PathBuf,
    /// Outgoing events
    pub event_dir: PathBuf,
    /// Outgoing status documents, including the health status
    pub status_dir: PathBuf,
    /// Agent state: health summaries, threat health, outbreak state
    pub var_dir: PathBuf,
    /// Present while a product update is running
    pub update_marker: PathBuf,
}

/// Health polling configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HealthConfig {
    /// Seconds between health polls
    pub poll_interval_seconds: u64,
    /// Seconds a finished update still suppresses missing-health reports
    pub update_grace_period_seconds: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (human, json)
    pub format: String,
}

impl Default for IpcSettings {
    fn default() -> Self {
        Self {
            socket_dir: PathBuf::from(DEFAULT_SOCKET_DIR),
            max_frame_bytes: 1024 * 1024,
            connect_timeout_ms: 5000,
            read_timeout_ms: 30000,
            write_timeout_ms: 10000,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self::under(Path::new(DEFAULT_INSTALL_ROOT))
    }
}

impl PathsConfig {
    /// Standard layout below an installation root.
    pub fn under(root: &Path) -> Self {
        let base = root.join("base");
        let mcs = base.join("mcs");
        let var = root.join("var");
        Self {
            registry_dir: base.join("pluginRegistry"),
            policy_dir: mcs.join("policy"),
            action_dir: mcs.join("action"),
            event_dir: mcs.join("event"),
            status_dir: mcs.join("status"),
            update_marker: var.join("update_in_progress"),
            var_dir: var,
        }
    }

    /// Registry file describing `plugin_name`.
    pub fn registry_file(&self, plugin_name: &str) -> PathBuf {
        self.registry_dir.join(format!("{plugin_name}.json"))
    }

    /// Rendered health status document.
    pub fn health_status_file(&self) -> PathBuf {
        self.status_dir.join("SHS_status.xml")
    }

    /// Compact overall-health summary.
    pub fn overall_health_file(&self) -> PathBuf {
        self.var_dir.join("overall_health.json")
    }

    /// Persisted threat-detection health.
    pub fn threat_health_file(&self) -> PathBuf {
        self.var_dir.join("threat_health.json")
    }

    /// Persisted outbreak-mode state.
    pub fn outbreak_status_file(&self) -> PathBuf {
        self.var_dir.join("outbreak_status.json")
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 15,
            update_grace_period_seconds: 60,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: "human".to_owned(),
        }
    }
}

/// Configuration loader with hierarchical override support.
pub struct ConfigLoader {
    component: String,
    explicit_file: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader for the specified component.
    pub fn new(component: &str) -> Self {
        Self {
            component: component.to_owned(),
            explicit_file: None,
        }
    }

    /// Also merge `path`, which must exist.
    #[must_use]
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.explicit_file = Some(path.into());
        self
    }

    /// Load configuration with hierarchical overrides.
    pub fn load(&self) -> Result<Config, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        if Path::new(SYSTEM_CONFIG_PATH).exists() {
            figment = figment.merge(Toml::file(SYSTEM_CONFIG_PATH));
        }

        let user_config_path = Self::user_config_path();
        if user_config_path.exists() {
            figment = figment.merge(Toml::file(&user_config_path));
        }

        if let Some(path) = &self.explicit_file {
            if !path.exists() {
                return Err(ConfigError::FileNotFound { path: path.clone() });
            }
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed(&self.env_prefix()).split("__"));

        let config: Config = figment.extract().map_err(Box::new)?;
        Self::validate_config(&config)?;
        Ok(config)
    }

    fn env_prefix(&self) -> String {
        format!("{}_", self.component.replace('-', "_").to_uppercase())
    }

    /// Platform config directory, then `$HOME/.config`, then /tmp.
    fn user_config_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            return config_dir.join("bastion").join("config.toml");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join(".config")
                .join("bastion")
                .join("config.toml");
        }
        PathBuf::from("/tmp/.config/bastion/config.toml")
    }

    fn validate_config(config: &Config) -> Result<(), ConfigError> {
        if config.health.poll_interval_seconds == 0 {
            return Err(ConfigError::ValidationError {
                message: "health.poll_interval_seconds must be greater than 0".to_owned(),
            });
        }
        if config.ipc.max_frame_bytes == 0 {
            return Err(ConfigError::ValidationError {
                message: "ipc.max_frame_bytes must be greater than 0".to_owned(),
            });
        }
        if config.ipc.connect_timeout_ms == 0
            || config.ipc.read_timeout_ms == 0
            || config.ipc.write_timeout_ms == 0
        {
            return Err(ConfigError::ValidationError {
                message: "ipc timeouts must be greater than 0".to_owned(),
            });
        }
        Ok(())
    }
}
