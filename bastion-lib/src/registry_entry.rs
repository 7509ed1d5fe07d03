//! On-disk plugin registry entries.
//!
//! Every installed plugin owns one JSON file in the registry directory. The
//! management agent reads it to learn which application ids the plugin consumes
//! and which health categories it reports; the file disappearing is how the agent
//! tells an uninstalled plugin from a merely unresponsive one.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors reading registry entries.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RegistryEntryError {
    #[error("failed to read registry file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid registry file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("registry file {path} has no plugin name")]
    MissingName { path: PathBuf },
}

/// Environment variable passed to a plugin executable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EnvironmentVariable {
    pub name: String,
    pub value: String,
}

/// Contents of a plugin registry file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PluginRegistryEntry {
    pub plugin_name: String,
    pub policy_app_ids: Vec<String>,
    pub action_app_ids: Vec<String>,
    pub status_app_ids: Vec<String>,
    pub xml_translator_path: String,
    pub executable_user_and_group: String,
    pub executable_full_path: String,
    pub executable_arguments: Vec<String>,
    pub environment_variables: Vec<EnvironmentVariable>,
    pub seconds_to_shut_down: u32,
    pub threat_service_health: bool,
    pub service_health: bool,
    pub display_plugin_name: String,
}

impl Default for PluginRegistryEntry {
    fn default() -> Self {
        Self {
            plugin_name: String::new(),
            policy_app_ids: Vec::new(),
            action_app_ids: Vec::new(),
            status_app_ids: Vec::new(),
            xml_translator_path: String::new(),
            executable_user_and_group: String::new(),
            executable_full_path: String::new(),
            executable_arguments: Vec::new(),
            environment_variables: Vec::new(),
            seconds_to_shut_down: 2,
            threat_service_health: false,
            service_health: false,
            display_plugin_name: String::new(),
        }
    }
}

impl PluginRegistryEntry {
    /// Parse a registry file's JSON text.
    pub fn from_json(json: &str, path: &Path) -> Result<Self, RegistryEntryError> {
        let entry: Self = serde_json::from_str(json).map_err(|source| RegistryEntryError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        if entry.plugin_name.trim().is_empty() {
            return Err(RegistryEntryError::MissingName {
                path: path.to_path_buf(),
            });
        }
        Ok(entry)
    }

    /// Load one registry file.
    pub fn load(path: &Path) -> Result<Self, RegistryEntryError> {
        let json = std::fs::read_to_string(path).map_err(|source| RegistryEntryError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json, path)
    }

    /// Load every `*.json` entry in `dir`, sorted by plugin name.
    ///
    /// Unreadable or invalid files are returned as errors next to the good
    /// entries so one broken file does not hide the rest.
    pub fn load_all(dir: &Path) -> (Vec<Self>, Vec<RegistryEntryError>) {
        let mut entries = Vec::new();
        let mut errors = Vec::new();

        let read_dir = match std::fs::read_dir(dir) {
            Ok(read_dir) => read_dir,
            Err(source) => {
                errors.push(RegistryEntryError::Read {
                    path: dir.to_path_buf(),
                    source,
                });
                return (entries, errors);
            }
        };

        for item in read_dir.flatten() {
            let path = item.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match Self::load(&path) {
                Ok(entry) => entries.push(entry),
                Err(e) => errors.push(e),
            }
        }

        entries.sort_by(|a, b| a.plugin_name.cmp(&b.plugin_name));
        (entries, errors)
    }

    /// Name shown in health details; falls back to the plugin name.
    pub fn display_name(&self) -> &str {
        if self.display_plugin_name.is_empty() {
            &self.plugin_name
        } else {
            &self.display_plugin_name
        }
    }
}
