//! Registry of plugins known to the agent and the fan-out of policies and
//! actions to them.
//!
//! The registry lock is held across plugin I/O, so a plugin removed while a
//! broadcast is running never receives part of it. Lock order: registry, then
//! health.

use crate::event_receiver::EventReceiver;
use crate::health_status::{
    HEALTH_GOOD, HEALTH_GOOD_INFORMATIONAL, HEALTH_MISSING, HealthStatus, HealthType,
    PluginHealthStatus,
};
use crate::outbreak::{CORE_APP_ID, THREAT_RESET_MARKER};
use crate::plugin_proxy::{PluginConnector, PluginProxy};
use bastion_lib::config::PathsConfig;
use bastion_lib::files;
use bastion_lib::plugin_api::{PluginApiError, StatusInfo, is_filename_payload};
use bastion_lib::registry_entry::PluginRegistryEntry;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

const ACTION_READ_ATTEMPTS: u32 = 3;
const ACTION_READ_DELAY: Duration = Duration::from_millis(500);

/// Errors from direct plugin queries.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ManagerError {
    #[error("plugin `{0}` is not registered")]
    PluginNotRegistered(String),

    #[error("communication with plugin `{plugin}` failed: {source}")]
    Communication {
        plugin: String,
        #[source]
        source: PluginApiError,
    },
}

/// Agent-side plugin registry.
pub struct PluginManager {
    plugins: Mutex<BTreeMap<String, PluginProxy>>,
    connector: Arc<dyn PluginConnector>,
    paths: PathsConfig,
    health: Arc<Mutex<HealthStatus>>,
    event_receiver: Option<Arc<dyn EventReceiver>>,
    last_update_seen: std::sync::Mutex<Option<SystemTime>>,
}

impl PluginManager {
    pub fn new(
        connector: Arc<dyn PluginConnector>,
        paths: PathsConfig,
        health: Arc<Mutex<HealthStatus>>,
    ) -> Self {
        Self {
            plugins: Mutex::new(BTreeMap::new()),
            connector,
            paths,
            health,
            event_receiver: None,
            last_update_seen: std::sync::Mutex::new(None),
        }
    }

    /// Deliver CORE actions to `receiver`.
    #[must_use]
    pub fn with_event_receiver(mut self, receiver: Arc<dyn EventReceiver>) -> Self {
        self.event_receiver = Some(receiver);
        self
    }

    pub const fn paths(&self) -> &PathsConfig {
        &self.paths
    }

    /// Add a plugin, replacing any previous proxy of that name.
    pub async fn register_plugin(&self, plugin_name: &str) {
        let proxy = PluginProxy::new(plugin_name, self.connector.connect(plugin_name));
        self.plugins.lock().await.insert(plugin_name.to_owned(), proxy);
        info!(plugin = %plugin_name, "Plugin registered");
    }

    /// Register and apply the registry entry in one lock acquisition.
    pub async fn register_and_configure(&self, plugin_name: &str, entry: &PluginRegistryEntry) {
        let mut proxy = PluginProxy::new(plugin_name, self.connector.connect(plugin_name));
        proxy.configure(entry);
        self.plugins.lock().await.insert(plugin_name.to_owned(), proxy);
        info!(
            plugin = %plugin_name,
            policy_app_ids = ?entry.policy_app_ids,
            action_app_ids = ?entry.action_app_ids,
            "Plugin registered and configured"
        );
    }

    /// Register every plugin in the registry directory.
    pub async fn load_registry(&self) -> usize {
        let (entries, errors) = PluginRegistryEntry::load_all(&self.paths.registry_dir);
        for e in errors {
            warn!(error = %e, "Skipping registry entry");
        }
        for entry in &entries {
            self.register_and_configure(&entry.plugin_name, entry).await;
        }
        entries.len()
    }

    pub async fn remove_plugin(&self, plugin_name: &str) -> bool {
        let removed = self.plugins.lock().await.remove(plugin_name).is_some();
        if removed {
            info!(plugin = %plugin_name, "Plugin removed");
        }
        removed
    }

    /// Registered plugin names, sorted.
    pub async fn registered_plugin_names(&self) -> Vec<String> {
        self.plugins.lock().await.keys().cloned().collect()
    }

    pub async fn display_name(&self, plugin_name: &str) -> Option<String> {
        self.plugins
            .lock()
            .await
            .get(plugin_name)
            .map(|proxy| proxy.display_name().to_owned())
    }

    /// Send a policy to every plugin consuming `app_id`, optionally only to
    /// `plugin_filter`. Returns the number of plugins that accepted it.
    pub async fn apply_new_policy(&self, app_id: &str, policy: &str, plugin_filter: &str) -> usize {
        let mut plugins = self.plugins.lock().await;
        let mut delivered = 0;
        let mut failures = Vec::new();

        for (name, proxy) in plugins.iter_mut() {
            if !proxy.has_policy_app_id(app_id) || (!plugin_filter.is_empty() && name != plugin_filter) {
                continue;
            }
            match proxy.apply_new_policy(app_id, policy).await {
                Ok(()) => delivered += 1,
                Err(e) => failures.push((name.clone(), e.to_string())),
            }
        }

        self.reconcile_failures(&mut plugins, failures);
        debug!(app_id = %app_id, delivered, "Policy fan-out complete");
        delivered
    }

    /// Send an action to every plugin consuming `app_id`.
    ///
    /// CORE actions are also handled by the agent itself: they reach the event
    /// receiver and a threat reset clears threat-detection health.
    pub async fn queue_action(&self, app_id: &str, action: &str, correlation_id: &str) -> usize {
        let mut plugins = self.plugins.lock().await;
        let mut delivered = 0;
        let mut failures = Vec::new();

        for (name, proxy) in plugins.iter_mut() {
            if !proxy.has_action_app_id(app_id) {
                continue;
            }
            match proxy.queue_action(app_id, action, correlation_id).await {
                Ok(()) => delivered += 1,
                Err(e) => failures.push((name.clone(), e.to_string())),
            }
        }

        self.reconcile_failures(&mut plugins, failures);

        if app_id == CORE_APP_ID {
            self.handle_core_action(action).await;
        }
        debug!(app_id = %app_id, delivered, "Action fan-out complete");
        delivered
    }

    async fn handle_core_action(&self, action: &str) {
        let content = if is_filename_payload(action) {
            let path = self.paths.action_dir.join(action);
            match files::read_with_retry(&path, ACTION_READ_ATTEMPTS, ACTION_READ_DELAY).await {
                Ok(content) => content,
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "Unable to read CORE action");
                    return;
                }
            }
        } else {
            action.to_owned()
        };

        if let Some(receiver) = &self.event_receiver {
            receiver.receive_action(&content).await;
        }
        if content.contains(THREAT_RESET_MARKER) {
            self.health.lock().await.reset_threat_detection_health();
        }
    }

    /// Drop plugins whose registry file vanished; report the rest.
    fn reconcile_failures(&self, plugins: &mut BTreeMap<String, PluginProxy>, failures: Vec<(String, String)>) {
        for (name, reason) in failures {
            if self.paths.registry_file(&name).exists() {
                error!(plugin = %name, reason = %reason, "Failed to notify plugin");
            } else {
                plugins.remove(&name);
                info!(plugin = %name, "Plugin uninstalled, removed from registry");
            }
        }
    }

    pub async fn get_status(&self, plugin_name: &str) -> Result<Vec<StatusInfo>, ManagerError> {
        let mut plugins = self.plugins.lock().await;
        let proxy = plugins
            .get_mut(plugin_name)
            .ok_or_else(|| ManagerError::PluginNotRegistered(plugin_name.to_owned()))?;
        proxy.get_status().await.map_err(|source| ManagerError::Communication {
            plugin: plugin_name.to_owned(),
            source,
        })
    }

    pub async fn get_telemetry(&self, plugin_name: &str) -> Result<String, ManagerError> {
        let mut plugins = self.plugins.lock().await;
        let proxy = plugins
            .get_mut(plugin_name)
            .ok_or_else(|| ManagerError::PluginNotRegistered(plugin_name.to_owned()))?;
        proxy.get_telemetry().await.map_err(|source| ManagerError::Communication {
            plugin: plugin_name.to_owned(),
            source,
        })
    }

    pub async fn get_health(&self, plugin_name: &str) -> Result<String, ManagerError> {
        let mut plugins = self.plugins.lock().await;
        let proxy = plugins
            .get_mut(plugin_name)
            .ok_or_else(|| ManagerError::PluginNotRegistered(plugin_name.to_owned()))?;
        proxy.get_health().await.map_err(|source| ManagerError::Communication {
            plugin: plugin_name.to_owned(),
            source,
        })
    }

    /// Query a plugin's health and classify it.
    ///
    /// Returns the status and whether the plugin's health is now missing.
    /// Plugins with neither health flag are not queried.
    pub async fn get_health_status_for_plugin(
        &self,
        plugin_name: &str,
        prev_health_missing: bool,
    ) -> Result<(PluginHealthStatus, bool), ManagerError> {
        let mut plugins = self.plugins.lock().await;
        let proxy = plugins
            .get_mut(plugin_name)
            .ok_or_else(|| ManagerError::PluginNotRegistered(plugin_name.to_owned()))?;

        let health_type = HealthType::from_flags(proxy.service_health(), proxy.threat_service_health());
        let display_name = proxy.display_name().to_owned();
        if health_type == HealthType::None {
            let status = PluginHealthStatus::new(health_type, HEALTH_GOOD_INFORMATIONAL, display_name);
            return Ok((status, false));
        }

        match proxy.get_health().await {
            Ok(reply) => {
                if prev_health_missing {
                    info!(plugin = %plugin_name, "Plugin health reported again");
                }
                let mut status = parse_health_reply(plugin_name, &reply);
                status.health_type = health_type;
                status.display_name = display_name;
                Ok((status, false))
            }
            Err(e) => {
                if !prev_health_missing {
                    warn!(plugin = %plugin_name, error = %e, "Plugin health missing");
                }
                Ok((PluginHealthStatus::new(health_type, HEALTH_MISSING, display_name), true))
            }
        }
    }

    /// Whether an update is running, or finished less than `period_seconds` ago.
    pub fn update_ongoing_with_grace_period(&self, period_seconds: u64, now: SystemTime) -> bool {
        let mut last_seen = self
            .last_update_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if self.paths.update_marker.exists() {
            *last_seen = Some(now);
            return true;
        }

        last_seen.is_some_and(|seen| {
            now.duration_since(seen)
                .map_or(true, |elapsed| elapsed <= Duration::from_secs(period_seconds))
        })
    }
}

/// Parse a `GetHealth` reply such as
/// `{"Health": 0, "activeHeartbeat": true, "activeHeartbeatUtmId": "..", "Isolation": 1}`.
///
/// Anything unparsable is reported as plain good health.
fn parse_health_reply(plugin_name: &str, reply: &str) -> PluginHealthStatus {
    let fallback = PluginHealthStatus {
        health_value: HEALTH_GOOD,
        ..PluginHealthStatus::default()
    };

    let document: Value = match serde_json::from_str(reply) {
        Ok(document) => document,
        Err(e) => {
            warn!(plugin = %plugin_name, error = %e, "Unparsable health reply");
            return fallback;
        }
    };

    let Some(health_value) = document
        .get("Health")
        .and_then(Value::as_u64)
        .and_then(|value| u32::try_from(value).ok())
    else {
        warn!(plugin = %plugin_name, "Health reply has no numeric Health field");
        return fallback;
    };

    let isolated = match document.get("Isolation") {
        Some(Value::Bool(isolated)) => *isolated,
        Some(Value::Number(n)) => n.as_u64() == Some(1),
        _ => false,
    };

    PluginHealthStatus {
        health_value,
        isolated,
        active_heartbeat: document
            .get("activeHeartbeat")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        active_heartbeat_utm_id: document
            .get("activeHeartbeatUtmId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned(),
        ..PluginHealthStatus::default()
    }
}
