//! Periodic health polling.

use crate::health_status::{HEALTH_GOOD_INFORMATIONAL, HEALTH_MISSING, HealthStatus, RenderedHealth};
use crate::outbreak::OutbreakModeController;
use crate::plugin_manager::{ManagerError, PluginManager};
use bastion_lib::config::{HealthConfig, PathsConfig};
use bastion_lib::files;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Polls every registered plugin and publishes the aggregated health.
pub struct HealthTask {
    manager: Arc<PluginManager>,
    health: Arc<Mutex<HealthStatus>>,
    outbreak: Arc<OutbreakModeController>,
    paths: PathsConfig,
    config: HealthConfig,
    missing: HashMap<String, bool>,
}

impl HealthTask {
    pub fn new(
        manager: Arc<PluginManager>,
        health: Arc<Mutex<HealthStatus>>,
        outbreak: Arc<OutbreakModeController>,
        paths: PathsConfig,
        config: HealthConfig,
    ) -> Self {
        Self {
            manager,
            health,
            outbreak,
            paths,
            config,
            missing: HashMap::new(),
        }
    }

    /// Run one polling cycle and write whatever changed.
    pub async fn run_once(&mut self) -> anyhow::Result<RenderedHealth> {
        let update_ongoing = self
            .manager
            .update_ongoing_with_grace_period(self.config.update_grace_period_seconds, SystemTime::now());

        let names = self.manager.registered_plugin_names().await;
        self.missing.retain(|name, _| names.contains(name));

        let mut statuses = Vec::with_capacity(names.len());
        for name in names {
            let prev_missing = self.missing.get(&name).copied().unwrap_or(false);
            match self.manager.get_health_status_for_plugin(&name, prev_missing).await {
                Ok((mut status, missing)) => {
                    self.missing.insert(name.clone(), missing);
                    if update_ongoing && status.health_value == HEALTH_MISSING {
                        debug!(plugin = %name, "Update in progress, ignoring missing health");
                        status.health_value = HEALTH_GOOD_INFORMATIONAL;
                    }
                    statuses.push((name, status));
                }
                // removed since the names were listed
                Err(ManagerError::PluginNotRegistered(_)) => {
                    self.missing.remove(&name);
                }
                Err(e) => warn!(plugin = %name, error = %e, "Health query failed"),
            }
        }

        let rendered = {
            let mut health = self.health.lock().await;
            health.clear_service_health();
            for (name, status) in statuses {
                health.add_plugin_health(&name, status);
            }
            health.set_outbreak_mode(self.outbreak.is_active());
            health.update_overall_health_status();
            health.generate_health_status_xml()
        };

        if rendered.has_status_changed {
            files::write_atomically(&self.paths.health_status_file(), &rendered.status_xml).await?;
            debug!("Health status document written");
        }
        if rendered.has_overall_changed {
            files::write_atomically(&self.paths.overall_health_file(), &rendered.overall_json).await?;
            info!(overall = %rendered.overall_json, "Overall health changed");
        }
        Ok(rendered)
    }

    /// Poll every `poll_interval_seconds` until `shutdown` flips to true.
    pub fn spawn(mut self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let interval = Duration::from_secs(self.config.poll_interval_seconds);
        tokio::spawn(async move {
            info!(interval_seconds = interval.as_secs(), "Health task started");
            loop {
                if let Err(e) = self.run_once().await {
                    error!(error = %e, "Health cycle failed");
                }
                tokio::select! {
                    () = tokio::time::sleep(interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Health task stopped");
        })
    }
}
