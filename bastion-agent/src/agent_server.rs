//! Management endpoint serving plugin → agent requests.

use crate::event_receiver::EventReceiver;
use crate::health_status::{HealthStatus, HealthType, PluginHealthStatus};
use crate::plugin_manager::PluginManager;
use crate::policy_files::{self, is_safe_identifier};
use crate::status_cache::StatusCache;
use bastion_lib::ipc::{InterprocessServer, IpcConfig, IpcResult};
use bastion_lib::protocol::{Command, Message, NO_POLICY_AVAILABLE, REQUEST_NOT_SUPPORTED};
use bastion_lib::registry_entry::PluginRegistryEntry;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
struct ThreatHealthReport {
    #[serde(rename = "ThreatHealth")]
    threat_health: u32,
}

/// Turns plugin requests into registry, event and health updates.
pub struct AgentRequestHandler {
    manager: Arc<PluginManager>,
    health: Arc<Mutex<HealthStatus>>,
    events: Arc<dyn EventReceiver>,
    status_cache: Arc<StatusCache>,
}

impl AgentRequestHandler {
    pub fn new(
        manager: Arc<PluginManager>,
        health: Arc<Mutex<HealthStatus>>,
        events: Arc<dyn EventReceiver>,
        status_cache: Arc<StatusCache>,
    ) -> Self {
        Self {
            manager,
            health,
            events,
            status_cache,
        }
    }

    pub async fn handle(&self, request: Message) -> Message {
        let plugin = request.plugin_name.as_str();
        let app_id = request.application_id.as_str();

        if !is_safe_identifier(plugin) {
            warn!(plugin = ?plugin, command = %request.command(), "Rejected request with invalid plugin name");
            return request.error_reply(format!("invalid plugin name `{plugin}`"));
        }
        let uses_app_id = matches!(
            request.command(),
            Command::SendEvent | Command::SendStatus | Command::RequestPolicies
        );
        if uses_app_id && !is_safe_identifier(app_id) {
            warn!(plugin = %plugin, app_id = ?app_id, "Rejected request with invalid application id");
            return request.error_reply(format!("invalid application id `{app_id}`"));
        }

        match request.command() {
            Command::RegisterPlugin => {
                let path = self.manager.paths().registry_file(plugin);
                match PluginRegistryEntry::load(&path) {
                    Ok(entry) => {
                        self.manager.register_and_configure(plugin, &entry).await;
                        request.ack_reply()
                    }
                    Err(e) => {
                        warn!(plugin = %plugin, error = %e, "Registration rejected");
                        request.error_reply(e.to_string())
                    }
                }
            }
            Command::SendEvent => match self.events.receive_event(app_id, request.first_payload()).await {
                Ok(()) => request.ack_reply(),
                Err(e) => {
                    warn!(plugin = %plugin, app_id = %app_id, error = %e, "Failed to store event");
                    request.error_reply(e.to_string())
                }
            },
            Command::SendStatus => {
                let status_xml = request.first_payload();
                let without_timestamps = request.payload.get(1).map_or(status_xml, String::as_str);
                match self.status_cache.update(app_id, status_xml, without_timestamps).await {
                    Ok(_) => request.ack_reply(),
                    Err(e) => {
                        warn!(plugin = %plugin, app_id = %app_id, error = %e, "Failed to store status");
                        request.error_reply(e.to_string())
                    }
                }
            }
            Command::RequestPolicies => self.request_policies(&request),
            Command::SendThreatHealth => {
                match serde_json::from_str::<ThreatHealthReport>(request.first_payload()) {
                    Ok(report) => {
                        let display_name = self
                            .manager
                            .display_name(plugin)
                            .await
                            .unwrap_or_else(|| plugin.to_owned());
                        let status = PluginHealthStatus::new(
                            HealthType::ThreatDetection,
                            report.threat_health,
                            display_name,
                        );
                        self.health.lock().await.add_plugin_health(plugin, status);
                        request.ack_reply()
                    }
                    Err(e) => {
                        warn!(plugin = %plugin, error = %e, "Invalid threat health report");
                        request.error_reply(format!("invalid threat health: {e}"))
                    }
                }
            }
            other => {
                debug!(command = %other, plugin = %plugin, "Unsupported request");
                request.error_reply(REQUEST_NOT_SUPPORTED)
            }
        }
    }

    /// Reply first, then deliver every current policy file to the requesting plugin.
    fn request_policies(&self, request: &Message) -> Message {
        let app_id = request.application_id.clone();
        let plugin = request.plugin_name.clone();
        let policies = policy_files::policy_files_for_app(&self.manager.paths().policy_dir, &app_id);
        if policies.is_empty() {
            debug!(plugin = %plugin, app_id = %app_id, "No policy available");
            return request.error_reply(NO_POLICY_AVAILABLE);
        }

        let manager = Arc::clone(&self.manager);
        tokio::spawn(async move {
            for policy in policies {
                let delivered = manager.apply_new_policy(&app_id, &policy, &plugin).await;
                debug!(plugin = %plugin, app_id = %app_id, policy = %policy, delivered, "Requested policy delivered");
            }
        });
        request.ack_reply()
    }
}

/// Server on the management endpoint.
pub struct AgentServer {
    server: InterprocessServer,
    handler: Arc<AgentRequestHandler>,
}

impl AgentServer {
    pub fn new(config: IpcConfig, handler: Arc<AgentRequestHandler>) -> Self {
        Self {
            server: InterprocessServer::new(config),
            handler,
        }
    }

    pub fn endpoint(&self) -> &str {
        self.server.endpoint()
    }

    pub async fn start(&mut self) -> IpcResult<()> {
        let handler = Arc::clone(&self.handler);
        self.server.set_handler(move |request| {
            let handler = Arc::clone(&handler);
            async move { handler.handle(request).await }
        });
        self.server.start().await?;
        info!(endpoint = %self.server.endpoint(), "Management endpoint ready");
        Ok(())
    }

    pub async fn stop(&mut self) {
        self.server.stop().await;
    }
}
