//! Agent-side handle for one plugin.

use bastion_lib::config::IpcSettings;
use bastion_lib::ipc::{self, InterprocessClient, IpcConfig, RequestChannel};
use bastion_lib::plugin_api::{PluginApiError, StatusInfo};
use bastion_lib::protocol::{Command, Message, validate_reply};
use bastion_lib::registry_entry::PluginRegistryEntry;
use tracing::debug;

/// Opens request channels to plugins.
pub trait PluginConnector: Send + Sync {
    fn connect(&self, plugin_name: &str) -> Box<dyn RequestChannel>;
}

/// Connects to the plugin endpoints inside the configured socket directory.
#[derive(Debug, Clone)]
pub struct SocketPluginConnector {
    settings: IpcSettings,
}

impl SocketPluginConnector {
    pub const fn new(settings: IpcSettings) -> Self {
        Self { settings }
    }
}

impl PluginConnector for SocketPluginConnector {
    fn connect(&self, plugin_name: &str) -> Box<dyn RequestChannel> {
        let endpoint = ipc::plugin_endpoint(&self.settings.socket_dir, plugin_name);
        Box::new(InterprocessClient::new(IpcConfig::from_settings(
            &self.settings,
            endpoint,
        )))
    }
}

/// A registered plugin and the app ids it consumes.
pub struct PluginProxy {
    name: String,
    policy_app_ids: Vec<String>,
    action_app_ids: Vec<String>,
    status_app_ids: Vec<String>,
    service_health: bool,
    threat_service_health: bool,
    display_name: String,
    channel: Box<dyn RequestChannel>,
}

impl PluginProxy {
    pub fn new(name: impl Into<String>, channel: Box<dyn RequestChannel>) -> Self {
        let name = name.into();
        Self {
            display_name: name.clone(),
            name,
            policy_app_ids: Vec::new(),
            action_app_ids: Vec::new(),
            status_app_ids: Vec::new(),
            service_health: false,
            threat_service_health: false,
            channel,
        }
    }

    /// Apply the routing and health settings from a registry entry.
    pub fn configure(&mut self, entry: &PluginRegistryEntry) {
        self.policy_app_ids.clone_from(&entry.policy_app_ids);
        self.action_app_ids.clone_from(&entry.action_app_ids);
        self.status_app_ids.clone_from(&entry.status_app_ids);
        self.service_health = entry.service_health;
        self.threat_service_health = entry.threat_service_health;
        entry.display_name().clone_into(&mut self.display_name);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub const fn service_health(&self) -> bool {
        self.service_health
    }

    pub const fn threat_service_health(&self) -> bool {
        self.threat_service_health
    }

    pub fn status_app_ids(&self) -> &[String] {
        &self.status_app_ids
    }

    pub fn has_policy_app_id(&self, app_id: &str) -> bool {
        self.policy_app_ids.iter().any(|id| id == app_id)
    }

    pub fn has_action_app_id(&self, app_id: &str) -> bool {
        self.action_app_ids.iter().any(|id| id == app_id)
    }

    pub async fn apply_new_policy(&mut self, app_id: &str, policy: &str) -> Result<(), PluginApiError> {
        let request = Message::request(
            Command::ApplyPolicy,
            &self.name,
            app_id,
            vec![policy.to_owned()],
        );
        self.send(&request).await.map(|_| ())
    }

    pub async fn queue_action(
        &mut self,
        app_id: &str,
        action: &str,
        correlation_id: &str,
    ) -> Result<(), PluginApiError> {
        let request = Message::request(Command::DoAction, &self.name, app_id, vec![action.to_owned()])
            .with_correlation_id(correlation_id);
        self.send(&request).await.map(|_| ())
    }

    /// Status for every status app id the plugin declared.
    pub async fn get_status(&mut self) -> Result<Vec<StatusInfo>, PluginApiError> {
        let mut statuses = Vec::with_capacity(self.status_app_ids.len());
        for app_id in self.status_app_ids.clone() {
            let request = Message::request(Command::GetStatus, &self.name, &app_id, Vec::new());
            let mut reply = self.send(&request).await?;
            let status_xml = reply.payload.first().cloned().unwrap_or_default();
            let status_without_timestamps_xml = if reply.payload.len() > 1 {
                reply.payload.swap_remove(1)
            } else {
                status_xml.clone()
            };
            statuses.push(StatusInfo {
                status_xml,
                status_without_timestamps_xml,
                app_id,
            });
        }
        Ok(statuses)
    }

    pub async fn get_telemetry(&mut self) -> Result<String, PluginApiError> {
        let request = Message::request(Command::GetTelemetry, &self.name, "", Vec::new());
        let reply = self.send(&request).await?;
        Ok(reply.first_payload().to_owned())
    }

    pub async fn get_health(&mut self) -> Result<String, PluginApiError> {
        let request = Message::request(Command::GetHealth, &self.name, "", Vec::new());
        let reply = self.send(&request).await?;
        Ok(reply.first_payload().to_owned())
    }

    async fn send(&mut self, request: &Message) -> Result<Message, PluginApiError> {
        debug!(plugin = %self.name, command = %request.command(), "Sending request to plugin");
        let reply = self.channel.request(request).await?;
        validate_reply(request, &reply)?;
        Ok(reply)
    }
}

impl std::fmt::Debug for PluginProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginProxy")
            .field("name", &self.name)
            .field("endpoint", &self.channel.endpoint())
            .field("policy_app_ids", &self.policy_app_ids)
            .field("action_app_ids", &self.action_app_ids)
            .finish_non_exhaustive()
    }
}
