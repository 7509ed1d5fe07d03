use async_trait::async_trait;

/// Status document returned by a plugin for one application id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusInfo {
    pub status_xml: String,
    /// Same document with volatile timestamps removed, used for change detection
    pub status_without_timestamps_xml: String,
    pub app_id: String,
}

/// Plugin code invoked by the [`CallbackServer`](super::CallbackServer).
///
/// Errors are turned into error replies at the dispatch boundary; they never
/// stop the server.
#[async_trait]
pub trait PluginCallback: Send + Sync {
    /// A new policy arrived for `app_id`.
    async fn apply_new_policy_with_app_id(&self, app_id: &str, policy: &str) -> anyhow::Result<()>;

    /// An action arrived. `correlation_id` may be empty.
    async fn queue_action_with_correlation(
        &self,
        action: &str,
        correlation_id: &str,
    ) -> anyhow::Result<()>;

    async fn get_status(&self, app_id: &str) -> anyhow::Result<StatusInfo>;

    /// Telemetry as a JSON document.
    async fn get_telemetry(&self) -> anyhow::Result<String>;

    /// Health as a JSON document, e.g. `{"Health": 0}`.
    async fn get_health(&self) -> anyhow::Result<String>;

    /// The server is shutting down.
    async fn on_shutdown(&self) {}
}
