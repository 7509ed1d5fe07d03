//! Agent → plugin requests, served inside the plugin process.

use super::callback::PluginCallback;
use crate::config::{IpcSettings, PathsConfig};
use crate::files;
use crate::ipc::{self, InterprocessServer, IpcConfig, IpcResult};
use crate::protocol::{Command, Message, REQUEST_NOT_SUPPORTED};
use crate::telemetry::TelemetryStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const FILE_READ_ATTEMPTS: u32 = 3;
const FILE_READ_DELAY: Duration = Duration::from_millis(500);

/// Whether a policy/action payload names a file in the drop directory rather
/// than carrying the document inline.
pub fn is_filename_payload(payload: &str) -> bool {
    let has_document_extension = payload
        .rsplit_once('.')
        .is_some_and(|(stem, ext)| !stem.is_empty() && (ext == "xml" || ext == "json"));

    has_document_extension
        && !payload.contains(['/', '\\', '<', '>'])
        && !payload.chars().any(char::is_whitespace)
}

/// Dispatches one request to the plugin callback.
#[derive(Clone)]
struct Dispatcher {
    callback: Arc<dyn PluginCallback>,
    policy_dir: PathBuf,
    action_dir: PathBuf,
    file_read_attempts: u32,
    file_read_delay: Duration,
}

impl Dispatcher {
    /// Run the callback on its own task so a panicking plugin yields an error reply.
    async fn handle(&self, request: Message) -> Message {
        let dispatcher = self.clone();
        let dispatched = request.clone();
        let outcome = tokio::spawn(async move { dispatcher.dispatch(&dispatched).await }).await;

        match outcome {
            Ok(Ok(reply)) => reply,
            Err(e) => {
                error!(
                    command = %request.command(),
                    app_id = %request.application_id,
                    error = %e,
                    "Plugin callback panicked"
                );
                request.error_reply(format!("plugin callback panicked: {e}"))
            }
            Ok(Err(e)) => {
                let reason = format!("{e:#}");
                warn!(
                    command = %request.command(),
                    app_id = %request.application_id,
                    error = %reason,
                    "Plugin callback failed"
                );
                request.error_reply(reason)
            }
        }
    }

    async fn dispatch(&self, request: &Message) -> anyhow::Result<Message> {
        match request.command() {
            Command::ApplyPolicy => {
                let policy = self.resolve_payload(request.first_payload(), &self.policy_dir).await?;
                self.callback
                    .apply_new_policy_with_app_id(&request.application_id, &policy)
                    .await?;
                Ok(request.ack_reply())
            }
            Command::DoAction => {
                let action = self.resolve_payload(request.first_payload(), &self.action_dir).await?;
                self.callback
                    .queue_action_with_correlation(&action, &request.correlation_id)
                    .await?;
                Ok(request.ack_reply())
            }
            Command::GetStatus => {
                let status = self.callback.get_status(&request.application_id).await?;
                Ok(request.reply(vec![status.status_xml, status.status_without_timestamps_xml]))
            }
            Command::GetTelemetry => {
                let telemetry = self.callback.get_telemetry().await?;
                Ok(request.reply(vec![telemetry]))
            }
            Command::GetHealth => {
                let health = self.callback.get_health().await?;
                Ok(request.reply(vec![health]))
            }
            other => {
                debug!(command = %other, "Unsupported request");
                Ok(request.error_reply(REQUEST_NOT_SUPPORTED))
            }
        }
    }

    async fn resolve_payload(&self, payload: &str, dir: &Path) -> anyhow::Result<String> {
        if !is_filename_payload(payload) {
            return Ok(payload.to_owned());
        }
        let path = dir.join(payload);
        let contents = files::read_with_retry(&path, self.file_read_attempts, self.file_read_delay)
            .await
            .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
        Ok(contents)
    }
}

/// Server receiving policies, actions and queries from the agent.
pub struct CallbackServer {
    server: InterprocessServer,
    dispatcher: Arc<Dispatcher>,
    telemetry: Option<Arc<TelemetryStore>>,
    shutdown_requested: Arc<AtomicBool>,
}

impl CallbackServer {
    pub fn new(config: IpcConfig, callback: Arc<dyn PluginCallback>, paths: &PathsConfig) -> Self {
        Self {
            server: InterprocessServer::new(config),
            dispatcher: Arc::new(Dispatcher {
                callback,
                policy_dir: paths.policy_dir.clone(),
                action_dir: paths.action_dir.clone(),
                file_read_attempts: FILE_READ_ATTEMPTS,
                file_read_delay: FILE_READ_DELAY,
            }),
            telemetry: None,
            shutdown_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Server on the standard endpoint for `plugin_name`.
    pub fn for_plugin(
        plugin_name: &str,
        settings: &IpcSettings,
        paths: &PathsConfig,
        callback: Arc<dyn PluginCallback>,
    ) -> Self {
        let endpoint = ipc::plugin_endpoint(&settings.socket_dir, plugin_name);
        Self::new(IpcConfig::from_settings(settings, endpoint), callback, paths)
    }

    /// Telemetry persisted when the server shuts down.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Arc<TelemetryStore>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn endpoint(&self) -> &str {
        self.server.endpoint()
    }

    pub async fn start(&mut self) -> IpcResult<()> {
        let dispatcher = Arc::clone(&self.dispatcher);
        self.server.set_handler(move |request| {
            let dispatcher = Arc::clone(&dispatcher);
            async move { dispatcher.handle(request).await }
        });
        self.server.start().await
    }

    /// Persist telemetry, notify the plugin, then stop serving. Idempotent.
    pub async fn shutdown(&mut self) {
        if self.shutdown_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(telemetry) = &self.telemetry {
            if let Err(e) = telemetry.save() {
                warn!(error = %e, "Failed to persist telemetry");
            }
        }
        self.dispatcher.callback.on_shutdown().await;
        self.server.stop().await;
        info!(endpoint = %self.server.endpoint(), "Callback server shut down");
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::plugin_api::StatusInfo;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingPlugin {
        policies: Mutex<Vec<(String, String)>>,
        actions: Mutex<Vec<(String, String)>>,
        fail: bool,
        panic_on_policy: bool,
        shut_down: AtomicBool,
    }

    #[async_trait]
    impl PluginCallback for RecordingPlugin {
        async fn apply_new_policy_with_app_id(&self, app_id: &str, policy: &str) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("policy rejected");
            }
            if self.panic_on_policy {
                panic!("policy parser bug");
            }
            self.policies
                .lock()
                .unwrap()
                .push((app_id.to_owned(), policy.to_owned()));
            Ok(())
        }

        async fn queue_action_with_correlation(
            &self,
            action: &str,
            correlation_id: &str,
        ) -> anyhow::Result<()> {
            self.actions
                .lock()
                .unwrap()
                .push((action.to_owned(), correlation_id.to_owned()));
            Ok(())
        }

        async fn get_status(&self, app_id: &str) -> anyhow::Result<StatusInfo> {
            Ok(StatusInfo {
                status_xml: format!("<status app=\"{app_id}\" ts=\"1\"/>"),
                status_without_timestamps_xml: format!("<status app=\"{app_id}\"/>"),
                app_id: app_id.to_owned(),
            })
        }

        async fn get_telemetry(&self) -> anyhow::Result<String> {
            Ok(r#"{"scans":3}"#.to_owned())
        }

        async fn get_health(&self) -> anyhow::Result<String> {
            Ok(r#"{"Health":0}"#.to_owned())
        }

        async fn on_shutdown(&self) {
            self.shut_down.store(true, Ordering::SeqCst);
        }
    }

    fn dispatcher(plugin: Arc<RecordingPlugin>, dir: &TempDir) -> Dispatcher {
        Dispatcher {
            callback: plugin,
            policy_dir: dir.path().join("policy"),
            action_dir: dir.path().join("action"),
            file_read_attempts: FILE_READ_ATTEMPTS,
            file_read_delay: Duration::from_millis(20),
        }
    }

    #[test]
    fn filename_payload_detection() {
        assert!(is_filename_payload("SAV-1_policy.xml"));
        assert!(is_filename_payload("CORE_action_1234.json"));
        assert!(!is_filename_payload("<policy/>"));
        assert!(!is_filename_payload("../etc/passwd.xml"));
        assert!(!is_filename_payload("with space.xml"));
        assert!(!is_filename_payload("policy.txt"));
        assert!(!is_filename_payload(".xml"));
        assert!(!is_filename_payload(""));
    }

    #[tokio::test]
    async fn inline_policy_is_applied() {
        let dir = TempDir::new().unwrap();
        let plugin = Arc::new(RecordingPlugin::default());
        let dispatcher = dispatcher(Arc::clone(&plugin), &dir);

        let request = Message::request(Command::ApplyPolicy, "av", "SAV", vec!["<policy/>".to_owned()]);
        let reply = dispatcher.handle(request).await;

        assert!(reply.ack);
        assert_eq!(
            *plugin.policies.lock().unwrap(),
            vec![("SAV".to_owned(), "<policy/>".to_owned())]
        );
    }

    #[tokio::test]
    async fn filename_policy_is_read_from_policy_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("policy")).unwrap();
        std::fs::write(dir.path().join("policy/SAV_policy.xml"), "<from-file/>").unwrap();
        let plugin = Arc::new(RecordingPlugin::default());
        let dispatcher = dispatcher(Arc::clone(&plugin), &dir);

        let request = Message::request(
            Command::ApplyPolicy,
            "av",
            "SAV",
            vec!["SAV_policy.xml".to_owned()],
        );
        assert!(dispatcher.handle(request).await.ack);
        assert_eq!(plugin.policies.lock().unwrap()[0].1, "<from-file/>");
    }

    #[tokio::test]
    async fn late_action_file_is_retried() {
        let dir = TempDir::new().unwrap();
        let action_dir = dir.path().join("action");
        std::fs::create_dir_all(&action_dir).unwrap();
        let plugin = Arc::new(RecordingPlugin::default());
        let dispatcher = dispatcher(Arc::clone(&plugin), &dir);

        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            std::fs::write(action_dir.join("SAV_action_1.xml"), "<scan/>").unwrap();
        });

        let request = Message::request(
            Command::DoAction,
            "av",
            "SAV",
            vec!["SAV_action_1.xml".to_owned()],
        )
        .with_correlation_id("corr-1");
        let reply = dispatcher.handle(request).await;
        writer.await.unwrap();

        assert!(reply.ack);
        assert_eq!(
            *plugin.actions.lock().unwrap(),
            vec![("<scan/>".to_owned(), "corr-1".to_owned())]
        );
    }

    #[tokio::test]
    async fn missing_file_becomes_error_reply() {
        let dir = TempDir::new().unwrap();
        let plugin = Arc::new(RecordingPlugin::default());
        let dispatcher = dispatcher(plugin, &dir);

        let request = Message::request(Command::DoAction, "av", "SAV", vec!["gone.xml".to_owned()]);
        let reply = dispatcher.handle(request).await;
        assert!(!reply.ack);
        assert!(reply.error.contains("gone.xml"));
    }

    #[tokio::test]
    async fn callback_errors_become_error_replies() {
        let dir = TempDir::new().unwrap();
        let plugin = Arc::new(RecordingPlugin {
            fail: true,
            ..RecordingPlugin::default()
        });
        let dispatcher = dispatcher(plugin, &dir);

        let request = Message::request(Command::ApplyPolicy, "av", "SAV", vec!["<policy/>".to_owned()]);
        let reply = dispatcher.handle(request).await;
        assert!(!reply.ack);
        assert_eq!(reply.error, "policy rejected");
        assert_eq!(reply.command(), Command::ApplyPolicy);
    }

    #[tokio::test]
    async fn panicking_callback_becomes_error_reply() {
        let dir = TempDir::new().unwrap();
        let plugin = Arc::new(RecordingPlugin {
            panic_on_policy: true,
            ..RecordingPlugin::default()
        });
        let dispatcher = dispatcher(plugin, &dir);

        let reply = dispatcher
            .handle(Message::request(Command::ApplyPolicy, "av", "SAV", vec!["<policy/>".to_owned()]))
            .await;
        assert!(!reply.ack);
        assert!(reply.error.starts_with("plugin callback panicked"));
        assert_eq!(reply.command(), Command::ApplyPolicy);

        let health = dispatcher
            .handle(Message::request(Command::GetHealth, "av", "", Vec::new()))
            .await;
        assert_eq!(health.first_payload(), r#"{"Health":0}"#);
    }

    #[tokio::test]
    async fn queries_wrap_callback_results() {
        let dir = TempDir::new().unwrap();
        let dispatcher = dispatcher(Arc::new(RecordingPlugin::default()), &dir);

        let status = dispatcher
            .handle(Message::request(Command::GetStatus, "av", "SAV", Vec::new()))
            .await;
        assert_eq!(status.payload.len(), 2);
        assert_eq!(status.payload[1], "<status app=\"SAV\"/>");

        let health = dispatcher
            .handle(Message::request(Command::GetHealth, "av", "", Vec::new()))
            .await;
        assert_eq!(health.first_payload(), r#"{"Health":0}"#);

        let telemetry = dispatcher
            .handle(Message::request(Command::GetTelemetry, "av", "", Vec::new()))
            .await;
        assert_eq!(telemetry.first_payload(), r#"{"scans":3}"#);
    }

    #[tokio::test]
    async fn agent_commands_are_not_supported() {
        let dir = TempDir::new().unwrap();
        let dispatcher = dispatcher(Arc::new(RecordingPlugin::default()), &dir);
        let reply = dispatcher
            .handle(Message::request(Command::SendEvent, "av", "SAV", Vec::new()))
            .await;
        assert_eq!(reply.error, REQUEST_NOT_SUPPORTED);
    }

    #[tokio::test]
    async fn shutdown_persists_telemetry_and_notifies_plugin() {
        let dir = TempDir::new().unwrap();
        let plugin = Arc::new(RecordingPlugin::default());
        let telemetry = Arc::new(TelemetryStore::with_file(dir.path().join("telemetry.json")));
        telemetry.increment("scans", 1);

        let config = IpcConfig {
            endpoint_path: ipc::plugin_endpoint(dir.path(), "av"),
            ..IpcConfig::default()
        };
        let mut server = CallbackServer::new(
            config,
            Arc::clone(&plugin) as Arc<dyn PluginCallback>,
            &PathsConfig::under(dir.path()),
        )
        .with_telemetry(Arc::clone(&telemetry));

        server.shutdown().await;
        server.shutdown().await;

        assert!(server.shutdown_requested());
        assert!(plugin.shut_down.load(Ordering::SeqCst));
        assert!(dir.path().join("telemetry.json").exists());
    }
}
