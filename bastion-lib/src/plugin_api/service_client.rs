//! Plugin → agent requests.

use super::error::PluginApiError;
use crate::config::IpcSettings;
use crate::ipc::{self, InterprocessClient, IpcConfig, RequestChannel};
use crate::protocol::{Command, Message, NO_POLICY_AVAILABLE, validate_reply};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// How often and how far apart a request is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    /// Round-trip retry applied to every request.
    pub const REQUEST: Self = Self {
        attempts: 2,
        delay: Duration::from_millis(200),
    };

    /// Outer retry around threat-health reports.
    pub const THREAT_HEALTH: Self = Self {
        attempts: 5,
        delay: Duration::from_millis(50),
    };
}

/// Outcome of a policy request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyRequest {
    /// The agent accepted the request and will deliver the policy.
    Requested,
    /// The agent has no policy for the application id yet.
    NoPolicyYet,
}

/// Client a plugin uses to talk to the management agent.
///
/// Requests from one client never overlap: the channel sits behind an async
/// mutex held for the whole retry loop.
pub struct ServiceClient {
    plugin_name: String,
    channel: Mutex<Box<dyn RequestChannel>>,
    request_retry: RetryPolicy,
    threat_health_retry: RetryPolicy,
}

impl ServiceClient {
    pub fn new(plugin_name: impl Into<String>, channel: Box<dyn RequestChannel>) -> Self {
        Self {
            plugin_name: plugin_name.into(),
            channel: Mutex::new(channel),
            request_retry: RetryPolicy::REQUEST,
            threat_health_retry: RetryPolicy::THREAT_HEALTH,
        }
    }

    /// Client for the agent endpoint inside `settings.socket_dir`.
    pub fn connect(plugin_name: impl Into<String>, settings: &IpcSettings) -> Self {
        let config = IpcConfig::from_settings(settings, ipc::agent_endpoint(&settings.socket_dir));
        Self::new(plugin_name, Box::new(InterprocessClient::new(config)))
    }

    #[must_use]
    pub const fn with_retry_policies(mut self, request: RetryPolicy, threat_health: RetryPolicy) -> Self {
        self.request_retry = request;
        self.threat_health_retry = threat_health;
        self
    }

    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    /// Report an event for `app_id`.
    pub async fn send_event(&self, app_id: &str, event_xml: &str) -> Result<(), PluginApiError> {
        let request = Message::request(
            Command::SendEvent,
            &self.plugin_name,
            app_id,
            vec![event_xml.to_owned()],
        );
        self.send_request(&request, true).await.map(|_| ())
    }

    /// Report a status document; the timestamp-free form lets the agent skip unchanged statuses.
    pub async fn send_status(
        &self,
        app_id: &str,
        status_xml: &str,
        status_without_timestamps: &str,
    ) -> Result<(), PluginApiError> {
        let request = Message::request(
            Command::SendStatus,
            &self.plugin_name,
            app_id,
            vec![status_xml.to_owned(), status_without_timestamps.to_owned()],
        );
        self.send_request(&request, true).await.map(|_| ())
    }

    /// Ask the agent to (re)deliver the current policy for `app_id`.
    pub async fn request_policies(&self, app_id: &str) -> Result<PolicyRequest, PluginApiError> {
        let request = Message::request(Command::RequestPolicies, &self.plugin_name, app_id, Vec::new());
        match self.send_request(&request, true).await {
            Ok(_) => Ok(PolicyRequest::Requested),
            Err(PluginApiError::Remote(reason)) if reason == NO_POLICY_AVAILABLE => {
                debug!(plugin = %self.plugin_name, app_id = %app_id, "No policy available yet");
                Ok(PolicyRequest::NoPolicyYet)
            }
            Err(e) => Err(e),
        }
    }

    /// Announce this plugin to the agent.
    pub async fn register_with_agent(&self) -> Result<(), PluginApiError> {
        let request = Message::request(Command::RegisterPlugin, &self.plugin_name, "", Vec::new());
        self.send_request(&request, true).await?;
        info!(plugin = %self.plugin_name, "Registered with management agent");
        Ok(())
    }

    /// Report threat health as JSON, e.g. `{"ThreatHealth": 1}`.
    ///
    /// Only the final failure is logged.
    pub async fn send_threat_health(&self, health_json: &str) -> bool {
        let request = Message::request(
            Command::SendThreatHealth,
            &self.plugin_name,
            "",
            vec![health_json.to_owned()],
        );

        let attempts = self.threat_health_retry.attempts.max(1);
        for attempt in 1..=attempts {
            match self.send_request(&request, false).await {
                Ok(_) => return true,
                Err(e) if attempt == attempts => {
                    error!(plugin = %self.plugin_name, attempts, error = %e, "Failed to send threat health");
                }
                Err(_) => tokio::time::sleep(self.threat_health_retry.delay).await,
            }
        }
        false
    }

    /// Send one request and validate its reply, retrying transport failures.
    /// Retries are logged at debug level unless `warn_on_retry` is set.
    async fn send_request(&self, request: &Message, warn_on_retry: bool) -> Result<Message, PluginApiError> {
        let started = Instant::now();
        let attempts = self.request_retry.attempts.max(1);
        let mut channel = self.channel.lock().await;

        let mut attempt = 1;
        loop {
            match channel.request(request).await {
                Ok(reply) => {
                    validate_reply(request, &reply)?;
                    return Ok(reply);
                }
                Err(e) => {
                    let error = PluginApiError::from(e);
                    if attempt >= attempts {
                        return Err(PluginApiError::Exhausted {
                            attempts: attempt,
                            elapsed: started.elapsed(),
                            source: Box::new(error),
                        });
                    }
                    if warn_on_retry {
                        warn!(
                            endpoint = %channel.endpoint(),
                            command = %request.command(),
                            attempt,
                            error = %error,
                            "Request failed, retrying"
                        );
                    } else {
                        debug!(
                            endpoint = %channel.endpoint(),
                            command = %request.command(),
                            attempt,
                            error = %error,
                            "Request failed, retrying"
                        );
                    }
                    attempt += 1;
                    tokio::time::sleep(self.request_retry.delay).await;
                }
            }
        }
    }
}
