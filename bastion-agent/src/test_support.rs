//! In-process plugin doubles for unit tests.

#![allow(clippy::unwrap_used)]

use crate::plugin_proxy::PluginConnector;
use async_trait::async_trait;
use bastion_lib::ipc::{IpcError, IpcResult, RequestChannel};
use bastion_lib::protocol::{Command, Message};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum PluginBehaviour {
    /// Acknowledge mutations, answer queries with healthy defaults.
    Healthy,
    /// Answer `GetHealth` with this JSON.
    Health(String),
    RemoteError(String),
    Unreachable,
    /// Sleep before answering like `Healthy`.
    Slow(Duration),
}

#[derive(Default)]
struct FakeState {
    behaviours: HashMap<String, PluginBehaviour>,
    requests: Vec<(String, Message)>,
}

/// Connector whose channels answer from a per-plugin script and record every request.
#[derive(Default, Clone)]
pub struct FakeConnector {
    state: Arc<Mutex<FakeState>>,
}

impl FakeConnector {
    pub fn set_behaviour(&self, plugin_name: &str, behaviour: PluginBehaviour) {
        self.state
            .lock()
            .unwrap()
            .behaviours
            .insert(plugin_name.to_owned(), behaviour);
    }

    pub fn requests(&self, plugin_name: &str) -> Vec<Message> {
        self.state
            .lock()
            .unwrap()
            .requests
            .iter()
            .filter(|(name, _)| name == plugin_name)
            .map(|(_, message)| message.clone())
            .collect()
    }

    pub fn calls(&self, plugin_name: &str, command: Command) -> usize {
        self.requests(plugin_name)
            .iter()
            .filter(|message| message.command() == command)
            .count()
    }
}

impl PluginConnector for FakeConnector {
    fn connect(&self, plugin_name: &str) -> Box<dyn RequestChannel> {
        Box::new(FakeChannel {
            plugin_name: plugin_name.to_owned(),
            state: Arc::clone(&self.state),
        })
    }
}

struct FakeChannel {
    plugin_name: String,
    state: Arc<Mutex<FakeState>>,
}

fn healthy_reply(request: &Message, health_json: &str) -> Message {
    match request.command() {
        Command::GetHealth => request.reply(vec![health_json.to_owned()]),
        Command::GetTelemetry => request.reply(vec!["{}".to_owned()]),
        Command::GetStatus => request.reply(vec![
            format!("<status app=\"{}\" ts=\"1\"/>", request.application_id),
            format!("<status app=\"{}\"/>", request.application_id),
        ]),
        _ => request.ack_reply(),
    }
}

#[async_trait]
impl RequestChannel for FakeChannel {
    async fn request(&mut self, message: &Message) -> IpcResult<Message> {
        let behaviour = {
            let mut state = self.state.lock().unwrap();
            state.requests.push((self.plugin_name.clone(), message.clone()));
            state
                .behaviours
                .get(&self.plugin_name)
                .cloned()
                .unwrap_or(PluginBehaviour::Healthy)
        };

        match behaviour {
            PluginBehaviour::Healthy => Ok(healthy_reply(message, r#"{"Health":0}"#)),
            PluginBehaviour::Health(json) => Ok(healthy_reply(message, &json)),
            PluginBehaviour::RemoteError(reason) => Ok(message.error_reply(reason)),
            PluginBehaviour::Unreachable => Err(IpcError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "plugin not listening",
            ))),
            PluginBehaviour::Slow(delay) => {
                tokio::time::sleep(delay).await;
                Ok(healthy_reply(message, r#"{"Health":0}"#))
            }
        }
    }

    fn endpoint(&self) -> &str {
        &self.plugin_name
    }
}
