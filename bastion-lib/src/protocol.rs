//! Request/reply message exchanged between the management agent and plugins.
//!
//! Every request and every reply is a single [`Message`]. A reply echoes the
//! request's command; `ack` confirms that a state-mutating request was accepted
//! and `error` carries a failure reason. The struct is a hand-written `prost`
//! message so no protobuf compiler is needed at build time.

use thiserror::Error;

/// Error text the agent uses when a plugin asks for a policy that has not arrived yet.
pub const NO_POLICY_AVAILABLE: &str = "No Policy Available";

/// Error text for commands a server does not handle.
pub const REQUEST_NOT_SUPPORTED: &str = "Request not supported";

/// Operation requested by a [`Message`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Command {
    Unknown = 0,
    // plugin -> agent
    RegisterPlugin = 1,
    SendEvent = 2,
    SendStatus = 3,
    RequestPolicies = 4,
    SendThreatHealth = 5,
    // agent -> plugin
    ApplyPolicy = 6,
    DoAction = 7,
    GetStatus = 8,
    GetTelemetry = 9,
    GetHealth = 10,
}

impl Command {
    /// Whether the receiver must acknowledge the request.
    pub const fn requires_ack(self) -> bool {
        matches!(
            self,
            Self::RegisterPlugin
                | Self::SendEvent
                | Self::SendStatus
                | Self::RequestPolicies
                | Self::SendThreatHealth
                | Self::ApplyPolicy
                | Self::DoAction
        )
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// The request/reply envelope.
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct Message {
    #[prost(enumeration = "Command", tag = "1")]
    pub command: i32,
    #[prost(string, tag = "2")]
    pub plugin_name: String,
    #[prost(string, tag = "3")]
    pub application_id: String,
    #[prost(string, repeated, tag = "4")]
    pub payload: Vec<String>,
    #[prost(string, tag = "5")]
    pub correlation_id: String,
    #[prost(bool, tag = "6")]
    pub ack: bool,
    #[prost(string, tag = "7")]
    pub error: String,
}

impl Message {
    /// Build a request for `command`.
    pub fn request(
        command: Command,
        plugin_name: impl Into<String>,
        application_id: impl Into<String>,
        payload: Vec<String>,
    ) -> Self {
        Self {
            command: command.into(),
            plugin_name: plugin_name.into(),
            application_id: application_id.into(),
            payload,
            ..Self::default()
        }
    }

    /// Attach a correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    /// A reply carrying `payload` for this request.
    pub fn reply(&self, payload: Vec<String>) -> Self {
        Self {
            command: self.command,
            plugin_name: self.plugin_name.clone(),
            application_id: self.application_id.clone(),
            payload,
            correlation_id: self.correlation_id.clone(),
            ack: false,
            error: String::new(),
        }
    }

    /// An acknowledging reply for this request.
    pub fn ack_reply(&self) -> Self {
        Self {
            ack: true,
            ..self.reply(Vec::new())
        }
    }

    /// An error reply for this request. Never acknowledged.
    pub fn error_reply(&self, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            ..self.reply(Vec::new())
        }
    }

    /// First payload entry, or an empty string.
    pub fn first_payload(&self) -> &str {
        self.payload.first().map_or("", String::as_str)
    }
}

/// Reasons a reply does not satisfy its request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ReplyError {
    #[error("reply command {actual} does not match request command {expected}")]
    CommandMismatch { expected: Command, actual: i32 },

    #[error("{0}")]
    Remote(String),

    #[error("{command} request was not acknowledged")]
    MissingAck { command: Command },
}

/// Check a reply against its request.
///
/// Order matters: a command mismatch wins over an error text, and an error text
/// wins over a missing ack.
pub fn validate_reply(request: &Message, reply: &Message) -> Result<(), ReplyError> {
    if reply.command != request.command {
        return Err(ReplyError::CommandMismatch {
            expected: request.command(),
            actual: reply.command,
        });
    }
    if !reply.error.is_empty() {
        return Err(ReplyError::Remote(reply.error.clone()));
    }
    if request.command().requires_ack() && !reply.ack {
        return Err(ReplyError::MissingAck {
            command: request.command(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> Message {
        Message::request(Command::SendEvent, "av", "SAV", vec!["<event/>".to_owned()])
    }

    #[test]
    fn ack_reply_is_valid() {
        let request = request();
        assert_eq!(validate_reply(&request, &request.ack_reply()), Ok(()));
    }

    #[test]
    fn mismatched_command_is_rejected() {
        let request = request();
        let mut reply = request.ack_reply();
        reply.command = Command::SendStatus.into();
        assert!(matches!(
            validate_reply(&request, &reply),
            Err(ReplyError::CommandMismatch {
                expected: Command::SendEvent,
                ..
            })
        ));
    }

    #[test]
    fn missing_ack_is_rejected_for_mutating_requests() {
        let request = request();
        assert_eq!(
            validate_reply(&request, &request.reply(Vec::new())),
            Err(ReplyError::MissingAck {
                command: Command::SendEvent
            })
        );
    }

    #[test]
    fn queries_do_not_need_ack() {
        let request = Message::request(Command::GetHealth, "av", "", Vec::new());
        let reply = request.reply(vec!["{\"Health\":0}".to_owned()]);
        assert_eq!(validate_reply(&request, &reply), Ok(()));
    }

    #[test]
    fn error_text_is_surfaced() {
        let request = Message::request(Command::RequestPolicies, "av", "SAV", Vec::new());
        let reply = request.error_reply(NO_POLICY_AVAILABLE);
        assert!(!reply.ack);
        assert_eq!(
            validate_reply(&request, &reply),
            Err(ReplyError::Remote(NO_POLICY_AVAILABLE.to_owned()))
        );
    }

    #[test]
    fn unknown_wire_command_decodes_to_default() {
        let message = Message {
            command: 99,
            ..Message::default()
        };
        assert_eq!(message.command(), Command::Unknown);
    }
}
