use crate::ipc::IpcError;
use crate::protocol::{Command, ReplyError};
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the plugin-side API.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PluginApiError {
    #[error("Protocol error: reply command {actual} does not match request command {expected}")]
    CommandMismatch { expected: Command, actual: i32 },

    #[error("Protocol error: {command} request was not acknowledged")]
    MissingAck { command: Command },

    #[error("Agent returned error: {0}")]
    Remote(String),

    #[error("Timed out during {operation}")]
    Timeout { operation: &'static str },

    #[error("Transport error: {0}")]
    Transport(#[source] IpcError),

    #[error("Request failed after {attempts} attempts in {elapsed:?}: {source}")]
    Exhausted {
        attempts: u32,
        elapsed: Duration,
        #[source]
        source: Box<PluginApiError>,
    },
}

impl PluginApiError {
    /// Transport-level failures are the only ones worth retrying.
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Transport(_))
    }

    /// Whether the failure, or the failure it wraps, is a timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Exhausted { source, .. } => source.is_timeout(),
            _ => false,
        }
    }

    /// Whether the reply violated the protocol contract.
    pub const fn is_protocol(&self) -> bool {
        matches!(self, Self::CommandMismatch { .. } | Self::MissingAck { .. })
    }
}

impl From<IpcError> for PluginApiError {
    fn from(error: IpcError) -> Self {
        match error {
            IpcError::Timeout { operation } => Self::Timeout { operation },
            other => Self::Transport(other),
        }
    }
}

impl From<ReplyError> for PluginApiError {
    fn from(error: ReplyError) -> Self {
        match error {
            ReplyError::CommandMismatch { expected, actual } => {
                Self::CommandMismatch { expected, actual }
            }
            ReplyError::MissingAck { command } => Self::MissingAck { command },
            ReplyError::Remote(reason) => Self::Remote(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipc_timeouts_stay_distinct() {
        let error = PluginApiError::from(IpcError::Timeout { operation: "read" });
        assert!(error.is_timeout());
        assert!(error.is_transport());

        let wrapped = PluginApiError::Exhausted {
            attempts: 2,
            elapsed: Duration::from_millis(400),
            source: Box::new(error),
        };
        assert!(wrapped.is_timeout());
        assert!(!wrapped.is_transport());
    }

    #[test]
    fn reply_errors_are_not_retryable() {
        let error = PluginApiError::from(ReplyError::MissingAck {
            command: Command::SendEvent,
        });
        assert!(error.is_protocol());
        assert!(!error.is_transport());
    }
}
