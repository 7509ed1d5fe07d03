//! Local-socket request/reply transport between the management agent and plugins.
//!
//! Messages are protobuf-encoded [`Message`](crate::protocol::Message) values
//! carried in length-prefixed frames with a CRC32 integrity check. Endpoints are
//! Unix domain sockets on Unix and named pipes on Windows, both provided by the
//! `interprocess` crate.

pub mod codec;
pub mod interprocess_transport;

pub use codec::{IpcCodec, IpcError, IpcResult};
pub use interprocess_transport::{InterprocessClient, InterprocessServer, RequestChannel};

use crate::config::IpcSettings;
use std::path::Path;
use std::time::Duration;

/// File name of the management agent endpoint inside the socket directory.
pub const AGENT_ENDPOINT_NAME: &str = "management.ipc";

/// Sub-directory holding one endpoint per plugin.
pub const PLUGIN_ENDPOINT_DIR: &str = "plugins";

/// Transport configuration for a single endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcConfig {
    /// Endpoint path (Unix socket path or Windows pipe name)
    pub endpoint_path: String,
    /// Maximum frame size in bytes (default 1MB)
    pub max_frame_bytes: usize,
    /// Connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Read timeout in milliseconds
    pub read_timeout_ms: u64,
    /// Write timeout in milliseconds
    pub write_timeout_ms: u64,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            endpoint_path: agent_endpoint(Path::new(crate::config::DEFAULT_SOCKET_DIR)),
            max_frame_bytes: 1024 * 1024, // 1MB
            connect_timeout_ms: 5000,     // 5 seconds
            read_timeout_ms: 30000,       // 30 seconds
            write_timeout_ms: 10000,      // 10 seconds
        }
    }
}

impl IpcConfig {
    /// Build the transport configuration for `endpoint_path` from the loaded settings.
    pub fn from_settings(settings: &IpcSettings, endpoint_path: String) -> Self {
        Self {
            endpoint_path,
            max_frame_bytes: settings.max_frame_bytes,
            connect_timeout_ms: settings.connect_timeout_ms,
            read_timeout_ms: settings.read_timeout_ms,
            write_timeout_ms: settings.write_timeout_ms,
        }
    }

    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub const fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub const fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// Endpoint the management agent listens on.
pub fn agent_endpoint(socket_dir: &Path) -> String {
    #[cfg(unix)]
    {
        socket_dir
            .join(AGENT_ENDPOINT_NAME)
            .to_string_lossy()
            .into_owned()
    }
    #[cfg(windows)]
    {
        let _ = socket_dir;
        format!(r"\\.\pipe\bastion\{AGENT_ENDPOINT_NAME}")
    }
}

/// Endpoint a plugin's callback server listens on.
pub fn plugin_endpoint(socket_dir: &Path, plugin_name: &str) -> String {
    #[cfg(unix)]
    {
        socket_dir
            .join(PLUGIN_ENDPOINT_DIR)
            .join(format!("{plugin_name}.ipc"))
            .to_string_lossy()
            .into_owned()
    }
    #[cfg(windows)]
    {
        let _ = socket_dir;
        format!(r"\\.\pipe\bastion\{PLUGIN_ENDPOINT_DIR}\{plugin_name}")
    }
}
