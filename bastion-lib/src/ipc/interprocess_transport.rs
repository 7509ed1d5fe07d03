//! Local-socket server and client built on `interprocess::local_socket`.
//!
//! The server runs a single accept/read/dispatch/reply loop: connections are
//! served one after another, so a given endpoint never has more than one request
//! in flight. The client opens a fresh connection for every request.

use crate::ipc::IpcConfig;
use crate::ipc::codec::{IpcCodec, IpcError, IpcResult};
use crate::protocol::Message;
use async_trait::async_trait;
use interprocess::local_socket::{ListenerOptions, Name, tokio::prelude::*};
#[cfg(unix)]
use interprocess::local_socket::{GenericFilePath, ToFsName};
#[cfg(windows)]
use interprocess::local_socket::{GenericNamespaced, ToNsName};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Request handler: turns every request into exactly one reply.
type MessageHandler =
    Arc<dyn Fn(Message) -> Pin<Box<dyn Future<Output = Message> + Send>> + Send + Sync>;

/// A request/reply channel to one endpoint.
///
/// Implementations must not overlap requests: `&mut self` makes the caller
/// serialize them.
#[async_trait]
pub trait RequestChannel: Send {
    /// Send `message` and wait for its reply.
    async fn request(&mut self, message: &Message) -> IpcResult<Message>;

    /// Endpoint this channel talks to, for diagnostics.
    fn endpoint(&self) -> &str;
}

/// Local-socket request/reply server.
pub struct InterprocessServer {
    config: IpcConfig,
    handler: Option<MessageHandler>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl InterprocessServer {
    pub const fn new(config: IpcConfig) -> Self {
        Self {
            config,
            handler: None,
            shutdown_tx: None,
            task: None,
        }
    }

    /// Set the request handler. Must be called before [`start`](Self::start).
    pub fn set_handler<F, Fut>(&mut self, handler: F)
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Message> + Send + 'static,
    {
        self.handler = Some(Arc::new(move |request| Box::pin(handler(request))));
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint_path
    }

    pub const fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// Bind the endpoint and spawn the serving loop.
    pub async fn start(&mut self) -> IpcResult<()> {
        let handler = self
            .handler
            .clone()
            .ok_or(IpcError::NoHandler)?;

        let name = self.create_socket_name()?;
        let listener = ListenerOptions::new()
            .name(name)
            .create_tokio()
            .map_err(|e| {
                error!(endpoint = %self.config.endpoint_path, error = %e, "Failed to bind local socket");
                IpcError::Io(e)
            })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.config.endpoint_path, perms)?;
        }

        info!(endpoint = %self.config.endpoint_path, "IPC server listening");

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);

        let config = self.config.clone();
        self.task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok(stream) => {
                                if let Err(e) = Self::handle_connection(stream, &handler, &config).await {
                                    warn!(endpoint = %config.endpoint_path, error = %e, "Connection handling error");
                                }
                            }
                            Err(e) => {
                                error!(endpoint = %config.endpoint_path, error = %e, "Failed to accept connection");
                            }
                        }
                    }
                    _ = &mut shutdown_rx => {
                        debug!(endpoint = %config.endpoint_path, "IPC server shutdown requested");
                        break;
                    }
                }
            }
        }));

        Ok(())
    }

    /// Stop accepting, wait for the in-flight request to finish, remove the endpoint.
    pub async fn stop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!(endpoint = %self.config.endpoint_path, error = %e, "IPC server task failed");
            }
        }

        #[cfg(unix)]
        {
            let _ = std::fs::remove_file(&self.config.endpoint_path);
        }
        info!(endpoint = %self.config.endpoint_path, "IPC server stopped");
    }

    fn create_socket_name(&self) -> IpcResult<Name<'_>> {
        #[cfg(unix)]
        {
            let path = std::path::Path::new(&self.config.endpoint_path);
            if let Some(parent) = path.parent() {
                if !parent.exists() {
                    std::fs::create_dir_all(parent)?;
                    use std::os::unix::fs::PermissionsExt;
                    std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
                }
            }

            // A stale socket from a previous run would make the bind fail.
            let _ = std::fs::remove_file(path);

            path.to_fs_name::<GenericFilePath>()
                .map_err(|e| IpcError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))
        }
        #[cfg(windows)]
        {
            self.config
                .endpoint_path
                .as_str()
                .to_ns_name::<GenericNamespaced>()
                .map_err(|e| IpcError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))
        }
    }

    /// Serve requests on one connection until the peer hangs up.
    async fn handle_connection(
        mut stream: LocalSocketStream,
        handler: &MessageHandler,
        config: &IpcConfig,
    ) -> IpcResult<()> {
        let mut codec = IpcCodec::new(config.max_frame_bytes);

        loop {
            let request: Message = match codec.read_message(&mut stream, config.read_timeout()).await {
                Ok(request) => request,
                Err(IpcError::PeerClosed) => break,
                Err(e) => return Err(e),
            };

            let command = request.command();
            debug!(
                command = %command,
                plugin = %request.plugin_name,
                app_id = %request.application_id,
                "Dispatching request"
            );
            // a panicking handler drops this connection, never the accept loop
            let reply = match tokio::spawn(handler(request)).await {
                Ok(reply) => reply,
                Err(e) => {
                    error!(endpoint = %config.endpoint_path, command = %command, error = %e, "Request handler failed");
                    return Err(IpcError::HandlerPanicked {
                        command: command.to_string(),
                    });
                }
            };

            codec
                .write_message(&mut stream, &reply, config.write_timeout())
                .await?;
        }

        Ok(())
    }
}

/// Local-socket client; one connection per request.
pub struct InterprocessClient {
    config: IpcConfig,
    codec: IpcCodec,
}

impl InterprocessClient {
    pub fn new(config: IpcConfig) -> Self {
        let codec = IpcCodec::new(config.max_frame_bytes);
        Self { config, codec }
    }

    fn create_socket_name(&self) -> IpcResult<Name<'_>> {
        #[cfg(unix)]
        {
            std::path::Path::new(&self.config.endpoint_path)
                .to_fs_name::<GenericFilePath>()
                .map_err(|e| IpcError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))
        }
        #[cfg(windows)]
        {
            self.config
                .endpoint_path
                .as_str()
                .to_ns_name::<GenericNamespaced>()
                .map_err(|e| IpcError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))
        }
    }
}

#[async_trait]
impl RequestChannel for InterprocessClient {
    async fn request(&mut self, message: &Message) -> IpcResult<Message> {
        let connect_timeout = self.config.connect_timeout();
        let read_timeout = self.config.read_timeout();
        let write_timeout = self.config.write_timeout();

        let name = self.create_socket_name()?;
        let mut stream = timeout(connect_timeout, LocalSocketStream::connect(name))
            .await
            .map_err(|_| IpcError::Timeout {
                operation: "connect",
            })??;

        self.codec
            .write_message(&mut stream, message, write_timeout)
            .await?;
        self.codec.read_message(&mut stream, read_timeout).await
    }

    fn endpoint(&self) -> &str {
        &self.config.endpoint_path
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::protocol::Command;
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_config(temp_dir: &TempDir) -> IpcConfig {
        IpcConfig {
            endpoint_path: crate::ipc::plugin_endpoint(temp_dir.path(), "unit"),
            connect_timeout_ms: 500,
            read_timeout_ms: 2000,
            write_timeout_ms: 2000,
            ..IpcConfig::default()
        }
    }

    #[tokio::test]
    async fn start_without_handler_fails() {
        let temp_dir = TempDir::new().expect("temp dir");
        let mut server = InterprocessServer::new(test_config(&temp_dir));
        assert!(matches!(server.start().await, Err(IpcError::NoHandler)));
        assert!(!server.is_running());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn panicking_handler_keeps_server_alive() {
        let temp_dir = TempDir::new().expect("temp dir");
        let config = test_config(&temp_dir);

        let mut server = InterprocessServer::new(config.clone());
        server.set_handler(|request: Message| async move {
            if request.command() == Command::ApplyPolicy {
                panic!("handler bug");
            }
            request.ack_reply()
        });
        server.start().await.expect("server starts");

        let mut client = InterprocessClient::new(config.clone());
        let failing = Message::request(Command::ApplyPolicy, "unit", "SAV", vec!["<p/>".to_owned()]);
        assert!(client.request(&failing).await.is_err());

        let health = Message::request(Command::GetHealth, "unit", "", Vec::new());
        let reply = client.request(&health).await.expect("server still serving");
        assert!(reply.ack);
        assert!(server.is_running());

        server.stop().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn request_round_trip_and_stop() {
        let temp_dir = TempDir::new().expect("temp dir");
        let config = test_config(&temp_dir);

        let mut server = InterprocessServer::new(config.clone());
        server.set_handler(|request: Message| async move {
            request.reply(vec![format!("echo:{}", request.first_payload())])
        });
        server.start().await.expect("server starts");

        let mut client = InterprocessClient::new(config.clone());
        let request = Message::request(Command::GetTelemetry, "unit", "", vec!["ping".to_owned()]);
        let reply = client.request(&request).await.expect("reply");
        assert_eq!(reply.payload, vec!["echo:ping".to_owned()]);
        assert_eq!(reply.command(), Command::GetTelemetry);

        server.stop().await;
        assert!(!std::path::Path::new(&config.endpoint_path).exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn connecting_to_missing_endpoint_fails_fast() {
        let temp_dir = TempDir::new().expect("temp dir");
        let mut client = InterprocessClient::new(test_config(&temp_dir));
        let request = Message::request(Command::GetHealth, "unit", "", Vec::new());
        let result = tokio::time::timeout(Duration::from_secs(5), client.request(&request))
            .await
            .expect("connect does not hang");
        assert!(result.is_err());
    }
}
