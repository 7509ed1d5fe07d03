//! Assembles the agent's components and runs them until shutdown.

use crate::agent_server::{AgentRequestHandler, AgentServer};
use crate::directory_watcher::{self, DirectoryWatcher};
use crate::event_receiver::{EventReceiver, EventWriter};
use crate::health_status::HealthStatus;
use crate::health_task::HealthTask;
use crate::outbreak::OutbreakModeController;
use crate::plugin_manager::PluginManager;
use crate::plugin_proxy::{PluginConnector, SocketPluginConnector};
use crate::status_cache::StatusCache;
use anyhow::Context;
use bastion_lib::config::Config;
use bastion_lib::ipc::{self, IpcConfig};
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// A running management agent.
pub struct Agent {
    manager: Arc<PluginManager>,
    health: Arc<Mutex<HealthStatus>>,
    server: AgentServer,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Agent {
    /// Start with plugins reached over local sockets.
    pub async fn start(config: &Config) -> anyhow::Result<Self> {
        let connector = Arc::new(SocketPluginConnector::new(config.ipc.clone()));
        Self::start_with_connector(config, connector).await
    }

    pub async fn start_with_connector(
        config: &Config,
        connector: Arc<dyn PluginConnector>,
    ) -> anyhow::Result<Self> {
        let paths = &config.paths;
        let health = Arc::new(Mutex::new(HealthStatus::new(paths)));
        let outbreak = Arc::new(OutbreakModeController::load(paths.outbreak_status_file()));
        let events: Arc<dyn EventReceiver> =
            Arc::new(EventWriter::new(paths.event_dir.clone(), Arc::clone(&outbreak)));

        let manager = Arc::new(
            PluginManager::new(connector, paths.clone(), Arc::clone(&health))
                .with_event_receiver(Arc::clone(&events)),
        );
        let registered = manager.load_registry().await;
        info!(plugins = registered, "Plugin registry loaded");

        let handler = Arc::new(AgentRequestHandler::new(
            Arc::clone(&manager),
            Arc::clone(&health),
            events,
            Arc::new(StatusCache::new(paths.status_dir.clone())),
        ));
        let endpoint = ipc::agent_endpoint(&config.ipc.socket_dir);
        let mut server = AgentServer::new(IpcConfig::from_settings(&config.ipc, endpoint), handler);
        server
            .start()
            .await
            .context("failed to start management endpoint")?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        let mut watcher = DirectoryWatcher::new(Arc::clone(&manager));
        watcher.deliver_existing_policies().await;
        if let Some(handle) = directory_watcher::start_logged(watcher, shutdown_rx.clone()) {
            tasks.push(handle);
        }

        let health_task = HealthTask::new(
            Arc::clone(&manager),
            Arc::clone(&health),
            outbreak,
            paths.clone(),
            config.health.clone(),
        );
        tasks.push(health_task.spawn(shutdown_rx));

        Ok(Self {
            manager,
            health,
            server,
            shutdown_tx,
            tasks,
        })
    }

    pub fn manager(&self) -> &Arc<PluginManager> {
        &self.manager
    }

    pub fn health(&self) -> &Arc<Mutex<HealthStatus>> {
        &self.health
    }

    pub fn endpoint(&self) -> &str {
        self.server.endpoint()
    }

    /// Stop the endpoint and background tasks, then persist health.
    pub async fn shutdown(mut self) {
        info!("Shutting down management agent");
        self.server.stop().await;
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!(error = %e, "Background task failed");
            }
        }
        if let Err(e) = self.health.lock().await.save_threat_health() {
            error!(error = %e, "Failed to persist threat health");
        }
    }
}
