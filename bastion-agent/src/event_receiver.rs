//! Sink for plugin events and agent-internal (CORE) actions.

use crate::outbreak::{CORE_APP_ID, OutbreakModeController};
use crate::policy_files;
use async_trait::async_trait;
use bastion_lib::files;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Receives events reported by plugins and CORE actions from the management service.
#[async_trait]
pub trait EventReceiver: Send + Sync {
    async fn receive_event(&self, app_id: &str, event_xml: &str) -> anyhow::Result<()>;

    async fn receive_action(&self, action_xml: &str);
}

/// Writes events into the event directory and feeds outbreak accounting.
pub struct EventWriter {
    event_dir: PathBuf,
    outbreak: Arc<OutbreakModeController>,
}

impl EventWriter {
    pub const fn new(event_dir: PathBuf, outbreak: Arc<OutbreakModeController>) -> Self {
        Self { event_dir, outbreak }
    }

    async fn write_event(&self, app_id: &str, event_xml: &str) -> anyhow::Result<PathBuf> {
        if !policy_files::is_safe_identifier(app_id) {
            anyhow::bail!("invalid application id `{app_id}`");
        }
        let path = self
            .event_dir
            .join(format!("{app_id}_event-{}.xml", uuid::Uuid::new_v4()));
        files::write_atomically(&path, event_xml).await?;
        Ok(path)
    }
}

#[async_trait]
impl EventReceiver for EventWriter {
    async fn receive_event(&self, app_id: &str, event_xml: &str) -> anyhow::Result<()> {
        let path = self.write_event(app_id, event_xml).await?;
        debug!(app_id = %app_id, file = %path.display(), "Event written");

        if let Some(outbreak_event) = self.outbreak.record_event(app_id, event_xml, chrono::Utc::now()) {
            let path = self.write_event(CORE_APP_ID, &outbreak_event).await?;
            info!(file = %path.display(), "Outbreak event written");
        }
        Ok(())
    }

    async fn receive_action(&self, action_xml: &str) {
        self.outbreak.handle_action(action_xml);
    }
}
