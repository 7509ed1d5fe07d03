//! Writes plugin status documents when they actually change.

use crate::policy_files;
use bastion_lib::files;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::debug;

/// Last timestamp-free status per app id.
pub struct StatusCache {
    status_dir: PathBuf,
    last_seen: Mutex<HashMap<String, String>>,
}

impl StatusCache {
    pub fn new(status_dir: PathBuf) -> Self {
        Self {
            status_dir,
            last_seen: Mutex::new(HashMap::new()),
        }
    }

    /// Store a status. Returns whether `<APPID>_status.xml` was rewritten.
    ///
    /// Documents that differ only in timestamps are not written.
    pub async fn update(
        &self,
        app_id: &str,
        status_xml: &str,
        status_without_timestamps: &str,
    ) -> std::io::Result<bool> {
        if !policy_files::is_safe_identifier(app_id) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid application id `{app_id}`"),
            ));
        }
        let mut last_seen = self.last_seen.lock().await;
        if last_seen.get(app_id).map(String::as_str) == Some(status_without_timestamps) {
            debug!(app_id = %app_id, "Status unchanged");
            return Ok(false);
        }

        let path = self.status_dir.join(format!("{app_id}_status.xml"));
        files::write_atomically(&path, status_xml).await?;
        last_seen.insert(app_id.to_owned(), status_without_timestamps.to_owned());
        Ok(true)
    }
}
