//! Turns files dropped into the policy and action directories into plugin
//! notifications.

use crate::plugin_manager::PluginManager;
use crate::policy_files;
use notify::event::{AccessKind, AccessMode, ModifyKind};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A recognised drop-directory file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropFile {
    Policy {
        app_id: String,
        file_name: String,
    },
    Action {
        app_id: String,
        correlation_id: String,
        file_name: String,
    },
}

/// Watches the policy and action directories.
pub struct DirectoryWatcher {
    manager: Arc<PluginManager>,
    policy_dir: PathBuf,
    action_dir: PathBuf,
    delivered: HashMap<PathBuf, SystemTime>,
}

impl DirectoryWatcher {
    pub fn new(manager: Arc<PluginManager>) -> Self {
        let paths = manager.paths();
        Self {
            policy_dir: paths.policy_dir.clone(),
            action_dir: paths.action_dir.clone(),
            manager,
            delivered: HashMap::new(),
        }
    }

    /// Classify `path` by directory and file name.
    pub fn classify(&self, path: &Path) -> Option<DropFile> {
        let file_name = path.file_name()?.to_str()?;
        let dir = path.parent()?;
        if dir == self.policy_dir {
            let app_id = policy_files::policy_app_id(file_name)?;
            Some(DropFile::Policy {
                app_id: app_id.to_owned(),
                file_name: file_name.to_owned(),
            })
        } else if dir == self.action_dir {
            let action = policy_files::parse_action_file(file_name)?;
            Some(DropFile::Action {
                app_id: action.app_id.to_owned(),
                correlation_id: action.correlation_id.to_owned(),
                file_name: file_name.to_owned(),
            })
        } else {
            None
        }
    }

    /// Deliver the policies already on disk. Returns how many plugin
    /// notifications succeeded.
    pub async fn deliver_existing_policies(&mut self) -> usize {
        let mut delivered = 0;
        for (app_id, file_name) in policy_files::all_policy_files(&self.policy_dir) {
            let path = self.policy_dir.join(&file_name);
            self.mark_delivered(&path);
            delivered += self.manager.apply_new_policy(&app_id, &file_name, "").await;
        }
        info!(delivered, "Existing policies delivered");
        delivered
    }

    /// Deliver one file. Returns how many plugins accepted it.
    pub async fn deliver(&self, file: &DropFile) -> usize {
        match file {
            DropFile::Policy { app_id, file_name } => {
                info!(app_id = %app_id, file = %file_name, "New policy");
                self.manager.apply_new_policy(app_id, file_name, "").await
            }
            DropFile::Action {
                app_id,
                correlation_id,
                file_name,
            } => {
                info!(app_id = %app_id, file = %file_name, "New action");
                self.manager.queue_action(app_id, file_name, correlation_id).await
            }
        }
    }

    /// Record `path` as delivered. Returns false if this version of the file was already seen.
    fn mark_delivered(&mut self, path: &Path) -> bool {
        let modified = std::fs::metadata(path)
            .and_then(|metadata| metadata.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        self.delivered.insert(path.to_path_buf(), modified) != Some(modified)
    }

    async fn handle_event(&mut self, event: Event) {
        let relevant = matches!(
            event.kind,
            EventKind::Create(_)
                | EventKind::Modify(ModifyKind::Name(_))
                | EventKind::Access(AccessKind::Close(AccessMode::Write))
        );
        if !relevant {
            return;
        }
        for path in event.paths {
            let Some(file) = self.classify(&path) else {
                continue;
            };
            if !path.exists() || !self.mark_delivered(&path) {
                debug!(file = %path.display(), "Skipping already delivered file");
                continue;
            }
            self.deliver(&file).await;
        }
    }

    /// Start watching. Events are handled on a spawned task until `shutdown` flips to true.
    pub fn start(mut self, mut shutdown: watch::Receiver<bool>) -> notify::Result<JoinHandle<()>> {
        for dir in [&self.policy_dir, &self.action_dir] {
            std::fs::create_dir_all(dir).map_err(notify::Error::io)?;
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |result: notify::Result<Event>| {
                // receiver gone means the agent is shutting down
                let _ = tx.send(result);
            },
            Config::default(),
        )?;
        watcher.watch(&self.policy_dir, RecursiveMode::NonRecursive)?;
        watcher.watch(&self.action_dir, RecursiveMode::NonRecursive)?;
        info!(
            policy_dir = %self.policy_dir.display(),
            action_dir = %self.action_dir.display(),
            "Watching drop directories"
        );

        Ok(tokio::spawn(async move {
            let _watcher = watcher;
            loop {
                tokio::select! {
                    received = rx.recv() => match received {
                        Some(Ok(event)) => self.handle_event(event).await,
                        Some(Err(e)) => warn!(error = %e, "Directory watch error"),
                        None => break,
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Directory watcher stopped");
        }))
    }
}

/// Log-and-continue wrapper used by the agent binary.
pub fn start_logged(watcher: DirectoryWatcher, shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
    match watcher.start(shutdown) {
        Ok(handle) => Some(handle),
        Err(e) => {
            error!(error = %e, "Failed to watch drop directories");
            None
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::health_status::HealthStatus;
    use crate::test_support::FakeConnector;
    use bastion_lib::config::PathsConfig;
    use bastion_lib::protocol::Command;
    use bastion_lib::registry_entry::PluginRegistryEntry;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::Mutex;

    async fn setup() -> (TempDir, PathsConfig, FakeConnector, Arc<PluginManager>) {
        let dir = TempDir::new().unwrap();
        let paths = PathsConfig::under(dir.path());
        std::fs::create_dir_all(&paths.policy_dir).unwrap();
        std::fs::create_dir_all(&paths.action_dir).unwrap();
        let connector = FakeConnector::default();
        let health = Arc::new(Mutex::new(HealthStatus::new(&paths)));
        let manager = Arc::new(PluginManager::new(
            Arc::new(connector.clone()),
            paths.clone(),
            health,
        ));
        let entry = PluginRegistryEntry {
            plugin_name: "av".to_owned(),
            policy_app_ids: vec!["SAV".to_owned()],
            action_app_ids: vec!["SAV".to_owned()],
            ..PluginRegistryEntry::default()
        };
        manager.register_and_configure("av", &entry).await;
        (dir, paths, connector, manager)
    }

    #[tokio::test]
    async fn classify_by_directory() {
        let (_dir, paths, _, manager) = setup().await;
        let watcher = DirectoryWatcher::new(manager);

        assert_eq!(
            watcher.classify(&paths.policy_dir.join("SAV_policy.xml")),
            Some(DropFile::Policy {
                app_id: "SAV".to_owned(),
                file_name: "SAV_policy.xml".to_owned()
            })
        );
        assert_eq!(
            watcher.classify(&paths.action_dir.join("SAV_c1_action_scan.xml")),
            Some(DropFile::Action {
                app_id: "SAV".to_owned(),
                correlation_id: "c1".to_owned(),
                file_name: "SAV_c1_action_scan.xml".to_owned()
            })
        );
        // a policy name in the action directory is not an action
        assert_eq!(watcher.classify(&paths.action_dir.join("SAV_policy.xml")), None);
    }

    #[tokio::test]
    async fn existing_policies_delivered_once() {
        let (_dir, paths, connector, manager) = setup().await;
        std::fs::write(paths.policy_dir.join("SAV_policy.xml"), "<policy/>").unwrap();
        std::fs::write(paths.policy_dir.join("ALC_policy.xml"), "<policy/>").unwrap();

        let mut watcher = DirectoryWatcher::new(manager);
        assert_eq!(watcher.deliver_existing_policies().await, 1);
        assert_eq!(connector.calls("av", Command::ApplyPolicy), 1);
        assert!(!watcher.mark_delivered(&paths.policy_dir.join("SAV_policy.xml")));
    }

    #[tokio::test]
    async fn dropped_action_reaches_plugin() {
        let (_dir, paths, connector, manager) = setup().await;
        let (tx, rx) = watch::channel(false);
        let handle = DirectoryWatcher::new(manager).start(rx).unwrap();

        let temp = paths.action_dir.join(".incoming.tmp");
        std::fs::write(&temp, "<scan/>").unwrap();
        std::fs::rename(&temp, paths.action_dir.join("SAV_corr-9_action_scan.xml")).unwrap();

        let mut delivered = Vec::new();
        for _ in 0..100 {
            delivered = connector.requests("av");
            if !delivered.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].command(), Command::DoAction);
        assert_eq!(delivered[0].correlation_id, "corr-9");
        assert_eq!(delivered[0].first_payload(), "SAV_corr-9_action_scan.xml");
    }
}
