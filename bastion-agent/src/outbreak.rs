//! Outbreak mode: too many detections in a day put the endpoint into a
//! persistent alert state until the management service resets it.

use bastion_lib::files;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{info, warn};

/// Application id of agent-internal events and actions.
pub const CORE_APP_ID: &str = "CORE";

/// Substring identifying a detection event.
pub const DETECTION_EVENT_MARKER: &str = "core.detection";

/// Substring identifying a threat-health reset action.
pub const THREAT_RESET_MARKER: &str = "core.threat.reset";

/// Detections within [`OUTBREAK_WINDOW_HOURS`] that trigger outbreak mode.
pub const OUTBREAK_THRESHOLD: usize = 100;

pub const OUTBREAK_WINDOW_HOURS: i64 = 24;

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct PersistedOutbreak {
    outbreak_mode: bool,
    entered_at: Option<DateTime<Utc>>,
    uuid: String,
}

#[derive(Debug, Default)]
struct OutbreakState {
    detections: VecDeque<DateTime<Utc>>,
    outbreak_mode: bool,
    entered_at: Option<DateTime<Utc>>,
    uuid: String,
}

/// Tracks detections and the outbreak flag.
#[derive(Debug)]
pub struct OutbreakModeController {
    state: Mutex<OutbreakState>,
    status_file: PathBuf,
}

impl OutbreakModeController {
    /// Restore state from `status_file`; anything unreadable means no outbreak.
    pub fn load(status_file: impl Into<PathBuf>) -> Self {
        let status_file = status_file.into();
        let persisted = read_status(&status_file);
        if persisted.outbreak_mode {
            warn!(since = ?persisted.entered_at, "Outbreak mode restored from previous run");
        }
        Self {
            state: Mutex::new(OutbreakState {
                detections: VecDeque::new(),
                outbreak_mode: persisted.outbreak_mode,
                entered_at: persisted.entered_at,
                uuid: persisted.uuid,
            }),
            status_file,
        }
    }

    fn state(&self) -> MutexGuard<'_, OutbreakState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_active(&self) -> bool {
        self.state().outbreak_mode
    }

    /// Count a plugin event. Returns the outbreak event document when this
    /// event pushed the endpoint into outbreak mode.
    pub fn record_event(&self, app_id: &str, event_xml: &str, now: DateTime<Utc>) -> Option<String> {
        if app_id != CORE_APP_ID || !event_xml.contains(DETECTION_EVENT_MARKER) {
            return None;
        }

        let mut state = self.state();
        if state.outbreak_mode {
            return None;
        }

        let window_start = now - Duration::hours(OUTBREAK_WINDOW_HOURS);
        while state.detections.front().is_some_and(|seen| *seen < window_start) {
            state.detections.pop_front();
        }
        state.detections.push_back(now);

        if state.detections.len() < OUTBREAK_THRESHOLD {
            return None;
        }

        let uuid = uuid::Uuid::new_v4().to_string();
        state.outbreak_mode = true;
        state.entered_at = Some(now);
        state.uuid.clone_from(&uuid);
        let detections = state.detections.len();
        state.detections.clear();
        self.persist(&state);

        warn!(detections, window_hours = OUTBREAK_WINDOW_HOURS, "Entering outbreak mode");
        Some(outbreak_event_xml(&uuid, now, detections))
    }

    /// Handle a CORE action. Returns true if it ended outbreak mode.
    pub fn handle_action(&self, action_xml: &str) -> bool {
        if !action_xml.contains(THREAT_RESET_MARKER) {
            return false;
        }
        let mut state = self.state();
        state.detections.clear();
        if !state.outbreak_mode {
            return false;
        }
        state.outbreak_mode = false;
        state.entered_at = None;
        state.uuid.clear();
        self.persist(&state);
        info!("Leaving outbreak mode");
        true
    }

    fn persist(&self, state: &OutbreakState) {
        let persisted = PersistedOutbreak {
            outbreak_mode: state.outbreak_mode,
            entered_at: state.entered_at,
            uuid: state.uuid.clone(),
        };
        let result = serde_json::to_string(&persisted)
            .map_err(std::io::Error::other)
            .and_then(|json| files::write_atomically_blocking(&self.status_file, &json));
        if let Err(e) = result {
            warn!(file = %self.status_file.display(), error = %e, "Failed to persist outbreak state");
        }
    }
}

fn read_status(path: &Path) -> PersistedOutbreak {
    let Ok(json) = std::fs::read_to_string(path) else {
        return PersistedOutbreak::default();
    };
    serde_json::from_str(&json).unwrap_or_else(|e| {
        warn!(file = %path.display(), error = %e, "Ignoring corrupt outbreak state");
        PersistedOutbreak::default()
    })
}

fn outbreak_event_xml(uuid: &str, at: DateTime<Utc>, detections: usize) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<event type=\"core.outbreak\" id=\"{uuid}\" timestamp=\"{}\" detections=\"{detections}\" />\n",
        at.to_rfc3339()
    )
}
