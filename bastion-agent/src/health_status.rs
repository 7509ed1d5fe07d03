//! Folds per-plugin health reports into the published health status.
//!
//! Three categories are tracked: service health and threat-service health,
//! which are rebuilt every polling cycle, and threat-detection health, which
//! plugins push and which survives agent restarts through a JSON file.

use bastion_lib::config::PathsConfig;
use bastion_lib::files;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Version attribute of the rendered status document.
const HEALTH_STATUS_VERSION: &str = "3.0.0";

/// Health value meaning good on the informational scale.
pub const HEALTH_GOOD_INFORMATIONAL: u32 = 0;
pub const HEALTH_GOOD: u32 = 1;
/// The plugin did not answer.
pub const HEALTH_MISSING: u32 = 2;
pub const HEALTH_BAD: u32 = 3;

/// Errors reading or writing health state files.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PersistenceError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Which category a plugin's health belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HealthType {
    #[default]
    None,
    Service,
    ThreatService,
    ServiceAndThreat,
    ThreatDetection,
}

impl HealthType {
    /// Category implied by a plugin's registry flags.
    pub const fn from_flags(service_health: bool, threat_service_health: bool) -> Self {
        match (service_health, threat_service_health) {
            (true, true) => Self::ServiceAndThreat,
            (true, false) => Self::Service,
            (false, true) => Self::ThreatService,
            (false, false) => Self::None,
        }
    }

    pub const fn as_u32(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Service => 1,
            Self::ThreatService => 2,
            Self::ServiceAndThreat => 3,
            Self::ThreatDetection => 4,
        }
    }

    pub const fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Service),
            2 => Some(Self::ThreatService),
            3 => Some(Self::ServiceAndThreat),
            4 => Some(Self::ThreatDetection),
            _ => None,
        }
    }
}

/// One plugin's health report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginHealthStatus {
    pub health_type: HealthType,
    pub health_value: u32,
    pub display_name: String,
    pub isolated: bool,
    pub active_heartbeat: bool,
    pub active_heartbeat_utm_id: String,
}

impl Default for PluginHealthStatus {
    fn default() -> Self {
        Self {
            health_type: HealthType::None,
            health_value: HEALTH_GOOD,
            display_name: String::new(),
            isolated: false,
            active_heartbeat: false,
            active_heartbeat_utm_id: String::new(),
        }
    }
}

impl PluginHealthStatus {
    pub fn new(health_type: HealthType, health_value: u32, display_name: impl Into<String>) -> Self {
        Self {
            health_type,
            health_value,
            display_name: display_name.into(),
            ..Self::default()
        }
    }
}

/// Compact summary persisted next to the status document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverallHealth {
    pub health: u32,
    pub service: u32,
    pub threat_service: u32,
    pub threat: u32,
}

/// Result of rendering the status document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedHealth {
    pub status_xml: String,
    /// The document differs from the previous render
    pub has_status_changed: bool,
    /// The summary differs from the persisted one
    pub has_overall_changed: bool,
    /// Serialized summary, set when the document changed
    pub overall_json: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PersistedThreatHealth<'a> {
    display_name: &'a str,
    health_type: u32,
    health_value: u32,
}

/// Map raw category values onto the published scale.
pub const fn convert_to_overall(value: u32) -> u32 {
    if value == HEALTH_GOOD_INFORMATIONAL {
        HEALTH_GOOD
    } else {
        HEALTH_BAD
    }
}

/// Aggregated health of all plugins.
#[derive(Debug)]
pub struct HealthStatus {
    service: BTreeMap<String, PluginHealthStatus>,
    threat_service: BTreeMap<String, PluginHealthStatus>,
    threat_detection: BTreeMap<String, PluginHealthStatus>,
    threat_health_file: PathBuf,
    overall_health_file: PathBuf,
    cached_status_xml: String,
    isolated: bool,
    outbreak_mode: bool,
    overall: OverallHealth,
}

impl HealthStatus {
    /// Create the aggregator, restoring threat-detection health from disk.
    pub fn new(paths: &PathsConfig) -> Self {
        let threat_health_file = paths.threat_health_file();
        let threat_detection = match load_threat_health(&threat_health_file) {
            Ok(map) => map,
            Err(e) => {
                warn!(file = %threat_health_file.display(), error = %e, "Ignoring unreadable threat health file");
                BTreeMap::new()
            }
        };

        Self {
            service: BTreeMap::new(),
            threat_service: BTreeMap::new(),
            threat_detection,
            threat_health_file,
            overall_health_file: paths.overall_health_file(),
            cached_status_xml: String::new(),
            isolated: false,
            outbreak_mode: false,
            overall: OverallHealth::default(),
        }
    }

    /// Record a plugin's health in the category its type names.
    pub fn add_plugin_health(&mut self, plugin_name: &str, status: PluginHealthStatus) {
        if plugin_name.is_empty() {
            return;
        }
        match status.health_type {
            HealthType::None => {}
            HealthType::Service => {
                self.service.insert(plugin_name.to_owned(), status);
            }
            HealthType::ThreatService => {
                self.threat_service.insert(plugin_name.to_owned(), status);
            }
            HealthType::ServiceAndThreat => {
                self.service.insert(plugin_name.to_owned(), status.clone());
                self.threat_service.insert(plugin_name.to_owned(), status);
            }
            HealthType::ThreatDetection => {
                if self.threat_detection.get(plugin_name) != Some(&status) {
                    debug!(plugin = %plugin_name, value = status.health_value, "Threat health changed");
                    self.threat_detection.insert(plugin_name.to_owned(), status);
                    self.save_threat_health_logged();
                }
            }
        }
    }

    /// Start of a polling cycle.
    pub fn clear_service_health(&mut self) {
        self.service.clear();
        self.threat_service.clear();
    }

    /// Mark every threat-detection entry good again.
    pub fn reset_threat_detection_health(&mut self) {
        for status in self.threat_detection.values_mut() {
            status.health_value = HEALTH_GOOD;
        }
        info!(plugins = self.threat_detection.len(), "Threat health reset");
        self.save_threat_health_logged();
    }

    pub fn set_outbreak_mode(&mut self, outbreak_mode: bool) {
        self.outbreak_mode = outbreak_mode;
    }

    pub const fn is_isolated(&self) -> bool {
        self.isolated
    }

    pub const fn overall(&self) -> OverallHealth {
        self.overall
    }

    pub fn threat_detection_health(&self) -> &BTreeMap<String, PluginHealthStatus> {
        &self.threat_detection
    }

    pub fn service_health(&self) -> &BTreeMap<String, PluginHealthStatus> {
        &self.service
    }

    pub fn threat_service_health(&self) -> &BTreeMap<String, PluginHealthStatus> {
        &self.threat_service
    }

    /// Recompute the category overalls and the overall health.
    pub fn update_overall_health_status(&mut self) -> OverallHealth {
        let isolated = self.service.values().any(|status| status.isolated);
        if isolated != self.isolated {
            if isolated {
                warn!("Endpoint isolation enabled, service health forced bad");
            } else {
                info!("Endpoint isolation disabled");
            }
            self.isolated = isolated;
        }

        let service_raw = if isolated {
            HEALTH_BAD
        } else {
            max_value(&self.service).unwrap_or(HEALTH_GOOD_INFORMATIONAL)
        };
        let threat_service_raw = max_value(&self.threat_service).unwrap_or(HEALTH_GOOD_INFORMATIONAL);
        let threat = if self.outbreak_mode {
            HEALTH_BAD
        } else {
            max_value(&self.threat_detection).unwrap_or(HEALTH_GOOD)
        };

        let service = convert_to_overall(service_raw);
        let threat_service = convert_to_overall(threat_service_raw);
        self.overall = OverallHealth {
            health: service.max(threat_service).max(threat),
            service,
            threat_service,
            threat,
        };
        self.overall
    }

    /// Render the status document and report what changed since the last render.
    pub fn generate_health_status_xml(&mut self) -> RenderedHealth {
        let status_xml = self.render_xml();
        let has_status_changed = status_xml != self.cached_status_xml;

        let mut has_overall_changed = false;
        let mut overall_json = String::new();
        if has_status_changed {
            overall_json = serde_json::to_string(&self.overall).unwrap_or_default();
            has_overall_changed = self.persisted_overall() != Some(self.overall);
        }

        self.cached_status_xml.clone_from(&status_xml);
        RenderedHealth {
            status_xml,
            has_status_changed,
            has_overall_changed,
            overall_json,
        }
    }

    fn persisted_overall(&self) -> Option<OverallHealth> {
        let json = std::fs::read_to_string(&self.overall_health_file).ok()?;
        serde_json::from_str(&json).ok()
    }

    fn render_xml(&self) -> String {
        let (active_heartbeat, utm_id) = self
            .service
            .values()
            .find(|status| status.active_heartbeat)
            .map_or((false, ""), |status| (true, status.active_heartbeat_utm_id.as_str()));
        let admin = if self.isolated { HEALTH_BAD } else { HEALTH_GOOD };

        let mut xml = String::from("<?xml version=\"1.0\" encoding=\"utf-8\" ?>\n");
        xml.push_str(&format!(
            "<health version=\"{HEALTH_STATUS_VERSION}\" activeHeartbeat=\"{active_heartbeat}\" activeHeartbeatUtmId=\"{}\">\n",
            escape_xml(utm_id)
        ));
        push_item(&mut xml, "health", self.overall.health);
        push_item(&mut xml, "admin", admin);
        if !self.service.is_empty() {
            push_item_with_details(&mut xml, "service", self.overall.service, &self.service);
        }
        if !self.threat_service.is_empty() {
            push_item_with_details(
                &mut xml,
                "threatService",
                self.overall.threat_service,
                &self.threat_service,
            );
        }
        push_item(&mut xml, "threat", self.overall.threat);
        xml.push_str("</health>\n");
        xml
    }

    /// Overwrite the threat health file with the current map.
    pub fn save_threat_health(&self) -> Result<(), PersistenceError> {
        let persisted: BTreeMap<&str, PersistedThreatHealth<'_>> = self
            .threat_detection
            .iter()
            .map(|(name, status)| {
                (
                    name.as_str(),
                    PersistedThreatHealth {
                        display_name: &status.display_name,
                        health_type: status.health_type.as_u32(),
                        health_value: status.health_value,
                    },
                )
            })
            .collect();
        let json = serde_json::to_string(&persisted)?;
        files::write_atomically_blocking(&self.threat_health_file, &json).map_err(|source| {
            PersistenceError::Io {
                path: self.threat_health_file.clone(),
                source,
            }
        })
    }

    fn save_threat_health_logged(&self) {
        if let Err(e) = self.save_threat_health() {
            warn!(error = %e, "Failed to persist threat health");
        }
    }
}

impl Drop for HealthStatus {
    fn drop(&mut self) {
        self.save_threat_health_logged();
    }
}

fn max_value(map: &BTreeMap<String, PluginHealthStatus>) -> Option<u32> {
    map.values().map(|status| status.health_value).max()
}

fn push_item(xml: &mut String, name: &str, value: u32) {
    xml.push_str(&format!("    <item name=\"{name}\" value=\"{value}\" />\n"));
}

fn push_item_with_details(
    xml: &mut String,
    name: &str,
    value: u32,
    details: &BTreeMap<String, PluginHealthStatus>,
) {
    xml.push_str(&format!("    <item name=\"{name}\" value=\"{value}\" >\n"));
    for (plugin_name, status) in details {
        let detail_name = if status.display_name.is_empty() {
            plugin_name
        } else {
            &status.display_name
        };
        xml.push_str(&format!(
            "        <detail name=\"{}\" value=\"{}\" />\n",
            escape_xml(detail_name),
            status.health_value
        ));
    }
    xml.push_str("    </item>\n");
}

fn escape_xml(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Load the persisted threat-detection map.
///
/// A missing file yields an empty map. Entries with unreadable fields keep
/// their defaults rather than being dropped.
fn load_threat_health(path: &Path) -> Result<BTreeMap<String, PluginHealthStatus>, PersistenceError> {
    let json = match std::fs::read_to_string(path) {
        Ok(json) => json,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(source) => {
            return Err(PersistenceError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    let Value::Object(entries) = serde_json::from_str::<Value>(&json)? else {
        return Ok(BTreeMap::new());
    };

    let map = entries
        .into_iter()
        .filter(|(name, _)| !name.is_empty())
        .map(|(name, entry)| {
            let display_name = entry
                .get("displayName")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned();
            let health_value = entry
                .get("healthValue")
                .and_then(Value::as_u64)
                .and_then(|value| u32::try_from(value).ok())
                .unwrap_or(HEALTH_GOOD);
            let status = PluginHealthStatus::new(HealthType::ThreatDetection, health_value, display_name);
            (name, status)
        })
        .collect();
    Ok(map)
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tracing_test::traced_test;

    fn service(value: u32) -> PluginHealthStatus {
        PluginHealthStatus::new(HealthType::Service, value, "")
    }

    fn threat(value: u32) -> PluginHealthStatus {
        PluginHealthStatus::new(HealthType::ThreatDetection, value, "")
    }

    fn aggregator(dir: &TempDir) -> HealthStatus {
        HealthStatus::new(&PathsConfig::under(dir.path()))
    }

    #[test]
    fn health_type_from_flags() {
        assert_eq!(HealthType::from_flags(false, false), HealthType::None);
        assert_eq!(HealthType::from_flags(true, false), HealthType::Service);
        assert_eq!(HealthType::from_flags(false, true), HealthType::ThreatService);
        assert_eq!(HealthType::from_flags(true, true), HealthType::ServiceAndThreat);
        assert_eq!(HealthType::from_u32(4), Some(HealthType::ThreatDetection));
        assert_eq!(HealthType::from_u32(9), None);
    }

    #[test]
    fn conversion_scale() {
        assert_eq!(convert_to_overall(0), 1);
        assert_eq!(convert_to_overall(1), 3);
        assert_eq!(convert_to_overall(2), 3);
        assert_eq!(convert_to_overall(7), 3);
    }

    #[test]
    fn empty_name_is_ignored() {
        let dir = TempDir::new().unwrap();
        let mut health = aggregator(&dir);
        health.add_plugin_health("", service(3));
        health.add_plugin_health("", threat(3));
        assert!(health.service_health().is_empty());
        assert!(health.threat_detection_health().is_empty());
    }

    #[test]
    fn empty_categories_default() {
        let dir = TempDir::new().unwrap();
        let mut health = aggregator(&dir);
        let overall = health.update_overall_health_status();
        assert_eq!(
            overall,
            OverallHealth {
                health: 1,
                service: 1,
                threat_service: 1,
                threat: 1
            }
        );
    }

    #[test]
    fn service_values_drive_overall() {
        let dir = TempDir::new().unwrap();
        let mut health = aggregator(&dir);
        health.add_plugin_health("av", service(0));
        health.add_plugin_health("edr", service(0));
        assert_eq!(health.update_overall_health_status().health, 1);

        health.add_plugin_health("edr", service(1));
        assert_eq!(health.update_overall_health_status().health, 3);
    }

    #[test]
    fn service_and_threat_lands_in_both_maps() {
        let dir = TempDir::new().unwrap();
        let mut health = aggregator(&dir);
        health.add_plugin_health("av", PluginHealthStatus::new(HealthType::ServiceAndThreat, 0, "AV"));
        assert!(health.service_health().contains_key("av"));
        assert!(health.threat_service_health().contains_key("av"));

        health.clear_service_health();
        assert!(health.service_health().is_empty());
        assert!(health.threat_service_health().is_empty());
    }

    #[traced_test]
    #[test]
    fn isolation_forces_service_and_admin_bad() {
        let dir = TempDir::new().unwrap();
        let mut health = aggregator(&dir);
        health.add_plugin_health("av", service(0));
        health.add_plugin_health(
            "isolator",
            PluginHealthStatus {
                isolated: true,
                ..service(0)
            },
        );

        let overall = health.update_overall_health_status();
        assert_eq!(overall.health, 3);
        assert_eq!(overall.service, 3);
        let rendered = health.generate_health_status_xml();
        assert!(rendered.status_xml.contains("<item name=\"admin\" value=\"3\" />"));
        assert!(logs_contain("isolation enabled"));

        // a second cycle in the same state does not log the edge again
        health.update_overall_health_status();
        logs_assert(|lines: &[&str]| {
            match lines.iter().filter(|line| line.contains("isolation enabled")).count() {
                1 => Ok(()),
                n => Err(format!("expected one isolation edge, saw {n}")),
            }
        });
    }

    #[test]
    fn outbreak_forces_threat_bad() {
        let dir = TempDir::new().unwrap();
        let mut health = aggregator(&dir);
        health.add_plugin_health("av", threat(1));
        health.set_outbreak_mode(true);
        let overall = health.update_overall_health_status();
        assert_eq!(overall.threat, 3);
        assert_eq!(overall.health, 3);
        assert!(health
            .generate_health_status_xml()
            .status_xml
            .contains("<item name=\"threat\" value=\"3\" />"));
    }

    #[test]
    fn render_layout_and_order() {
        let dir = TempDir::new().unwrap();
        let mut health = aggregator(&dir);
        health.add_plugin_health("av", PluginHealthStatus::new(HealthType::Service, 0, "Anti-Virus"));
        health.add_plugin_health(
            "edr",
            PluginHealthStatus {
                active_heartbeat: true,
                active_heartbeat_utm_id: "utm-1".to_owned(),
                ..PluginHealthStatus::new(HealthType::ServiceAndThreat, 0, "EDR & more")
            },
        );
        health.update_overall_health_status();
        let xml = health.generate_health_status_xml().status_xml;

        assert!(xml.contains(
            "<health version=\"3.0.0\" activeHeartbeat=\"true\" activeHeartbeatUtmId=\"utm-1\">"
        ));
        assert!(xml.contains("<detail name=\"Anti-Virus\" value=\"0\" />"));
        assert!(xml.contains("<detail name=\"EDR &amp; more\" value=\"0\" />"));

        let positions: Vec<usize> = ["\"health\"", "\"admin\"", "\"service\"", "\"threatService\"", "\"threat\""]
            .iter()
            .map(|item| xml.find(&format!("<item name={item}")).unwrap())
            .collect();
        assert!(positions.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn service_items_omitted_when_empty() {
        let dir = TempDir::new().unwrap();
        let mut health = aggregator(&dir);
        health.update_overall_health_status();
        let xml = health.generate_health_status_xml().status_xml;
        assert!(!xml.contains("name=\"service\""));
        assert!(!xml.contains("name=\"threatService\""));
        assert!(xml.contains("<item name=\"threat\" value=\"1\" />"));
    }

    #[test]
    fn unchanged_render_is_not_reported() {
        let dir = TempDir::new().unwrap();
        let mut health = aggregator(&dir);
        health.add_plugin_health("av", service(0));
        health.update_overall_health_status();

        let first = health.generate_health_status_xml();
        assert!(first.has_status_changed);
        assert!(first.has_overall_changed);
        assert_eq!(
            first.overall_json,
            r#"{"health":1,"service":1,"threatService":1,"threat":1}"#
        );

        let second = health.generate_health_status_xml();
        assert!(!second.has_status_changed);
        assert!(!second.has_overall_changed);
    }

    #[test]
    fn overall_compared_with_persisted_summary() {
        let dir = TempDir::new().unwrap();
        let paths = PathsConfig::under(dir.path());
        std::fs::create_dir_all(&paths.var_dir).unwrap();
        std::fs::write(
            paths.overall_health_file(),
            r#"{"health":1,"service":1,"threatService":1,"threat":1}"#,
        )
        .unwrap();

        let mut health = HealthStatus::new(&paths);
        health.add_plugin_health("av", PluginHealthStatus::new(HealthType::Service, 0, "AV"));
        health.update_overall_health_status();
        let rendered = health.generate_health_status_xml();
        assert!(rendered.has_status_changed);
        assert!(!rendered.has_overall_changed);
    }

    #[test]
    fn reset_only_touches_threat_detection() {
        let dir = TempDir::new().unwrap();
        let mut health = aggregator(&dir);
        health.add_plugin_health("av", service(3));
        health.add_plugin_health("av", threat(3));
        health.add_plugin_health("edr", threat(2));

        health.reset_threat_detection_health();

        assert!(health
            .threat_detection_health()
            .values()
            .all(|status| status.health_value == 1));
        assert_eq!(health.service_health()["av"].health_value, 3);
    }

    #[test]
    fn threat_health_survives_restart() {
        let dir = TempDir::new().unwrap();
        {
            let mut health = aggregator(&dir);
            health.add_plugin_health("av", PluginHealthStatus::new(HealthType::ThreatDetection, 2, "AV"));
        }
        let restored = aggregator(&dir);
        let status = &restored.threat_detection_health()["av"];
        assert_eq!(status.health_value, 2);
        assert_eq!(status.display_name, "AV");
        assert_eq!(status.health_type, HealthType::ThreatDetection);
    }

    #[traced_test]
    #[test]
    fn corrupt_threat_file_yields_empty_map() {
        let dir = TempDir::new().unwrap();
        let paths = PathsConfig::under(dir.path());
        std::fs::create_dir_all(&paths.var_dir).unwrap();
        std::fs::write(paths.threat_health_file(), "{ not json").unwrap();

        let health = HealthStatus::new(&paths);
        assert!(health.threat_detection_health().is_empty());
        assert!(logs_contain("Ignoring unreadable threat health file"));
    }

    #[test]
    fn bad_fields_default() {
        let dir = TempDir::new().unwrap();
        let paths = PathsConfig::under(dir.path());
        std::fs::create_dir_all(&paths.var_dir).unwrap();
        std::fs::write(
            paths.threat_health_file(),
            r#"{"av": {"displayName": 7, "healthValue": "bad"}, "edr": {"healthValue": 2}}"#,
        )
        .unwrap();

        let health = HealthStatus::new(&paths);
        assert_eq!(health.threat_detection_health()["av"].health_value, 1);
        assert_eq!(health.threat_detection_health()["av"].display_name, "");
        assert_eq!(health.threat_detection_health()["edr"].health_value, 2);
    }
}
