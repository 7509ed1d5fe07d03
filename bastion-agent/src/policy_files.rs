//! Naming rules for files in the policy and action drop directories.
//!
//! - policies: `<APPID>[-<n>]_policy.<ext>`
//! - actions: `<APPID>[_<correlationId>]_action_<suffix>.<ext>`
//!
//! `ext` is `xml` or `json`.

use std::path::Path;

/// A recognised action file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionFile<'a> {
    pub app_id: &'a str,
    pub correlation_id: &'a str,
}

fn strip_document_extension(file_name: &str) -> Option<&str> {
    if file_name.starts_with('.') {
        return None;
    }
    file_name
        .strip_suffix(".xml")
        .or_else(|| file_name.strip_suffix(".json"))
}

fn valid_app_id(app_id: &str) -> bool {
    !app_id.is_empty() && app_id.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Whether `id` is usable as a file name component: `[A-Za-z0-9_-]+`.
///
/// Plugin names and app ids arrive over the wire and end up in paths.
pub fn is_safe_identifier(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// App id of a policy file, if `file_name` is one.
pub fn policy_app_id(file_name: &str) -> Option<&str> {
    let stem = strip_document_extension(file_name)?.strip_suffix("_policy")?;
    let app_id = match stem.rsplit_once('-') {
        Some((app_id, n)) if !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()) => app_id,
        _ => stem,
    };
    valid_app_id(app_id).then_some(app_id)
}

/// App id and correlation id of an action file, if `file_name` is one.
pub fn parse_action_file(file_name: &str) -> Option<ActionFile<'_>> {
    let stem = strip_document_extension(file_name)?;
    let (head, suffix) = stem.split_once("_action_")?;
    if suffix.is_empty() {
        return None;
    }
    let (app_id, correlation_id) = head.split_once('_').unwrap_or((head, ""));
    valid_app_id(app_id).then_some(ActionFile {
        app_id,
        correlation_id,
    })
}

/// Current policy files for `app_id`, sorted by name.
pub fn policy_files_for_app(policy_dir: &Path, app_id: &str) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(policy_dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .flatten()
        .filter(|entry| entry.file_type().is_ok_and(|kind| kind.is_file()))
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| policy_app_id(name) == Some(app_id))
        .collect();
    names.sort();
    names
}

/// Every policy file in `policy_dir` with its app id, sorted by name.
pub fn all_policy_files(policy_dir: &Path) -> Vec<(String, String)> {
    let Ok(entries) = std::fs::read_dir(policy_dir) else {
        return Vec::new();
    };
    let mut files: Vec<(String, String)> = entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            let app_id = policy_app_id(&name)?.to_owned();
            Some((app_id, name))
        })
        .collect();
    files.sort_by(|a, b| a.1.cmp(&b.1));
    files
}
