//! Plugin-side telemetry.
//!
//! Plugins accumulate counters and values in a [`TelemetryStore`] and return
//! its JSON form from their `GetTelemetry` callback. The store can be persisted
//! on shutdown and restored at startup so counters survive a plugin restart.

use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, warn};

/// Telemetry persistence errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TelemetryError {
    #[error("Telemetry I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Telemetry document must be a JSON object")]
    NotAnObject,

    #[error("No persistence file configured")]
    NoPersistenceFile,
}

/// Thread-safe key/value telemetry document.
#[derive(Debug, Default)]
pub struct TelemetryStore {
    values: Mutex<Map<String, Value>>,
    persist_path: Option<PathBuf>,
}

impl TelemetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that saves to and restores from `path`.
    pub fn with_file(path: impl Into<PathBuf>) -> Self {
        Self {
            values: Mutex::new(Map::new()),
            persist_path: Some(path.into()),
        }
    }

    pub fn persist_path(&self) -> Option<&Path> {
        self.persist_path.as_deref()
    }

    fn values(&self) -> MutexGuard<'_, Map<String, Value>> {
        self.values.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set `key` to `value`, replacing whatever was there.
    pub fn set(&self, key: &str, value: impl Into<Value>) {
        self.values().insert(key.to_owned(), value.into());
    }

    /// Set `key` to the current UTC time (RFC 3339).
    pub fn set_timestamp(&self, key: &str) {
        self.set(key, chrono::Utc::now().to_rfc3339());
    }

    /// Add `by` to the integer at `key`. Missing or non-integer values start at 0.
    pub fn increment(&self, key: &str, by: i64) {
        let mut values = self.values();
        let current = values.get(key).and_then(Value::as_i64).unwrap_or(0);
        values.insert(key.to_owned(), Value::from(current.saturating_add(by)));
    }

    /// Append `value` to the array at `key`, creating it if needed.
    pub fn append(&self, key: &str, value: impl Into<Value>) {
        let mut values = self.values();
        match values.get_mut(key) {
            Some(Value::Array(items)) => items.push(value.into()),
            _ => {
                values.insert(key.to_owned(), Value::Array(vec![value.into()]));
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.values().get(key).cloned()
    }

    /// Drop all values.
    pub fn reset(&self) {
        self.values().clear();
    }

    /// Current document as compact JSON.
    pub fn to_json(&self) -> String {
        Value::Object(self.values().clone()).to_string()
    }

    /// Write the document to the persistence file.
    pub fn save(&self) -> Result<(), TelemetryError> {
        let path = self
            .persist_path
            .as_deref()
            .ok_or(TelemetryError::NoPersistenceFile)?;
        let json = serde_json::to_string(&*self.values())?;
        crate::files::write_atomically_blocking(path, &json).map_err(|source| TelemetryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(file = %path.display(), "Telemetry saved");
        Ok(())
    }

    /// Replace the in-memory document with the persisted one.
    ///
    /// A missing file is not an error; the store simply stays empty.
    pub fn restore(&self) -> Result<(), TelemetryError> {
        let path = self
            .persist_path
            .as_deref()
            .ok_or(TelemetryError::NoPersistenceFile)?;
        let json = match std::fs::read_to_string(path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(source) => {
                return Err(TelemetryError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        match serde_json::from_str::<Value>(&json)? {
            Value::Object(map) => {
                *self.values() = map;
                Ok(())
            }
            _ => {
                warn!(file = %path.display(), "Persisted telemetry is not a JSON object");
                Err(TelemetryError::NotAnObject)
            }
        }
    }
}
