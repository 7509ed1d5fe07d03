//! Tracing subscriber setup shared by the agent and plugin binaries.

use crate::config::LoggingConfig;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LoggingError {
    #[error("invalid log level `{level}`: {reason}")]
    InvalidLevel { level: String, reason: String },

    #[error("unknown log format `{0}` (expected `human` or `json`)")]
    UnknownFormat(String),

    #[error("a global subscriber is already installed")]
    AlreadyInitialized,
}

/// Build the level filter. `RUST_LOG` wins over the configured level.
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.level).map_err(|e| LoggingError::InvalidLevel {
        level: config.level.clone(),
        reason: e.to_string(),
    })
}

/// Install the global subscriber described by `config`.
pub fn init(config: &LoggingConfig) -> Result<(), LoggingError> {
    let filter = env_filter(config)?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let result = match config.format.as_str() {
        "human" => builder.try_init(),
        "json" => builder.json().try_init(),
        other => return Err(LoggingError::UnknownFormat(other.to_owned())),
    };
    result.map_err(|_| LoggingError::AlreadyInitialized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_format() {
        let config = LoggingConfig {
            level: "info".to_owned(),
            format: "xml".to_owned(),
        };
        assert!(matches!(init(&config), Err(LoggingError::UnknownFormat(f)) if f == "xml"));
    }

    #[test]
    fn accepts_directive_levels() {
        let config = LoggingConfig {
            level: "bastion_agent=debug,warn".to_owned(),
            format: "human".to_owned(),
        };
        assert!(env_filter(&config).is_ok());
    }
}
