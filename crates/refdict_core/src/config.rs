//! Service configuration.
//!
//! # Responsibility
//! - Describe everything needed to open a store, log and import feeds.
//! - Load from JSON with defaults for omitted keys, then validate.
//!
//! # Invariants
//! - A validated config never carries an empty feed tag or a zero timeout.

use crate::db::{StoreTarget, DEFAULT_BUSY_TIMEOUT};
use crate::feed::layout::FeedLayout;
use crate::logging::default_log_level;
use crate::repo::sync_lease::DEFAULT_LEASE_TIMEOUT;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration loading or validation failure.
#[derive(Debug)]
pub enum ConfigError {
    Io { path: PathBuf, source: std::io::Error },
    Parse(serde_json::Error),
    Invalid(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "failed to read config `{}`: {source}", path.display())
            }
            Self::Parse(err) => write!(f, "invalid config json: {err}"),
            Self::Invalid(message) => write!(f, "invalid config: {message}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse(err) => Some(err),
            Self::Invalid(_) => None,
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(value: serde_json::Error) -> Self {
        Self::Parse(value)
    }
}

/// Runtime settings for the dictionary service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    /// Database file; `None` keeps the store in memory.
    pub db_path: Option<PathBuf>,
    pub log_level: String,
    /// Absolute directory for rolling log files; `None` disables file logging.
    pub log_dir: Option<PathBuf>,
    pub busy_timeout_ms: u64,
    /// Age after which an unreleased import lease may be taken over.
    pub sync_lease_timeout_secs: u64,
    pub feed_layout: FeedLayout,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            log_level: default_log_level().to_string(),
            log_dir: None,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT.as_millis() as u64,
            sync_lease_timeout_secs: DEFAULT_LEASE_TIMEOUT.as_secs(),
            feed_layout: FeedLayout::default(),
        }
    }
}

impl ServiceConfig {
    /// Parses and validates a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.busy_timeout_ms == 0 {
            return Err(ConfigError::Invalid("busy_timeout_ms must be positive".to_string()));
        }
        if self.sync_lease_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "sync_lease_timeout_secs must be positive".to_string(),
            ));
        }
        if let Some(dir) = &self.log_dir {
            if !dir.is_absolute() {
                return Err(ConfigError::Invalid(format!(
                    "log_dir must be an absolute path, got `{}`",
                    dir.display()
                )));
            }
        }

        let layout = &self.feed_layout;
        let tags = [
            ("root", Some(&layout.root)),
            ("header", Some(&layout.header)),
            ("header_kind", Some(&layout.header_kind)),
            ("header_version", Some(&layout.header_version)),
            ("header_date", Some(&layout.header_date)),
            ("entry", Some(&layout.entry)),
            ("id", layout.id.as_ref()),
            ("code", Some(&layout.code)),
            ("name", Some(&layout.name)),
            ("begin_date", Some(&layout.begin_date)),
            ("end_date", Some(&layout.end_date)),
        ];
        for (key, value) in tags {
            if value.is_some_and(|tag| tag.trim().is_empty()) {
                return Err(ConfigError::Invalid(format!(
                    "feed_layout.{key} must not be empty"
                )));
            }
        }
        Ok(())
    }

    pub fn store_target(&self) -> StoreTarget {
        match &self.db_path {
            Some(path) => StoreTarget::File(path.clone()),
            None => StoreTarget::Memory,
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn sync_lease_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_lease_timeout_secs)
    }
}
