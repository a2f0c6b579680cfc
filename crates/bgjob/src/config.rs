//! Session configuration.
//!
//! Loaded from TOML (or built in code), validated once, then frozen: the
//! launcher serializes a JSON snapshot of the effective configuration into
//! every segment it creates, and the worker applies that snapshot instead
//! of re-reading any file. A job therefore runs under the configuration
//! that was current at launch time, no matter what changes afterwards.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use bgjob_core::{DEFAULT_QUEUE_CAPACITY, MAX_QUEUE_CAPACITY, MIN_QUEUE_CAPACITY};

/// Largest accepted job payload, in bytes (4 MiB).
pub const MAX_JOB_LEN: usize = 4 * 1024 * 1024;

/// Upper bound for `max_workers`.
pub const MAX_WORKERS_CEILING: usize = 1000;

/// Longest accepted cancellation grace period, in milliseconds (1 hour).
pub const MAX_GRACE_MS: u64 = 3_600_000;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Path that was read.
        path: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A field value is out of range.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// How to start a worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerCommand {
    /// Program to execute. Resolved through `PATH` unless absolute.
    #[serde(default = "default_program")]
    pub program: String,
    /// Extra arguments placed before the segment argument.
    #[serde(default)]
    pub args: Vec<String>,
}

fn default_program() -> String {
    "bgjob-worker".to_owned()
}

impl Default for WorkerCommand {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: Vec::new(),
        }
    }
}

/// Session-wide configuration, fixed for the session's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Concurrent-worker ceiling for this session.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Queue capacity for new jobs, in bytes.
    #[serde(default = "default_queue_capacity")]
    pub default_queue_capacity: usize,

    /// Per-job execution deadline, milliseconds. `None` means unlimited.
    #[serde(default)]
    pub execution_timeout_ms: Option<u64>,

    /// Target (database or host) jobs in this session run against.
    #[serde(default)]
    pub target: String,

    /// Session-scoped settings propagated to every worker via the config
    /// snapshot. Ordered so snapshots serialize deterministically.
    #[serde(default)]
    pub settings: BTreeMap<String, String>,

    /// How to start worker processes.
    #[serde(default)]
    pub worker: WorkerCommand,
}

fn default_max_workers() -> usize {
    16
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            default_queue_capacity: default_queue_capacity(),
            execution_timeout_ms: None,
            target: String::new(),
            settings: BTreeMap::new(),
            worker: WorkerCommand::default(),
        }
    }
}

impl SessionConfig {
    /// Load and validate a configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Parse and validate a configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every field against its documented range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 || self.max_workers > MAX_WORKERS_CEILING {
            return Err(ConfigError::Invalid(format!(
                "max_workers must be between 1 and {MAX_WORKERS_CEILING}, got {}",
                self.max_workers
            )));
        }
        if !(MIN_QUEUE_CAPACITY..=MAX_QUEUE_CAPACITY).contains(&self.default_queue_capacity) {
            return Err(ConfigError::Invalid(format!(
                "default_queue_capacity must be between {MIN_QUEUE_CAPACITY} and \
                 {MAX_QUEUE_CAPACITY}, got {}",
                self.default_queue_capacity
            )));
        }
        if self.execution_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "execution_timeout_ms must be positive; omit it for no timeout".to_owned(),
            ));
        }
        if self.worker.program.is_empty() {
            return Err(ConfigError::Invalid(
                "worker.program must not be empty".to_owned(),
            ));
        }
        Ok(())
    }
}

/// The frozen per-job view of the session configuration.
///
/// Serialized to JSON into the segment at launch; deserialized by the
/// worker. Deliberately omits launcher-only fields such as the worker
/// command and the concurrency ceiling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigSnapshot {
    /// Target the job runs against.
    pub target: String,
    /// Session settings in effect at launch.
    pub settings: BTreeMap<String, String>,
    /// Execution deadline, milliseconds; `None` means unlimited.
    pub execution_timeout_ms: Option<u64>,
}

impl ConfigSnapshot {
    /// Capture the per-job view of `config`.
    #[must_use]
    pub fn capture(config: &SessionConfig) -> Self {
        Self {
            target: config.target.clone(),
            settings: config.settings.clone(),
            execution_timeout_ms: config.execution_timeout_ms,
        }
    }

    /// Serialize for embedding into a segment.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize from a segment's config region.
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        SessionConfig::default().validate().unwrap();
    }

    #[test]
    fn parses_full_toml() {
        let config = SessionConfig::from_toml(
            r#"
            max_workers = 4
            default_queue_capacity = 8192
            execution_timeout_ms = 30000
            target = "analytics"

            [settings]
            statement_timeout = "0"
            work_mem = "64MB"

            [worker]
            program = "/usr/local/bin/bgjob-worker"
            args = ["--quiet"]
            "#,
        )
        .unwrap();
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.default_queue_capacity, 8192);
        assert_eq!(config.execution_timeout_ms, Some(30_000));
        assert_eq!(config.settings["work_mem"], "64MB");
        assert_eq!(config.worker.args, vec!["--quiet"]);
    }

    #[test]
    fn rejects_out_of_range_fields() {
        assert!(SessionConfig::from_toml("max_workers = 0").is_err());
        assert!(SessionConfig::from_toml("max_workers = 5000").is_err());
        assert!(SessionConfig::from_toml("default_queue_capacity = 16").is_err());
        assert!(SessionConfig::from_toml("execution_timeout_ms = 0").is_err());
        assert!(SessionConfig::from_toml("unknown_field = 1").is_err());
    }

    #[test]
    fn snapshot_roundtrips_and_omits_launcher_fields() {
        let mut config = SessionConfig {
            target: "analytics".to_owned(),
            ..SessionConfig::default()
        };
        config
            .settings
            .insert("work_mem".to_owned(), "64MB".to_owned());
        let snapshot = ConfigSnapshot::capture(&config);
        let json = snapshot.to_json().unwrap();
        assert_eq!(ConfigSnapshot::from_json(&json).unwrap(), snapshot);
        let text = String::from_utf8(json).unwrap();
        assert!(!text.contains("max_workers"));
    }
}
