//! Environment variable and config file support.
//!
//! # Configuration Precedence
//!
//! Settings are resolved in this order (highest priority first):
//!
//! 1. **Programmatic**: values set through builder methods
//! 2. **Environment variables**: values from `EXCLUSYNC_*` env vars
//! 3. **Config file**: values loaded from a TOML file (requires `config-file` feature)
//! 4. **Defaults**: [`ExclusyncConfig::default()`]
//!
//! # Supported Environment Variables
//!
//! | Variable | Type | Maps to |
//! |----------|------|---------|
//! | `EXCLUSYNC_SCHEDULER_THREAD_NAME` | `String` | `scheduler.thread_name` |
//! | `EXCLUSYNC_FLUSH_THRESHOLD` | `usize` | `batch.flush_threshold` |
//! | `EXCLUSYNC_FLUSH_INTERVAL_MS` | `u64` | `batch.flush_interval` |
//! | `EXCLUSYNC_BUFFER_THREAD_NAME` | `String` | `batch.thread_name` |
//! | `EXCLUSYNC_WORKER_ID` | `u32` | `id.worker_id` |
//! | `EXCLUSYNC_EPOCH_MS` | `u64` | `id.epoch_ms` |
//! | `EXCLUSYNC_TIMEBACK_WAIT_MS` | `u64` | `id.timeback_wait_threshold` |

use std::time::Duration;

use crate::error::{Error, ErrorKind};
use crate::id::IdGeneratorOptions;

/// Environment variable name for the scheduler thread name.
pub const ENV_SCHEDULER_THREAD_NAME: &str = "EXCLUSYNC_SCHEDULER_THREAD_NAME";
/// Environment variable name for the batch flush threshold.
pub const ENV_FLUSH_THRESHOLD: &str = "EXCLUSYNC_FLUSH_THRESHOLD";
/// Environment variable name for the batch flush interval in milliseconds.
pub const ENV_FLUSH_INTERVAL_MS: &str = "EXCLUSYNC_FLUSH_INTERVAL_MS";
/// Environment variable name for the batch buffer thread name.
pub const ENV_BUFFER_THREAD_NAME: &str = "EXCLUSYNC_BUFFER_THREAD_NAME";
/// Environment variable name for the id generator worker id.
pub const ENV_WORKER_ID: &str = "EXCLUSYNC_WORKER_ID";
/// Environment variable name for the id generator epoch.
pub const ENV_EPOCH_MS: &str = "EXCLUSYNC_EPOCH_MS";
/// Environment variable name for the timeback wait threshold in milliseconds.
pub const ENV_TIMEBACK_WAIT_MS: &str = "EXCLUSYNC_TIMEBACK_WAIT_MS";

/// Default name of the scheduler's dedicated thread.
pub const DEFAULT_SCHEDULER_THREAD_NAME: &str = "exclusync-affinity";
/// Default name of a batch buffer's background thread.
pub const DEFAULT_BUFFER_THREAD_NAME: &str = "exclusync-batch";
/// Default batch flush threshold.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 1000;
/// Default batch flush interval.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Errors raised while reading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable is set but cannot be parsed.
    #[error("invalid value for {var}: expected {expected}, got {value:?}")]
    InvalidEnv {
        /// Variable name.
        var: &'static str,
        /// Expected type description.
        expected: &'static str,
        /// Raw value found.
        value: String,
    },

    /// A value parsed but is outside the accepted range.
    #[error("{field} out of range: {detail}")]
    OutOfRange {
        /// Field name.
        field: &'static str,
        /// What was wrong.
        detail: String,
    },

    /// The config file could not be read.
    #[cfg(feature = "config-file")]
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// File path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML for this schema.
    #[cfg(feature = "config-file")]
    #[error("failed to parse TOML config: {0}")]
    Toml(#[from] toml::de::Error),
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Self::new(ErrorKind::InvalidConfig)
            .with_message(err.to_string())
            .with_source(err)
    }
}

/// Settings for a [`Scheduler`](crate::runtime::Scheduler).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Name given to the dedicated thread.
    pub thread_name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            thread_name: DEFAULT_SCHEDULER_THREAD_NAME.to_string(),
        }
    }
}

/// Settings for a [`BatchBuffer`](crate::batch::BatchBuffer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchBufferConfig {
    /// Item count that triggers an eager flush. Must be at least 1.
    pub flush_threshold: usize,
    /// Time since the last flush that triggers a background flush. Zero
    /// means pending items are flushed as soon as the background thread sees
    /// them.
    pub flush_interval: Duration,
    /// Name given to the background thread.
    pub thread_name: String,
}

impl BatchBufferConfig {
    /// Checks the value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flush_threshold == 0 {
            return Err(ConfigError::OutOfRange {
                field: "flush_threshold",
                detail: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for BatchBufferConfig {
    fn default() -> Self {
        Self {
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            thread_name: DEFAULT_BUFFER_THREAD_NAME.to_string(),
        }
    }
}

/// Settings for every component, as loaded from the environment or a file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExclusyncConfig {
    /// Scheduler settings.
    pub scheduler: SchedulerConfig,
    /// Batch buffer settings.
    pub batch: BatchBufferConfig,
    /// Identifier generator settings.
    pub id: IdGeneratorOptions,
}

impl ExclusyncConfig {
    /// Defaults overridden by any `EXCLUSYNC_*` variables that are set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        apply_env_overrides(&mut config)?;
        Ok(config)
    }

    /// Defaults, overridden by the TOML file at `path`, overridden by the
    /// environment.
    #[cfg(feature = "config-file")]
    pub fn from_file_and_env(path: &std::path::Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        apply_toml_config(&mut config, &parse_toml_file(path)?);
        apply_env_overrides(&mut config)?;
        Ok(config)
    }
}

/// Apply environment variable overrides to an [`ExclusyncConfig`].
///
/// Only variables that are set in the environment are applied.
/// Returns an error if a variable is set but contains an unparseable value.
pub fn apply_env_overrides(config: &mut ExclusyncConfig) -> Result<(), ConfigError> {
    if let Some(val) = read_env(ENV_SCHEDULER_THREAD_NAME) {
        config.scheduler.thread_name = val;
    }
    if let Some(val) = read_env(ENV_FLUSH_THRESHOLD) {
        config.batch.flush_threshold = parse_usize(ENV_FLUSH_THRESHOLD, &val)?;
    }
    if let Some(val) = read_env(ENV_FLUSH_INTERVAL_MS) {
        config.batch.flush_interval =
            Duration::from_millis(parse_u64(ENV_FLUSH_INTERVAL_MS, &val)?);
    }
    if let Some(val) = read_env(ENV_BUFFER_THREAD_NAME) {
        config.batch.thread_name = val;
    }
    if let Some(val) = read_env(ENV_WORKER_ID) {
        config.id.worker_id = parse_u32(ENV_WORKER_ID, &val)?;
    }
    if let Some(val) = read_env(ENV_EPOCH_MS) {
        config.id.epoch_ms = parse_u64(ENV_EPOCH_MS, &val)?;
    }
    if let Some(val) = read_env(ENV_TIMEBACK_WAIT_MS) {
        config.id.timeback_wait_threshold =
            Duration::from_millis(parse_u64(ENV_TIMEBACK_WAIT_MS, &val)?);
    }
    Ok(())
}

/// Read an environment variable, returning `None` if unset.
fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn parse_usize(var: &'static str, val: &str) -> Result<usize, ConfigError> {
    val.trim().parse::<usize>().map_err(|_| ConfigError::InvalidEnv {
        var,
        expected: "unsigned integer",
        value: val.to_string(),
    })
}

fn parse_u32(var: &'static str, val: &str) -> Result<u32, ConfigError> {
    val.trim().parse::<u32>().map_err(|_| ConfigError::InvalidEnv {
        var,
        expected: "u32",
        value: val.to_string(),
    })
}

fn parse_u64(var: &'static str, val: &str) -> Result<u64, ConfigError> {
    val.trim().parse::<u64>().map_err(|_| ConfigError::InvalidEnv {
        var,
        expected: "u64",
        value: val.to_string(),
    })
}

// =========================================================================
// TOML config file support (feature-gated)
// =========================================================================

/// TOML-deserializable configuration.
///
/// ```toml
/// [scheduler]
/// thread_name = "orders-affinity"
///
/// [batch]
/// flush_threshold = 300
/// flush_interval_ms = 1000
/// thread_name = "orders-batch"
///
/// [id]
/// worker_id = 12
/// epoch_ms = 1640995200000
/// timeback_wait_ms = 10000
/// ```
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
#[serde(deny_unknown_fields)]
pub struct TomlConfig {
    /// Scheduler settings.
    #[serde(default)]
    pub scheduler: SchedulerToml,
    /// Batch buffer settings.
    #[serde(default)]
    pub batch: BatchToml,
    /// Identifier generator settings.
    #[serde(default)]
    pub id: IdToml,
}

/// Scheduler section of the TOML config.
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
#[serde(deny_unknown_fields)]
pub struct SchedulerToml {
    /// Dedicated thread name.
    pub thread_name: Option<String>,
}

/// Batch buffer section of the TOML config.
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
#[serde(deny_unknown_fields)]
pub struct BatchToml {
    /// Flush threshold in items.
    pub flush_threshold: Option<usize>,
    /// Flush interval in milliseconds.
    pub flush_interval_ms: Option<u64>,
    /// Background thread name.
    pub thread_name: Option<String>,
}

/// Identifier generator section of the TOML config.
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
#[serde(deny_unknown_fields)]
pub struct IdToml {
    /// Worker id.
    pub worker_id: Option<u32>,
    /// Epoch in milliseconds since the Unix epoch.
    pub epoch_ms: Option<u64>,
    /// Timeback wait threshold in milliseconds.
    pub timeback_wait_ms: Option<u64>,
}

/// Apply a parsed TOML config. Only fields that are `Some` override.
#[cfg(feature = "config-file")]
pub fn apply_toml_config(config: &mut ExclusyncConfig, toml: &TomlConfig) {
    if let Some(ref v) = toml.scheduler.thread_name {
        config.scheduler.thread_name.clone_from(v);
    }
    if let Some(v) = toml.batch.flush_threshold {
        config.batch.flush_threshold = v;
    }
    if let Some(v) = toml.batch.flush_interval_ms {
        config.batch.flush_interval = Duration::from_millis(v);
    }
    if let Some(ref v) = toml.batch.thread_name {
        config.batch.thread_name.clone_from(v);
    }
    if let Some(v) = toml.id.worker_id {
        config.id.worker_id = v;
    }
    if let Some(v) = toml.id.epoch_ms {
        config.id.epoch_ms = v;
    }
    if let Some(v) = toml.id.timeback_wait_ms {
        config.id.timeback_wait_threshold = Duration::from_millis(v);
    }
}

/// Parse a TOML string into a [`TomlConfig`].
#[cfg(feature = "config-file")]
pub fn parse_toml_str(toml_str: &str) -> Result<TomlConfig, ConfigError> {
    Ok(toml::from_str(toml_str)?)
}

/// Read and parse a TOML file into a [`TomlConfig`].
#[cfg(feature = "config-file")]
pub fn parse_toml_file(path: &std::path::Path) -> Result<TomlConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_toml_str(&content)
}
