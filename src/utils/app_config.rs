/// Application configuration management
/// Stores settings in ~/.config/roleback/config.toml unless --config points elsewhere

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::utils::{
    DEFAULT_ARCHIVE_IMAGE, DEFAULT_ARCHIVE_PREFIX, DEFAULT_ARCHIVE_TIMEOUT, DEFAULT_DUMP_TIMEOUT,
    DEFAULT_INITIAL_DELAY, DEFAULT_LOCK_FILE, DEFAULT_MAX_ATTEMPTS, DEFAULT_REDIS_SAVE_TIMEOUT,
    DEFAULT_SINK_BINARY, DEFAULT_WORK_ROOT,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not determine the user configuration directory")]
    NoConfigDir,

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to load env file {path}: {message}")]
    EnvFile { path: PathBuf, message: String },

    #[error("invalid exclude pattern '{pattern}': {source}")]
    Exclude {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("retry.max_attempts must be at least 1")]
    ZeroAttempts,

    #[error("sink repository is not configured (set sink.repository or RESTIC_REPOSITORY)")]
    MissingRepository,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Parent directory of the per-run working directory
    pub work_root: PathBuf,
    /// Single-instance lock file
    pub lock_file: PathBuf,
    /// Prefix of the archive name handed to the sink
    pub archive_name_prefix: String,
    /// Optional dotenv file with sink secrets (RESTIC_PASSWORD and friends)
    pub env_file: Option<PathBuf>,
    /// Regexes over workload names that are left out of the run
    pub exclude: Vec<String>,
    /// Image used to tar named volumes
    pub archive_image: String,
    pub retry: RetrySettings,
    pub timeouts: TimeoutSettings,
    pub sink: SinkSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    #[serde(with = "human_duration")]
    pub initial_delay: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    #[serde(with = "human_duration")]
    pub dump: Duration,
    #[serde(with = "human_duration")]
    pub archive: Duration,
    #[serde(with = "human_duration")]
    pub redis_save: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    Restic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkSettings {
    pub kind: SinkKind,
    pub repository: Option<String>,
    pub binary: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            work_root: PathBuf::from(DEFAULT_WORK_ROOT),
            lock_file: PathBuf::from(DEFAULT_LOCK_FILE),
            archive_name_prefix: DEFAULT_ARCHIVE_PREFIX.to_string(),
            env_file: None,
            exclude: Vec::new(),
            archive_image: DEFAULT_ARCHIVE_IMAGE.to_string(),
            retry: RetrySettings::default(),
            timeouts: TimeoutSettings::default(),
            sink: SinkSettings::default(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: DEFAULT_INITIAL_DELAY,
        }
    }
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            dump: DEFAULT_DUMP_TIMEOUT,
            archive: DEFAULT_ARCHIVE_TIMEOUT,
            redis_save: DEFAULT_REDIS_SAVE_TIMEOUT,
        }
    }
}

impl Default for SinkSettings {
    fn default() -> Self {
        Self {
            kind: SinkKind::Restic,
            repository: None,
            binary: DEFAULT_SINK_BINARY.to_string(),
        }
    }
}

impl AppConfig {
    /// Get default config file path
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        let config_dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(config_dir.join("roleback").join("config.toml"))
    }

    /// Load configuration from an explicit path, or the default path.
    ///
    /// A missing default file yields the built-in defaults; a missing explicit
    /// file is an error.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, required) = match explicit {
            Some(path) => (path.to_path_buf(), true),
            None => (Self::config_path()?, false),
        };

        if !required && !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;

        Self::from_toml(&contents, &path)
    }

    fn from_toml(contents: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no run could succeed with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        self.exclude_patterns()?;
        Ok(())
    }

    /// Compiled workload exclusion patterns
    pub fn exclude_patterns(&self) -> Result<Vec<Regex>, ConfigError> {
        self.exclude
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|source| ConfigError::Exclude {
                    pattern: pattern.clone(),
                    source,
                })
            })
            .collect()
    }

    /// Load the optional dotenv file into the process environment
    pub fn load_env_file(&self) -> Result<(), ConfigError> {
        if let Some(path) = &self.env_file {
            dotenv::from_path(path).map_err(|err| ConfigError::EnvFile {
                path: path.clone(),
                message: err.to_string(),
            })?;
        }
        Ok(())
    }

    /// Sink repository, falling back to RESTIC_REPOSITORY
    pub fn sink_repository(&self) -> Result<String, ConfigError> {
        self.sink
            .repository
            .clone()
            .or_else(|| std::env::var("RESTIC_REPOSITORY").ok())
            .filter(|repo| !repo.is_empty())
            .ok_or(ConfigError::MissingRepository)
    }

    /// Render the effective configuration
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

/// `"5s"`, `"2h"` style durations in TOML
mod human_duration {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
