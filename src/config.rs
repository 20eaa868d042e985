// Layered settings: TOML file, then `.env`, then `TANDEM_*` variables

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tandem_distributed::LockConfig;
use tandem_log::LogConfig;
use tandem_messaging::MessagingConfig;
use tandem_redis::{RedisConfig, RedisConfigBuilder};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to load .env: {0}")]
    Dotenv(#[from] dotenvy::Error),

    #[error("Invalid value {value:?} for {key}: {reason}")]
    InvalidEnv {
        key: String,
        value: String,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Settings for every tandem component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub redis: RedisConfig,
    pub lock: LockConfig,
    pub messaging: MessagingConfig,
    pub log: LogConfig,
}

impl Settings {
    /// Load `path` (if given), then `.env`, then the process environment.
    ///
    /// A missing `.env` is not an error; a missing settings file is.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(loaded) => debug!(path = %loaded.display(), "Loaded .env"),
            Err(e) if e.not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let settings = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        let mut settings = settings.merge_env(|key| env::var(key).ok())?;
        settings.redis = RedisConfigBuilder::from_config(settings.redis)
            .apply_env()
            .build();
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply `TANDEM_*` overrides found through `lookup`.
    pub fn merge_env<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(secs) = parsed::<u64, _>(&lookup, "TANDEM_ACQUIRE_TIMEOUT_SECS")? {
            self.lock.acquire_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parsed::<u64, _>(&lookup, "TANDEM_LOCK_TIMEOUT_SECS")? {
            self.lock.lock_timeout = Duration::from_secs(secs);
        }

        if let Some(endpoints) = lookup("TANDEM_MQ_ENDPOINTS") {
            self.messaging.endpoints = list(&endpoints);
        }
        if let Some(topics) = lookup("TANDEM_MQ_TOPICS") {
            self.messaging.topics = list(&topics);
        }
        if let Some(group_id) = lookup("TANDEM_MQ_GROUP_ID") {
            self.messaging.group_id = group_id.trim().to_string();
        }
        if let Some(retries) = parsed::<u32, _>(&lookup, "TANDEM_MQ_SEND_RETRY_MAX")? {
            self.messaging.send_retry_max = retries;
        }
        if let Some(limit) = parsed::<usize, _>(&lookup, "TANDEM_MQ_MAX_IN_FLIGHT")? {
            self.messaging.max_in_flight = (limit > 0).then_some(limit);
        }

        self.log = self.log.merge_env(&lookup);
        Ok(self)
    }
}

fn list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parsed<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let Some(value) = lookup(key) else {
        return Ok(None);
    };
    match value.trim().parse::<T>() {
        Ok(parsed) => Ok(Some(parsed)),
        Err(e) => Err(ConfigError::InvalidEnv {
            key: key.to_string(),
            reason: e.to_string(),
            value,
        }),
    }
}
