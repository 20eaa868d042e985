//! Redis configuration.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Redis configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Redis URL (redis://host:port or rediss://host:port for TLS).
    pub url: String,
    /// Connection pool size.
    pub pool_size: u32,
    /// Minimum idle connections.
    pub min_idle: Option<u32>,
    /// Connection timeout.
    #[serde(with = "seconds")]
    pub connection_timeout: Duration,
    /// Command timeout.
    #[serde(with = "seconds")]
    pub command_timeout: Duration,
    /// Database number (0-15).
    pub database: Option<u8>,
    /// Username for Redis 6+ ACL.
    pub username: Option<String>,
    /// Password.
    pub password: Option<String>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            pool_size: 10,
            min_idle: Some(1),
            connection_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(30),
            database: None,
            username: None,
            password: None,
        }
    }
}

impl RedisConfig {
    /// Create a new configuration.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Create a builder.
    pub fn builder() -> RedisConfigBuilder {
        RedisConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> RedisConfigBuilder {
        RedisConfigBuilder::new().apply_env()
    }

    /// Get the full Redis URL with auth and database.
    pub fn connection_url(&self) -> String {
        let mut url = self.url.clone();

        if let Some(password) = &self.password {
            let auth = match &self.username {
                Some(username) => format!("{}:{}@", username, password),
                None => format!(":{}@", password),
            };
            url = url.replacen("redis://", &format!("redis://{}", auth), 1);
            url = url.replacen("rediss://", &format!("rediss://{}", auth), 1);
        }

        if let Some(db) = self.database {
            let path_start = url.find("://").map(|i| i + 3).unwrap_or(0);
            if !url[path_start..].contains('/') {
                url = format!("{}/{}", url, db);
            }
        }

        url
    }
}

impl fmt::Display for RedisConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}][{}], db[{}]",
            self.url,
            if self.password.is_some() { "******" } else { "" },
            self.database.unwrap_or(0)
        )
    }
}

/// Builder for Redis configuration.
#[derive(Default)]
pub struct RedisConfigBuilder {
    config: RedisConfig,
}

impl RedisConfigBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            config: RedisConfig::default(),
        }
    }

    /// Start from an existing configuration.
    pub fn from_config(config: RedisConfig) -> Self {
        Self { config }
    }

    /// Override fields from `REDIS_*` environment variables.
    pub fn apply_env(mut self) -> Self {
        if let Ok(url) = std::env::var("REDIS_URL") {
            self = self.url(url);
        }

        if let Ok(pool_size) = std::env::var("REDIS_POOL_SIZE")
            && let Ok(size) = pool_size.parse()
        {
            self = self.pool_size(size);
        }

        if let Ok(db) = std::env::var("REDIS_DATABASE")
            && let Ok(db_num) = db.parse()
        {
            self = self.database(db_num);
        }

        if let Ok(username) = std::env::var("REDIS_USERNAME") {
            self = self.username(username);
        }

        if let Ok(password) = std::env::var("REDIS_PASSWORD") {
            self = self.password(password);
        }

        self
    }

    /// Set the Redis URL.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.config.url = url.into();
        self
    }

    /// Set the URL from separate host and port.
    pub fn host_port(mut self, host: &str, port: u16) -> Self {
        self.config.url = format!("redis://{}:{}", host, port);
        self
    }

    /// Set the pool size.
    pub fn pool_size(mut self, size: u32) -> Self {
        self.config.pool_size = size;
        self
    }

    /// Set the minimum idle connections.
    pub fn min_idle(mut self, min_idle: u32) -> Self {
        self.config.min_idle = Some(min_idle);
        self
    }

    /// Set the connection timeout.
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_timeout = timeout;
        self
    }

    /// Set the command timeout.
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.config.command_timeout = timeout;
        self
    }

    /// Set the database number.
    pub fn database(mut self, db: u8) -> Self {
        self.config.database = Some(db);
        self
    }

    /// Set the username (Redis 6+ ACL).
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.config.username = Some(username.into());
        self
    }

    /// Set the password.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.config.password = Some(password.into());
        self
    }

    /// Build the configuration.
    pub fn build(self) -> RedisConfig {
        self.config
    }
}

mod seconds {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_url_with_password_and_db() {
        let config = RedisConfig::builder()
            .host_port("cache.internal", 6380)
            .password("secret")
            .database(3)
            .build();

        assert_eq!(config.connection_url(), "redis://:secret@cache.internal:6380/3");
    }

    #[test]
    fn test_connection_url_with_acl_user() {
        let config = RedisConfig::builder()
            .url("rediss://cache.internal:6379")
            .username("svc")
            .password("pw")
            .build();

        assert_eq!(config.connection_url(), "rediss://svc:pw@cache.internal:6379");
    }

    #[test]
    fn test_display_masks_password() {
        let config = RedisConfig::builder().password("hunter2").database(1).build();
        let shown = config.to_string();

        assert!(!shown.contains("hunter2"));
        assert!(shown.contains("******"));
        assert!(shown.contains("db[1]"));
    }

    #[test]
    fn test_deserialize_partial_uses_defaults() {
        let config: RedisConfig =
            serde_json::from_str(r#"{"url": "redis://10.0.0.1:6379", "connection_timeout": 2}"#)
                .unwrap();

        assert_eq!(config.url, "redis://10.0.0.1:6379");
        assert_eq!(config.connection_timeout, Duration::from_secs(2));
        assert_eq!(config.pool_size, 10);
    }
}
