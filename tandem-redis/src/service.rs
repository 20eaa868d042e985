//! Redis service wrapping the pool with the commands tandem needs.

use redis::AsyncCommands;
use std::future::Future;
use std::time::Duration;

use crate::{
    RedisConfig, RedisError, Result,
    pool::{RedisConnection, RedisPool, RedisPoolBuilder},
};

/// Redis service providing a connection pool and the key-value commands
/// used for lock arbitration.
pub struct RedisService {
    config: RedisConfig,
    pool: RedisPool,
}

impl RedisService {
    /// Connect, build the pool and ping the server once.
    pub async fn new(config: RedisConfig) -> Result<Self> {
        let pool = RedisPoolBuilder::new(config.clone()).build().await?;
        Ok(Self { config, pool })
    }

    /// Create from an existing pool.
    pub fn from_pool(config: RedisConfig, pool: RedisPool) -> Self {
        Self { config, pool }
    }

    /// Get the configuration.
    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    /// Get a connection from the pool.
    pub async fn get(&self) -> Result<RedisConnection<'_>> {
        let conn = self.pool.get().await?;
        Ok(RedisConnection::new(conn))
    }

    /// Check if the connection is healthy.
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.get().await?;
        let _: String = self
            .bounded(redis::cmd("PING").query_async(&mut *conn))
            .await
            .map_err(|e| RedisError::Connection(e.to_string()))?;
        Ok(())
    }

    /// Get pool statistics.
    pub fn pool_stats(&self) -> PoolStats {
        let state = self.pool.state();
        PoolStats {
            connections: state.connections,
            idle_connections: state.idle_connections,
        }
    }

    /// Get a string value.
    pub async fn get_value(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.get().await?;
        self.bounded(conn.get(key)).await
    }

    /// `SET key value NX PX ttl`; returns whether the key was created.
    pub async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.get().await?;
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let reply: Option<String> = self
            .bounded(
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_ms)
                    .query_async(&mut *conn),
            )
            .await?;
        Ok(reply.is_some())
    }

    /// Delete `key` only if it currently holds `expected`, atomically.
    ///
    /// Replies `0` when the key is absent, `1` when it was deleted and `2`
    /// when it holds a different value.
    pub async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<i64> {
        let script = redis::Script::new(
            r#"
            local current = redis.call("get", KEYS[1])
            if not current then
                return 0
            elseif current == ARGV[1] then
                redis.call("del", KEYS[1])
                return 1
            else
                return 2
            end
        "#,
        );

        let mut conn = self.get().await?;
        self.bounded(script.key(key).arg(expected).invoke_async(&mut *conn))
            .await
    }

    /// Delete a key.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.get().await?;
        let deleted: u32 = self.bounded(conn.del(key)).await?;
        Ok(deleted > 0)
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.config.command_timeout, fut).await {
            Ok(result) => result.map_err(RedisError::from),
            Err(_) => Err(RedisError::Timeout),
        }
    }
}

/// Connection pool statistics.
#[derive(Debug, Clone)]
pub struct PoolStats {
    /// Total connections.
    pub connections: u32,
    /// Idle connections.
    pub idle_connections: u32,
}
