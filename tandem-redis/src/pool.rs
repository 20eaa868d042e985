//! Redis connection pool.

use bb8::{Pool, PooledConnection};
use bb8_redis::RedisConnectionManager;
use redis::aio::MultiplexedConnection;
use std::ops::{Deref, DerefMut};
use tracing::{error, info};

use crate::{RedisConfig, RedisError, Result};

/// Type alias for the connection pool.
pub type RedisPool = Pool<RedisConnectionManager>;

/// A pooled Redis connection.
pub struct RedisConnection<'a> {
    conn: PooledConnection<'a, RedisConnectionManager>,
}

impl<'a> RedisConnection<'a> {
    pub(crate) fn new(conn: PooledConnection<'a, RedisConnectionManager>) -> Self {
        Self { conn }
    }
}

impl Deref for RedisConnection<'_> {
    type Target = MultiplexedConnection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl DerefMut for RedisConnection<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

/// Builds a pool and verifies the server answers before handing it out.
pub(crate) struct RedisPoolBuilder {
    config: RedisConfig,
}

impl RedisPoolBuilder {
    pub(crate) fn new(config: RedisConfig) -> Self {
        Self { config }
    }

    pub(crate) async fn build(self) -> Result<RedisPool> {
        let manager = RedisConnectionManager::new(self.config.connection_url())
            .map_err(|e| RedisError::Config(e.to_string()))?;

        let pool = Pool::builder()
            .max_size(self.config.pool_size)
            .min_idle(self.config.min_idle)
            .connection_timeout(self.config.connection_timeout)
            .build(manager)
            .await
            .map_err(|e| RedisError::Connection(e.to_string()))?;

        // Scoped so the probe connection goes back to the pool.
        {
            let mut conn = pool.get().await?;
            let pong: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut *conn).await;
            if let Err(e) = pong {
                error!(redis = %self.config, error = %e, "Redis ping failed");
                return Err(RedisError::Connection(e.to_string()));
            }
        }

        info!(
            redis = %self.config,
            pool_size = self.config.pool_size,
            "Connected to Redis"
        );

        Ok(pool)
    }
}
