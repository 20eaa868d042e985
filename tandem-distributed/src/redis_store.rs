//! Redis-backed [`KeyValueStore`].

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tandem_redis::{RedisConfig, RedisService};

use crate::store::{CompareDelete, KeyValueStore, StoreError};

/// Lock store on a pooled Redis connection.
#[derive(Clone)]
pub struct RedisStore {
    redis: Arc<RedisService>,
}

impl RedisStore {
    /// Wrap an already connected service.
    pub fn new(redis: Arc<RedisService>) -> Self {
        Self { redis }
    }

    /// Connect using `config`; fails if the server does not answer PING.
    pub async fn connect(config: RedisConfig) -> Result<Self, StoreError> {
        let redis = RedisService::new(config).await?;
        Ok(Self::new(Arc::new(redis)))
    }

    /// The underlying service.
    pub fn service(&self) -> &RedisService {
        &self.redis
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        Ok(self.redis.set_nx_px(key, value, ttl).await?)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.redis.get_value(key).await?)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.redis.delete(key).await?;
        Ok(())
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<CompareDelete, StoreError> {
        match self.redis.compare_and_delete(key, expected).await? {
            0 => Ok(CompareDelete::Absent),
            1 => Ok(CompareDelete::Deleted),
            2 => Ok(CompareDelete::Mismatch),
            other => Err(StoreError::Backend(format!(
                "unexpected compare-and-delete reply: {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DistributedLock;

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_lock_roundtrip_against_redis() {
        let store = RedisStore::connect(RedisConfig::new("redis://localhost:6379"))
            .await
            .unwrap();
        let lock = DistributedLock::new(Arc::new(store));

        let token = lock
            .acquire("redis-store-test", Duration::from_secs(1), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(lock.try_acquire("redis-store-test").await.unwrap().is_none());

        lock.release("redis-store-test", &token).await.unwrap();
    }
}
