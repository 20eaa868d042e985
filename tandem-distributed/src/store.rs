//! Key-value store seam used as the lock arbiter.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Infrastructure failures reported by a store.
///
/// Contention is never a `StoreError`; it is the `false` branch of
/// [`KeyValueStore::set_if_absent`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The store answered with an error.
    #[error("Store error: {0}")]
    Backend(String),
}

impl From<tandem_redis::RedisError> for StoreError {
    fn from(err: tandem_redis::RedisError) -> Self {
        if err.is_connection_error() || err.is_retryable() {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Backend(err.to_string())
        }
    }
}

/// Result of [`KeyValueStore::delete_if_equals`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareDelete {
    /// The key held the expected value and was removed.
    Deleted,
    /// The key did not exist.
    Absent,
    /// The key holds some other value and was left alone.
    Mismatch,
}

/// Minimal key-value capabilities a lock needs.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Atomically create `key` with `value` and expiry `ttl` unless it exists.
    ///
    /// Returns `Ok(true)` when the key was created, `Ok(false)` when it was
    /// already present.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Read the current value, `None` if the key is absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Remove `key`. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Remove `key` only while it still holds `expected`.
    ///
    /// The default is a plain `get` followed by `delete`; stores that can do
    /// the comparison server-side should override it.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<CompareDelete, StoreError> {
        match self.get(key).await? {
            None => Ok(CompareDelete::Absent),
            Some(current) if current == expected => {
                self.delete(key).await?;
                Ok(CompareDelete::Deleted)
            }
            Some(_) => Ok(CompareDelete::Mismatch),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

/// In-process store with TTL expiry on the tokio clock.
///
/// Expiry is evaluated lazily on access, so `tokio::time::pause` and
/// `tokio::time::advance` fast-forward lock lifetimes in tests.
#[derive(Debug)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    available: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Toggle availability; while unavailable every call fails with
    /// [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of live (unexpired) keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|e| e.expires_at > now)
            .count()
    }

    /// Whether the store holds no live keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrite a key unconditionally. Test helper for simulating another
    /// holder taking over after expiry.
    pub fn insert(&self, key: &str, value: &str, ttl: Duration) {
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store disabled".to_string()))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.check_available()?;
        let now = Instant::now();
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.get(key)
            && entry.expires_at > now
        {
            return Ok(false);
        }

        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check_available()?;
        let now = Instant::now();
        let mut entries = self.entries.lock();

        let expired = match entries.get(key) {
            Some(entry) if entry.expires_at > now => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check_available()?;
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<CompareDelete, StoreError> {
        self.check_available()?;
        let now = Instant::now();
        let mut entries = self.entries.lock();

        let outcome = match entries.get(key) {
            Some(entry) if entry.expires_at <= now => CompareDelete::Absent,
            Some(entry) if entry.value == expected => CompareDelete::Deleted,
            Some(_) => return Ok(CompareDelete::Mismatch),
            None => return Ok(CompareDelete::Absent),
        };
        entries.remove(key);
        Ok(outcome)
    }
}
