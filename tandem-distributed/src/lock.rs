//! Token-based distributed locks over a [`KeyValueStore`].

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::store::{CompareDelete, KeyValueStore, StoreError};

/// Default time `acquire` keeps retrying.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default expiry of a lock entry.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Default pause between contended attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Default prefix prepended to resource names to form store keys.
pub const DEFAULT_KEY_PREFIX: &str = "LOCK-";

/// Distributed lock errors
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Lock resource name must not be empty")]
    InvalidResource,

    #[error("Timed out after {waited:?} waiting for lock on {resource}")]
    Timeout { resource: String, waited: Duration },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LockError {
    /// Whether the failure came from the store rather than contention.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, LockError::Store(_))
    }
}

/// Opaque proof of ownership handed out by a successful acquire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockToken(String);

impl LockToken {
    fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The raw token value stored under the lock key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for LockToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a release found in the store. Every variant counts as success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The caller still held the lock and it was deleted.
    Released,
    /// Nothing was stored: already released or expired.
    AlreadyReleased,
    /// Someone else holds the lock now; it was left untouched.
    HeldByOther,
}

/// Lock timing and naming.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    #[serde(rename = "acquire_timeout_secs", with = "secs")]
    pub acquire_timeout: Duration,

    #[serde(rename = "lock_timeout_secs", with = "secs")]
    pub lock_timeout: Duration,

    #[serde(rename = "retry_interval_ms", with = "millis")]
    pub retry_interval: Duration,

    /// Upper bound of the random delay added to each retry.
    #[serde(rename = "retry_jitter_ms", with = "millis")]
    pub retry_jitter: Duration,

    pub key_prefix: String,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            retry_jitter: Duration::ZERO,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

impl LockConfig {
    /// Acquire window; a zero setting means [`DEFAULT_ACQUIRE_TIMEOUT`].
    pub fn effective_acquire_timeout(&self) -> Duration {
        or_default(self.acquire_timeout, DEFAULT_ACQUIRE_TIMEOUT)
    }

    /// Entry expiry; a zero setting means [`DEFAULT_LOCK_TIMEOUT`].
    pub fn effective_lock_timeout(&self) -> Duration {
        or_default(self.lock_timeout, DEFAULT_LOCK_TIMEOUT)
    }
}

/// Named, time-bounded mutual exclusion arbitrated by a shared store.
///
/// Ownership is proven by a random token written with set-if-absent; the
/// store's TTL is the only thing that frees a lock whose holder vanished.
/// There is no renewal and no fencing: a holder that outlives its TTL may
/// overlap with the next one.
///
/// # Examples
///
/// ```rust,ignore
/// use std::sync::Arc;
/// use std::time::Duration;
/// use tandem_distributed::{DistributedLock, MemoryStore};
///
/// let lock = DistributedLock::new(Arc::new(MemoryStore::new()));
/// let token = lock.acquire("orders", Duration::from_secs(1), Duration::from_secs(10)).await?;
/// // critical section
/// lock.release("orders", &token).await?;
/// ```
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn KeyValueStore>,
    config: LockConfig,
    span: Span,
}

impl DistributedLock {
    /// Create a lock with default timings.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_config(store, LockConfig::default())
    }

    /// Create a lock with explicit timings.
    pub fn with_config(store: Arc<dyn KeyValueStore>, config: LockConfig) -> Self {
        Self {
            store,
            config,
            span: info_span!("distributed_lock"),
        }
    }

    /// Record every lock event under `span`.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Store key guarding `resource`.
    pub fn key_for(&self, resource: &str) -> Result<String, LockError> {
        if resource.is_empty() {
            return Err(LockError::InvalidResource);
        }
        Ok(format!("{}{}", self.config.key_prefix, resource))
    }

    /// Acquire `resource`, retrying on contention for up to `acquire_timeout`.
    ///
    /// A zero `acquire_timeout` or `lock_timeout` falls back to the configured
    /// value, and to the 5s defaults when that is zero too. Store failures abort immediately with [`LockError::Store`];
    /// they are never retried.
    pub async fn acquire(
        &self,
        resource: &str,
        acquire_timeout: Duration,
        lock_timeout: Duration,
    ) -> Result<LockToken, LockError> {
        let key = self.key_for(resource)?;
        let acquire_timeout = or_default(acquire_timeout, self.config.effective_acquire_timeout());
        let lock_timeout = or_default(lock_timeout, self.config.effective_lock_timeout());
        let span = info_span!(parent: &self.span, "acquire", resource, key = %key);

        self.acquire_key(resource, &key, acquire_timeout, lock_timeout)
            .instrument(span)
            .await
    }

    /// Acquire with the configured timeouts.
    pub async fn acquire_default(&self, resource: &str) -> Result<LockToken, LockError> {
        self.acquire(
            resource,
            self.config.effective_acquire_timeout(),
            self.config.effective_lock_timeout(),
        )
        .await
    }

    /// Single attempt; `Ok(None)` if someone else holds the lock.
    pub async fn try_acquire(&self, resource: &str) -> Result<Option<LockToken>, LockError> {
        let key = self.key_for(resource)?;
        let token = LockToken::generate();

        let created = self
            .store
            .set_if_absent(&key, token.as_str(), self.config.effective_lock_timeout())
            .instrument(info_span!(parent: &self.span, "try_acquire", resource))
            .await?;

        Ok(created.then_some(token))
    }

    /// Acquire with the configured timeouts and return a scoped guard.
    pub async fn lock(&self, resource: &str) -> Result<LockGuard, LockError> {
        let token = self.acquire_default(resource).await?;
        Ok(LockGuard {
            lock: self.clone(),
            resource: resource.to_string(),
            token,
            released: false,
        })
    }

    /// Release `resource` if `token` still owns it.
    ///
    /// An absent key and a key held by another token are both successes;
    /// the latter is never deleted. Only store failures are errors.
    pub async fn release(&self, resource: &str, token: &LockToken) -> Result<ReleaseOutcome, LockError> {
        let key = self.key_for(resource)?;
        let span = info_span!(parent: &self.span, "release", resource, key = %key);

        async {
            let outcome = match self.store.delete_if_equals(&key, token.as_str()).await {
                Ok(CompareDelete::Deleted) => ReleaseOutcome::Released,
                Ok(CompareDelete::Absent) => ReleaseOutcome::AlreadyReleased,
                Ok(CompareDelete::Mismatch) => ReleaseOutcome::HeldByOther,
                Err(e) => {
                    error!(error = %e, "Failed to release lock");
                    return Err(e.into());
                }
            };

            match outcome {
                ReleaseOutcome::Released => debug!("Released lock"),
                ReleaseOutcome::AlreadyReleased => debug!("Lock already released or expired"),
                ReleaseOutcome::HeldByOther => {
                    warn!("Lock was reassigned after expiry, leaving it in place")
                }
            }
            Ok(outcome)
        }
        .instrument(span)
        .await
    }

    async fn acquire_key(
        &self,
        resource: &str,
        key: &str,
        acquire_timeout: Duration,
        lock_timeout: Duration,
    ) -> Result<LockToken, LockError> {
        let token = LockToken::generate();
        let started = Instant::now();
        let deadline = started + acquire_timeout;
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            match self.store.set_if_absent(key, token.as_str(), lock_timeout).await {
                Ok(true) => {
                    info!(attempts, "Acquired lock");
                    return Ok(token);
                }
                Ok(false) => {}
                Err(e) => {
                    error!(error = %e, "Failed to set lock");
                    return Err(e.into());
                }
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(attempts, "Timed out waiting for lock");
                return Err(LockError::Timeout {
                    resource: resource.to_string(),
                    waited: now - started,
                });
            }

            tokio::time::sleep(self.backoff().min(deadline - now)).await;
        }
    }

    fn backoff(&self) -> Duration {
        let jitter_ms = self.config.retry_jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.config.retry_interval;
        }
        self.config.retry_interval + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }
}

fn or_default(value: Duration, default: Duration) -> Duration {
    if value.is_zero() { default } else { value }
}

/// Scoped lock ownership.
///
/// Prefer [`LockGuard::release`]; dropping an unreleased guard spawns a
/// best-effort release on the current tokio runtime.
pub struct LockGuard {
    lock: DistributedLock,
    resource: String,
    token: LockToken,
    released: bool,
}

impl LockGuard {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn token(&self) -> &LockToken {
        &self.token
    }

    /// Release the lock now.
    pub async fn release(mut self) -> Result<ReleaseOutcome, LockError> {
        self.released = true;
        self.lock.release(&self.resource, &self.token).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let lock = self.lock.clone();
        let resource = std::mem::take(&mut self.resource);
        let token = self.token.clone();

        handle.spawn(async move {
            if let Err(e) = lock.release(&resource, &token).await {
                warn!(resource = %resource, error = %e, "Release on drop failed");
            }
        });
    }
}

/// Fluent construction of a [`DistributedLock`].
pub struct LockBuilder {
    config: LockConfig,
    span: Option<Span>,
}

impl LockBuilder {
    pub fn new() -> Self {
        Self {
            config: LockConfig::default(),
            span: None,
        }
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.config.acquire_timeout = timeout;
        self
    }

    pub fn with_lock_timeout(mut self, ttl: Duration) -> Self {
        self.config.lock_timeout = ttl;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.config.retry_interval = interval;
        self
    }

    pub fn with_retry_jitter(mut self, jitter: Duration) -> Self {
        self.config.retry_jitter = jitter;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.key_prefix = prefix.into();
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn build(self, store: Arc<dyn KeyValueStore>) -> DistributedLock {
        let lock = DistributedLock::with_config(store, self.config);
        match self.span {
            Some(span) => lock.with_span(span),
            None => lock,
        }
    }
}

impl Default for LockBuilder {
    fn default() -> Self {
        Self::new()
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
