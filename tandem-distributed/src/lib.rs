//! Distributed locking for tandem
//!
//! Mutual exclusion between independent processes, arbitrated by a shared
//! key-value store's atomic set-if-absent.
//!
//! ## Features
//!
//! - **Token ownership** - each acquire writes a fresh UUID; release only
//!   deletes the entry while it still holds that token
//! - **TTL expiry** - a crashed holder's lock disappears on its own
//! - **Bounded retry** - contention is polled with a fixed (optionally
//!   jittered) interval until the acquire timeout
//! - **Pluggable store** - Redis via `tandem-redis`, or in-memory for tests
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tandem_distributed::*;
//! use tandem_redis::RedisConfig;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = RedisStore::connect(RedisConfig::from_env().build()).await?;
//!     let lock = DistributedLock::new(Arc::new(store));
//!
//!     let token = lock
//!         .acquire("invoice-42", Duration::from_secs(5), Duration::from_secs(5))
//!         .await?;
//!
//!     // Critical section
//!
//!     lock.release("invoice-42", &token).await?;
//!     Ok(())
//! }
//! ```

pub mod lock;
pub mod redis_store;
pub mod store;

pub use lock::{
    DEFAULT_ACQUIRE_TIMEOUT, DEFAULT_KEY_PREFIX, DEFAULT_LOCK_TIMEOUT, DEFAULT_RETRY_INTERVAL,
    DistributedLock, LockBuilder, LockConfig, LockError, LockGuard, LockToken, ReleaseOutcome,
};
pub use redis_store::RedisStore;
pub use store::{CompareDelete, KeyValueStore, MemoryStore, StoreError};
