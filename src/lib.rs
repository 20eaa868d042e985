//! # Tandem
//!
//! Coordination primitives for services that share infrastructure:
//!
//! - [`DistributedLock`] - named, TTL-bounded mutual exclusion over Redis
//!   `SET NX PX` with token-checked release
//! - [`ConsumptionLoop`] - at-least-once consumer-group consumption that
//!   marks every offset once its handler returns
//!
//! Settings come from one [`Settings`] value loaded from TOML, `.env` and
//! `TANDEM_*` environment variables.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tandem::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = Settings::load(Some("tandem.toml".as_ref()))?;
//!     tandem::init_logging(&settings.log);
//!
//!     let lock = tandem::redis_lock(&settings).await?;
//!     let guard = lock.lock("nightly-report").await?;
//!     // Critical section
//!     guard.release().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

pub mod config;

pub use config::{ConfigError, Settings};

// Component crates
pub use tandem_distributed;
pub use tandem_log;
pub use tandem_messaging;
pub use tandem_redis;

pub use tandem_distributed::{
    DistributedLock, KeyValueStore, LockBuilder, LockConfig, LockError, LockGuard, LockToken,
    MemoryStore, RedisStore, ReleaseOutcome, StoreError,
};
pub use tandem_log::LogConfig;
pub use tandem_messaging::{
    ConsumptionLoop, LogClient, LoopState, MemoryLog, Message, MessageHandler, MessagingConfig,
    MessagingError, Producer, RunSummary, StopHandle, StopSignal, consume, stop_signal,
};
pub use tandem_redis::{RedisConfig, RedisService};

#[cfg(feature = "kafka")]
pub use tandem_messaging::{KafkaClient, KafkaProducer};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{ConfigError, Settings};
    pub use tandem_distributed::{
        DistributedLock, KeyValueStore, LockConfig, LockError, LockGuard, LockToken,
        ReleaseOutcome,
    };
    pub use tandem_messaging::{
        ConsumptionLoop, FnHandler, LogClient, Message, MessageHandler, MessagingConfig,
        MessagingError, Producer, StopHandle, StopSignal, stop_signal,
    };
}

/// Install the global tracing subscriber described by `config`.
///
/// Returns `false` if a subscriber was already installed.
pub fn init_logging(config: &LogConfig) -> bool {
    config.try_init().is_ok()
}

/// Connect to Redis with `settings.redis` and build a lock with
/// `settings.lock`.
pub async fn redis_lock(settings: &Settings) -> Result<DistributedLock, StoreError> {
    let store = RedisStore::connect(settings.redis.clone()).await?;
    Ok(DistributedLock::with_config(
        Arc::new(store),
        settings.lock.clone(),
    ))
}
