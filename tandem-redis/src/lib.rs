//! # Tandem Redis
//!
//! Redis bootstrap for the tandem lock store: a bb8 connection pool that is
//! pinged once on creation, plus the handful of commands lock arbitration
//! needs (`SET NX PX`, `GET`, `DEL`).
//!
//! ```rust,ignore
//! use tandem_redis::{RedisConfig, RedisService};
//! use std::time::Duration;
//!
//! let config = RedisConfig::from_env().pool_size(4).build();
//! let redis = RedisService::new(config).await?;
//!
//! let created = redis.set_nx_px("LOCK-orders", "token", Duration::from_secs(5)).await?;
//! ```

mod config;
mod error;
mod pool;
mod service;

pub use config::{RedisConfig, RedisConfigBuilder};
pub use error::{RedisError, Result};
pub use pool::{RedisConnection, RedisPool};
pub use service::{PoolStats, RedisService};

// Re-export redis crate for convenience
pub use redis;
