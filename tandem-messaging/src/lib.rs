//! # Tandem Messaging
//!
//! At-least-once consumption of a partitioned log through consumer groups.
//!
//! A [`ConsumptionLoop`] joins a group through a [`LogClient`], hands every
//! record to a [`MessageHandler`] on its own task and marks the record's
//! offset processed once the handler returns. Handler errors are logged and
//! never block the mark, so a poison record cannot stall a partition.
//!
//! ## Backends
//!
//! - [`MemoryLog`] - in-process log for tests and local runs
//! - `kafka` feature - `KafkaClient` / `KafkaProducer` on rdkafka
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tandem_messaging::{
//!     ConsumptionLoop, FnHandler, MemoryLog, Message, MessagingConfig, MessagingError, stop_signal,
//! };
//!
//! # async fn example() -> Result<(), MessagingError> {
//! let log = MemoryLog::new(4);
//! let config = MessagingConfig::new(["memory"], ["orders"], "billing").with_max_in_flight(32);
//!
//! let consumer = ConsumptionLoop::new(
//!     log,
//!     config,
//!     Arc::new(FnHandler(|msg: Message| async move {
//!         println!("{}", msg);
//!         Ok::<_, MessagingError>(())
//!     })),
//! );
//!
//! let (stop, signal) = stop_signal();
//! # stop.stop();
//! let summary = consumer.run(signal).await?;
//! println!("handled {} messages", summary.completed);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod consumer;
pub mod error;
pub mod memory;
pub mod message;
pub mod stop;
pub mod traits;

#[cfg(feature = "kafka")]
pub mod kafka;

pub use config::*;
pub use consumer::{ConsumptionLoop, LoopState, RunSummary, consume};
pub use error::*;
pub use memory::{MemoryLog, MemorySession};
pub use message::{Delivery, Message, MessagePosition, RebalanceEvent, TopicPartition};
pub use stop::{StopHandle, StopSignal, stop_signal};
pub use traits::*;

#[cfg(feature = "kafka")]
pub use kafka::{KafkaClient, KafkaProducer, KafkaSession};
