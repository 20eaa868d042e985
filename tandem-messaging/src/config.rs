//! Consumer and producer configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::MessagingError;

/// Retry count used when `send_retry_max` is left at zero.
pub const DEFAULT_SEND_RETRY_MAX: u32 = 5;

/// Connection and consumption settings for one consumer group session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Broker addresses (`host:port`)
    pub endpoints: Vec<String>,
    /// Subscribed topic names
    pub topics: Vec<String>,
    /// Consumer group used for partition assignment and offsets
    pub group_id: String,
    /// Producer send retries; zero means [`DEFAULT_SEND_RETRY_MAX`]
    pub send_retry_max: u32,
    /// Maximum handler invocations in flight; `None` leaves dispatch unbounded
    pub max_in_flight: Option<usize>,
    /// Per-handler deadline in milliseconds
    pub handler_timeout_ms: Option<u64>,
    /// How long a stopping loop waits for in-flight handlers
    pub drain_timeout_ms: u64,
    /// Group session timeout passed to the client
    pub session_timeout_ms: u64,
    /// Where a group with no committed offset starts (`earliest` / `latest`)
    pub auto_offset_reset: String,
    /// Optional client identifier
    pub client_id: Option<String>,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            topics: Vec::new(),
            group_id: String::new(),
            send_retry_max: DEFAULT_SEND_RETRY_MAX,
            max_in_flight: None,
            handler_timeout_ms: None,
            drain_timeout_ms: 5_000,
            session_timeout_ms: 10_000,
            auto_offset_reset: "latest".to_string(),
            client_id: None,
        }
    }
}

impl MessagingConfig {
    /// Create a configuration for `group_id` consuming `topics` from `endpoints`
    pub fn new<E, T>(endpoints: E, topics: T, group_id: impl Into<String>) -> Self
    where
        E: IntoIterator,
        E::Item: Into<String>,
        T: IntoIterator,
        T::Item: Into<String>,
    {
        Self {
            endpoints: endpoints.into_iter().map(Into::into).collect(),
            topics: topics.into_iter().map(Into::into).collect(),
            group_id: group_id.into(),
            ..Default::default()
        }
    }

    /// Bound the number of concurrent handler invocations
    pub fn with_max_in_flight(mut self, limit: usize) -> Self {
        self.max_in_flight = Some(limit);
        self
    }

    /// Give every handler invocation a deadline
    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Set how long a stopping loop waits for in-flight handlers
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set producer send retries
    pub fn with_send_retry_max(mut self, retries: u32) -> Self {
        self.send_retry_max = retries;
        self
    }

    /// Start from the earliest retained offset when the group has none
    pub fn from_beginning(mut self) -> Self {
        self.auto_offset_reset = "earliest".to_string();
        self
    }

    /// Set the client identifier
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Effective producer retry count
    pub fn send_retries(&self) -> u32 {
        if self.send_retry_max == 0 {
            DEFAULT_SEND_RETRY_MAX
        } else {
            self.send_retry_max
        }
    }

    pub fn handler_timeout(&self) -> Option<Duration> {
        self.handler_timeout_ms.map(Duration::from_millis)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Comma-joined endpoint list as most clients expect it
    pub fn bootstrap_servers(&self) -> String {
        self.endpoints.join(",")
    }

    /// Check the settings a consumer session cannot start without
    pub fn validate(&self) -> Result<(), MessagingError> {
        if self.endpoints.iter().all(|e| e.trim().is_empty()) {
            return Err(MessagingError::Configuration(
                "at least one endpoint is required".to_string(),
            ));
        }
        if self.topics.iter().all(|t| t.trim().is_empty()) {
            return Err(MessagingError::Configuration(
                "at least one topic is required".to_string(),
            ));
        }
        if self.group_id.trim().is_empty() {
            return Err(MessagingError::Configuration(
                "group id must not be empty".to_string(),
            ));
        }
        if self.max_in_flight == Some(0) {
            return Err(MessagingError::Configuration(
                "max_in_flight must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Log the connection parameters for `role` (consumer / producer)
    pub fn describe(&self, role: &str) {
        info!(
            role,
            endpoints = ?self.endpoints,
            topics = ?self.topics,
            group_id = %self.group_id,
            send_retry_max = self.send_retries(),
            max_in_flight = ?self.max_in_flight,
            "Log client settings"
        );
    }
}
