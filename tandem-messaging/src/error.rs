//! Error types for messaging operations

use thiserror::Error;

/// Errors that can occur during messaging operations
#[derive(Error, Debug, Clone)]
pub enum MessagingError {
    /// Failed to connect to the log cluster
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Failed to publish a message
    #[error("Publish failed: {0}")]
    Publish(String),

    /// Failed to subscribe to topics
    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    /// Failed to mark or commit an offset
    #[error("Offset commit failed: {0}")]
    Commit(String),

    /// Failed to deserialize a message
    #[error("Deserialization failed: {0}")]
    Deserialization(String),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// Session stream or connection is closed
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Consumer group rebalance problem
    #[error("Rebalance failed: {0}")]
    Rebalance(String),

    /// Error reported by the broker or client library
    #[error("Broker error: {0}")]
    BrokerError(String),

    /// A message handler reported failure
    #[error("Handler failed: {0}")]
    Handler(String),
}

impl MessagingError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MessagingError::Connection(_)
                | MessagingError::Timeout(_)
                | MessagingError::Rebalance(_)
                | MessagingError::BrokerError(_)
        )
    }

    /// Check if this error indicates a connection issue
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            MessagingError::Connection(_) | MessagingError::ChannelClosed(_)
        )
    }
}

#[cfg(feature = "kafka")]
impl From<rdkafka::error::KafkaError> for MessagingError {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        use rdkafka::error::KafkaError;

        match &err {
            KafkaError::MessageProduction(_) => MessagingError::Publish(err.to_string()),
            KafkaError::MessageConsumption(_) => MessagingError::BrokerError(err.to_string()),
            KafkaError::ClientCreation(_) | KafkaError::ClientConfig(..) => {
                MessagingError::Connection(err.to_string())
            }
            KafkaError::Subscription(_) => MessagingError::Subscribe(err.to_string()),
            KafkaError::StoreOffset(_) | KafkaError::ConsumerCommit(_) => {
                MessagingError::Commit(err.to_string())
            }
            _ => MessagingError::BrokerError(err.to_string()),
        }
    }
}
