//! Traits at the log-client seam.

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::config::MessagingConfig;
use crate::error::MessagingError;
use crate::message::{Delivery, Message, MessagePosition, RebalanceEvent};

/// Records delivered to a session, per-partition in log order.
pub type MessageStream = BoxStream<'static, Message>;

/// Errors surfaced by the underlying client while the session runs.
pub type ErrorStream = BoxStream<'static, MessagingError>;

/// Partition reassignment notices.
pub type NotificationStream = BoxStream<'static, RebalanceEvent>;

/// Factory for consumer-group sessions.
#[async_trait]
pub trait LogClient: Send + Sync {
    /// The session type produced by [`LogClient::connect`].
    type Session: ConsumerSession;

    /// Join `config.group_id` and subscribe to `config.topics`.
    async fn connect(&self, config: &MessagingConfig) -> Result<Self::Session, MessagingError>;
}

/// One live membership in a consumer group.
///
/// The three streams can each be taken once; later calls return `None`.
#[async_trait]
pub trait ConsumerSession: Send + Sync + 'static {
    fn messages(&mut self) -> Option<MessageStream>;

    fn errors(&mut self) -> Option<ErrorStream>;

    fn notifications(&mut self) -> Option<NotificationStream>;

    /// Record that the record at `position` has been handled.
    async fn mark_processed(&self, position: &MessagePosition) -> Result<(), MessagingError>;

    /// Leave the group and release the connection.
    async fn close(&self) -> Result<(), MessagingError>;
}

/// Trait for handling received messages
///
/// Errors are logged by the loop; they never stop the offset from being
/// marked.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: Message) -> Result<(), MessagingError>;
}

/// Function-based message handler
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), MessagingError>> + Send,
{
    async fn handle(&self, message: Message) -> Result<(), MessagingError> {
        (self.0)(message).await
    }
}

/// Synchronous-acknowledgement producer.
#[async_trait]
pub trait Producer: Send + Sync {
    /// Append a record and wait for the broker to acknowledge it.
    async fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<Delivery, MessagingError>;
}
