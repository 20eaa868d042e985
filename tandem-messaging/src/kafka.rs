//! Apache Kafka log client and producer

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use rdkafka::Message as KafkaMessage;
use rdkafka::Offset;
use rdkafka::TopicPartitionList;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::ClientContext;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{ReceiverStream, UnboundedReceiverStream};
use tracing::{debug, error, info, warn};

use crate::config::MessagingConfig;
use crate::error::MessagingError;
use crate::message::{Delivery, Message, MessagePosition, RebalanceEvent, TopicPartition};
use crate::traits::{ConsumerSession, ErrorStream, LogClient, MessageStream, NotificationStream, Producer};

/// Records buffered between the Kafka client and the consumption loop.
const PREFETCH: usize = 256;

/// Pause after a failed poll so a broken connection does not spin.
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Producer acknowledgement deadline.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Kafka consumer-group client
#[derive(Debug, Clone)]
pub struct KafkaClient {
    prefetch: usize,
}

impl Default for KafkaClient {
    fn default() -> Self {
        Self { prefetch: PREFETCH }
    }
}

impl KafkaClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records buffered ahead of the handler
    pub fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    fn consumer_config(config: &MessagingConfig) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", config.bootstrap_servers())
            .set("group.id", &config.group_id)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            // Offsets are stored by `mark_processed` and committed in the background.
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false");

        if let Some(ref client_id) = config.client_id {
            client_config.set("client.id", client_id);
        }

        client_config
    }
}

/// Forwards client errors and rebalances into the session's streams.
struct SessionContext {
    errors: mpsc::UnboundedSender<MessagingError>,
    notifications: mpsc::UnboundedSender<RebalanceEvent>,
}

impl ClientContext for SessionContext {
    fn error(&self, error: KafkaError, reason: &str) {
        debug!(error = %error, reason, "Kafka client error");
        let _ = self
            .errors
            .send(MessagingError::BrokerError(format!("{}: {}", error, reason)));
    }
}

impl ConsumerContext for SessionContext {
    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        let event = match rebalance {
            Rebalance::Assign(tpl) => RebalanceEvent::Assigned(partitions(tpl)),
            Rebalance::Revoke(tpl) => RebalanceEvent::Revoked(partitions(tpl)),
            Rebalance::Error(e) => RebalanceEvent::Failed(e.to_string()),
        };
        let _ = self.notifications.send(event);
    }
}

fn partitions(tpl: &TopicPartitionList) -> Vec<TopicPartition> {
    tpl.elements()
        .iter()
        .map(|elem| TopicPartition::new(elem.topic(), elem.partition()))
        .collect()
}

fn to_message<M: KafkaMessage>(kafka_msg: &M) -> Message {
    let mut message = Message::new(
        kafka_msg.topic(),
        kafka_msg.partition(),
        kafka_msg.offset(),
        kafka_msg.key().map(<[u8]>::to_vec),
        kafka_msg.payload().map(<[u8]>::to_vec).unwrap_or_default(),
    );
    message.timestamp = kafka_msg
        .timestamp()
        .to_millis()
        .and_then(chrono::DateTime::from_timestamp_millis);
    message
}

#[async_trait]
impl LogClient for KafkaClient {
    type Session = KafkaSession;

    async fn connect(&self, config: &MessagingConfig) -> Result<KafkaSession, MessagingError> {
        let (err_tx, err_rx) = mpsc::unbounded_channel();
        let (note_tx, note_rx) = mpsc::unbounded_channel();
        let context = SessionContext {
            errors: err_tx.clone(),
            notifications: note_tx,
        };

        let consumer: StreamConsumer<SessionContext> = Self::consumer_config(config)
            .create_with_context(context)
            .map_err(|e| MessagingError::Connection(e.to_string()))?;

        let topics: Vec<&str> = config.topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topics)
            .map_err(|e| MessagingError::Subscribe(e.to_string()))?;

        let consumer = Arc::new(consumer);
        let (msg_tx, msg_rx) = mpsc::channel(self.prefetch);
        let pump = tokio::spawn(pump(Arc::clone(&consumer), msg_tx, err_tx));

        info!(
            brokers = %config.bootstrap_servers(),
            topics = ?config.topics,
            group_id = %config.group_id,
            "Subscribed to Kafka topics"
        );

        Ok(KafkaSession {
            consumer,
            pump,
            messages: Mutex::new(Some(ReceiverStream::new(msg_rx).boxed())),
            errors: Mutex::new(Some(UnboundedReceiverStream::new(err_rx).boxed())),
            notifications: Mutex::new(Some(UnboundedReceiverStream::new(note_rx).boxed())),
        })
    }
}

async fn pump(
    consumer: Arc<StreamConsumer<SessionContext>>,
    messages: mpsc::Sender<Message>,
    errors: mpsc::UnboundedSender<MessagingError>,
) {
    loop {
        match consumer.recv().await {
            Ok(borrowed) => {
                let message = to_message(&borrowed);
                drop(borrowed);
                if messages.send(message).await.is_err() {
                    debug!("Message receiver dropped; stopping Kafka pump");
                    break;
                }
            }
            Err(e) => {
                let _ = errors.send(MessagingError::from(e));
                tokio::time::sleep(RECV_ERROR_BACKOFF).await;
            }
        }
    }
}

/// Live Kafka consumer-group membership
pub struct KafkaSession {
    consumer: Arc<StreamConsumer<SessionContext>>,
    pump: JoinHandle<()>,
    messages: Mutex<Option<MessageStream>>,
    errors: Mutex<Option<ErrorStream>>,
    notifications: Mutex<Option<NotificationStream>>,
}

#[async_trait]
impl ConsumerSession for KafkaSession {
    fn messages(&mut self) -> Option<MessageStream> {
        self.messages.get_mut().take()
    }

    fn errors(&mut self) -> Option<ErrorStream> {
        self.errors.get_mut().take()
    }

    fn notifications(&mut self) -> Option<NotificationStream> {
        self.notifications.get_mut().take()
    }

    async fn mark_processed(&self, position: &MessagePosition) -> Result<(), MessagingError> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(
            &position.topic,
            position.partition,
            Offset::Offset(position.offset + 1),
        )
        .map_err(|e| MessagingError::Commit(e.to_string()))?;

        self.consumer
            .store_offsets(&tpl)
            .map_err(|e| MessagingError::Commit(e.to_string()))
    }

    async fn close(&self) -> Result<(), MessagingError> {
        self.pump.abort();

        if let Err(e) = self.consumer.commit_consumer_state(CommitMode::Sync) {
            // Nothing stored since the last auto-commit is reported as an error too.
            warn!(error = %e, "Final offset commit failed");
        }
        self.consumer.unsubscribe();

        info!("Kafka consumer closed");
        Ok(())
    }
}

impl Drop for KafkaSession {
    fn drop(&mut self) {
        // The pump holds a consumer handle; without this it outlives the session.
        self.pump.abort();
    }
}

/// Kafka producer that waits for every in-sync replica to acknowledge
pub struct KafkaProducer {
    producer: FutureProducer,
    timeout: Duration,
}

impl KafkaProducer {
    pub fn new(config: &MessagingConfig) -> Result<Self, MessagingError> {
        if config.endpoints.iter().all(|e| e.trim().is_empty()) {
            return Err(MessagingError::Configuration(
                "at least one endpoint is required".to_string(),
            ));
        }
        config.describe("producer");

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", config.bootstrap_servers())
            .set("acks", "all")
            .set("message.send.max.retries", config.send_retries().to_string());

        if let Some(ref client_id) = config.client_id {
            client_config.set("client.id", client_id);
        }

        let producer: FutureProducer = client_config.create().map_err(|e| {
            error!(brokers = %config.bootstrap_servers(), error = %e, "Failed to create producer");
            MessagingError::Connection(e.to_string())
        })?;

        Ok(Self {
            producer,
            timeout: SEND_TIMEOUT,
        })
    }

    /// Acknowledgement deadline per send
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Producer for KafkaProducer {
    async fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<Delivery, MessagingError> {
        let record = FutureRecord::to(topic).key(key).payload(payload);

        match self.producer.send(record, self.timeout).await {
            Ok(delivered) => {
                info!(
                    topic,
                    key,
                    partition = delivered.partition,
                    offset = delivered.offset,
                    "Message sent"
                );
                Ok(Delivery {
                    partition: delivered.partition,
                    offset: delivered.offset,
                })
            }
            Err((e, _)) => {
                error!(topic, key, error = %e, "Failed to send message");
                Err(MessagingError::Publish(e.to_string()))
            }
        }
    }
}
