//! In-process partitioned log.
//!
//! Behaves like a single-broker cluster with one member per group: a
//! session receives every partition of its topics, starting at the group's
//! committed offset. Marking an offset moves the committed position to
//! `offset + 1` but never backwards, the way consumer-group offset stores
//! behave. Useful for tests and local runs without a broker.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use crate::config::MessagingConfig;
use crate::error::MessagingError;
use crate::message::{Delivery, Message, MessagePosition, RebalanceEvent, TopicPartition};
use crate::traits::{ConsumerSession, ErrorStream, LogClient, MessageStream, NotificationStream, Producer};

/// Shared handle to an in-memory log. Clones see the same data.
#[derive(Clone)]
pub struct MemoryLog {
    inner: Arc<Inner>,
}

struct Inner {
    partitions: i32,
    state: Mutex<LogState>,
    round_robin: AtomicU64,
    connects: AtomicUsize,
    closes: AtomicUsize,
    fail_next_connect: AtomicBool,
}

#[derive(Default)]
struct LogState {
    topics: HashMap<String, Vec<Vec<Message>>>,
    committed: HashMap<(String, TopicPartition), i64>,
    marks: Vec<(String, MessagePosition)>,
    sessions: Vec<SessionLink>,
    next_session: u64,
}

struct SessionLink {
    id: u64,
    group: String,
    topics: HashSet<String>,
    messages: mpsc::UnboundedSender<Message>,
    errors: mpsc::UnboundedSender<MessagingError>,
    notifications: mpsc::UnboundedSender<RebalanceEvent>,
}

impl LogState {
    fn partitions_mut(&mut self, topic: &str, count: i32) -> &mut Vec<Vec<Message>> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); count as usize])
    }

    /// First live session per group subscribed to `topic`.
    fn subscribers(&self, topic: &str) -> Vec<&SessionLink> {
        let mut seen = HashSet::new();
        self.sessions
            .iter()
            .filter(|s| s.topics.contains(topic))
            .filter(|s| seen.insert(s.group.clone()))
            .collect()
    }
}

impl MemoryLog {
    /// Create a log whose topics each have `partitions` partitions.
    pub fn new(partitions: i32) -> Self {
        Self {
            inner: Arc::new(Inner {
                partitions: partitions.max(1),
                state: Mutex::new(LogState::default()),
                round_robin: AtomicU64::new(0),
                connects: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
                fail_next_connect: AtomicBool::new(false),
            }),
        }
    }

    pub fn partitions(&self) -> i32 {
        self.inner.partitions
    }

    /// Append a record; keyed records hash to a fixed partition, keyless
    /// ones are spread round-robin.
    pub fn publish(&self, topic: &str, key: Option<&[u8]>, value: impl Into<Vec<u8>>) -> Delivery {
        let partition = match key {
            Some(key) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() % self.inner.partitions as u64) as i32
            }
            None => {
                let next = self.inner.round_robin.fetch_add(1, Ordering::Relaxed);
                (next % self.inner.partitions as u64) as i32
            }
        };
        self.publish_to(topic, partition, key, value)
    }

    /// Append a record to an explicit partition.
    pub fn publish_to(
        &self,
        topic: &str,
        partition: i32,
        key: Option<&[u8]>,
        value: impl Into<Vec<u8>>,
    ) -> Delivery {
        let partition = partition.rem_euclid(self.inner.partitions);
        let mut state = self.inner.state.lock();
        let log = &mut state.partitions_mut(topic, self.inner.partitions)[partition as usize];

        let offset = log.len() as i64;
        let mut message = Message::new(topic, partition, offset, key.map(<[u8]>::to_vec), value);
        message.timestamp = Some(Utc::now());
        log.push(message.clone());

        for session in state.subscribers(topic) {
            let _ = session.messages.send(message.clone());
        }

        Delivery { partition, offset }
    }

    /// Push an error into every live session's error stream.
    pub fn inject_error(&self, error: MessagingError) {
        for session in &self.inner.state.lock().sessions {
            let _ = session.errors.send(error.clone());
        }
    }

    /// Push a rebalance notice into every live session.
    pub fn inject_rebalance(&self, event: RebalanceEvent) {
        for session in &self.inner.state.lock().sessions {
            let _ = session.notifications.send(event.clone());
        }
    }

    /// Make the next `connect` fail as if the cluster were unreachable.
    pub fn fail_next_connect(&self) {
        self.inner.fail_next_connect.store(true, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.inner.closes.load(Ordering::SeqCst)
    }

    /// Sessions currently connected.
    pub fn live_sessions(&self) -> usize {
        self.inner.state.lock().sessions.len()
    }

    /// Every `mark_processed` call in the order it happened.
    pub fn marks(&self) -> Vec<MessagePosition> {
        self.inner
            .state
            .lock()
            .marks
            .iter()
            .map(|(_, position)| position.clone())
            .collect()
    }

    /// Next offset `group` would read from `topic[partition]`.
    pub fn committed(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.inner
            .state
            .lock()
            .committed
            .get(&(group.to_string(), TopicPartition::new(topic, partition)))
            .copied()
    }

    /// Records stored in `topic[partition]`.
    pub fn len(&self, topic: &str, partition: i32) -> usize {
        self.inner
            .state
            .lock()
            .topics
            .get(topic)
            .and_then(|parts| parts.get(partition as usize))
            .map_or(0, Vec::len)
    }

    fn mark(&self, session: u64, group: &str, position: &MessagePosition) -> Result<(), MessagingError> {
        let mut state = self.inner.state.lock();
        if !state.sessions.iter().any(|s| s.id == session) {
            return Err(MessagingError::ChannelClosed(format!(
                "session closed before marking {}",
                position
            )));
        }

        state.marks.push((group.to_string(), position.clone()));
        let committed = state
            .committed
            .entry((group.to_string(), position.topic_partition()))
            .or_insert(0);
        *committed = (*committed).max(position.offset + 1);
        Ok(())
    }

    fn detach(&self, session: u64) -> bool {
        let mut state = self.inner.state.lock();
        let before = state.sessions.len();
        state.sessions.retain(|s| s.id != session);
        state.sessions.len() != before
    }
}

#[async_trait]
impl LogClient for MemoryLog {
    type Session = MemorySession;

    async fn connect(&self, config: &MessagingConfig) -> Result<MemorySession, MessagingError> {
        if self.inner.fail_next_connect.swap(false, Ordering::SeqCst) {
            return Err(MessagingError::Connection(format!(
                "memory log unreachable at {}",
                config.bootstrap_servers()
            )));
        }

        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let (err_tx, err_rx) = mpsc::unbounded_channel();
        let (note_tx, note_rx) = mpsc::unbounded_channel();
        let from_beginning = config.auto_offset_reset == "earliest";

        let mut state = self.inner.state.lock();
        let id = state.next_session;
        state.next_session += 1;

        let mut assigned = Vec::new();
        for topic in &config.topics {
            let count = self.inner.partitions;
            let backlog: Vec<(i32, Vec<Message>)> = state
                .partitions_mut(topic, count)
                .iter()
                .enumerate()
                .map(|(p, log)| (p as i32, log.clone()))
                .collect();

            for (partition, log) in backlog {
                let tp = TopicPartition::new(topic.clone(), partition);
                let start = match state.committed.get(&(config.group_id.clone(), tp.clone())) {
                    Some(offset) => *offset,
                    None if from_beginning => 0,
                    None => log.len() as i64,
                };
                for message in log.into_iter().filter(|m| m.offset >= start) {
                    let _ = msg_tx.send(message);
                }
                assigned.push(tp);
            }
        }
        let _ = note_tx.send(RebalanceEvent::Assigned(assigned));

        state.sessions.push(SessionLink {
            id,
            group: config.group_id.clone(),
            topics: config.topics.iter().cloned().collect(),
            messages: msg_tx,
            errors: err_tx,
            notifications: note_tx,
        });
        drop(state);

        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        debug!(session = id, group_id = %config.group_id, "Memory log session opened");

        Ok(MemorySession {
            id,
            group: config.group_id.clone(),
            log: self.clone(),
            messages: Mutex::new(Some(UnboundedReceiverStream::new(msg_rx).boxed())),
            errors: Mutex::new(Some(UnboundedReceiverStream::new(err_rx).boxed())),
            notifications: Mutex::new(Some(UnboundedReceiverStream::new(note_rx).boxed())),
        })
    }
}

#[async_trait]
impl Producer for MemoryLog {
    async fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<Delivery, MessagingError> {
        Ok(self.publish(topic, Some(key.as_bytes()), payload.to_vec()))
    }
}

/// Session on a [`MemoryLog`].
pub struct MemorySession {
    id: u64,
    group: String,
    log: MemoryLog,
    // Streams are `Send` but not `Sync`; the mutex makes the session shareable.
    messages: Mutex<Option<MessageStream>>,
    errors: Mutex<Option<ErrorStream>>,
    notifications: Mutex<Option<NotificationStream>>,
}

#[async_trait]
impl ConsumerSession for MemorySession {
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
        self.log.mark(self.id, &self.group, position)
    }

    async fn close(&self) -> Result<(), MessagingError> {
        self.log.inner.closes.fetch_add(1, Ordering::SeqCst);
        if self.log.detach(self.id) {
            debug!(session = self.id, "Memory log session closed");
        }
        Ok(())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        if self.log.detach(self.id) {
            debug!(session = self.id, "Memory log session dropped without close");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> MessagingConfig {
        MessagingConfig::new(["memory"], ["orders"], "billing").from_beginning()
    }

    #[test]
    fn test_keyed_publish_is_sticky() {
        let log = MemoryLog::new(4);
        let first = log.publish("orders", Some(b"user-1".as_slice()), b"a".to_vec());
        let second = log.publish("orders", Some(b"user-1".as_slice()), b"b".to_vec());

        assert_eq!(first.partition, second.partition);
        assert_eq!(second.offset, first.offset + 1);
    }

    #[test]
    fn test_keyless_publish_round_robins() {
        let log = MemoryLog::new(2);
        log.publish("orders", None, b"a".to_vec());
        log.publish("orders", None, b"b".to_vec());

        assert_eq!(log.len("orders", 0), 1);
        assert_eq!(log.len("orders", 1), 1);
    }

    #[tokio::test]
    async fn test_session_replays_backlog_then_live() {
        let log = MemoryLog::new(1);
        log.publish("orders", None, b"backlog".to_vec());

        let mut session = log.connect(&config()).await.unwrap();
        let mut messages = session.messages().unwrap();
        assert!(session.messages().is_none());

        log.publish("orders", None, b"live".to_vec());

        assert_eq!(messages.next().await.unwrap().value, b"backlog");
        assert_eq!(messages.next().await.unwrap().value, b"live");
    }

    #[tokio::test]
    async fn test_connect_announces_assignment() {
        let log = MemoryLog::new(2);
        let mut session = log.connect(&config()).await.unwrap();
        let mut notes = session.notifications().unwrap();

        assert_eq!(
            notes.next().await.unwrap(),
            RebalanceEvent::Assigned(vec![
                TopicPartition::new("orders", 0),
                TopicPartition::new("orders", 1),
            ])
        );
    }

    #[tokio::test]
    async fn test_marks_commit_monotonically() {
        let log = MemoryLog::new(1);
        for _ in 0..3 {
            log.publish("orders", None, b"x".to_vec());
        }
        let session = log.connect(&config()).await.unwrap();

        let at = |offset| MessagePosition {
            topic: "orders".into(),
            partition: 0,
            offset,
        };
        session.mark_processed(&at(2)).await.unwrap();
        session.mark_processed(&at(0)).await.unwrap();

        assert_eq!(log.committed("billing", "orders", 0), Some(3));
        assert_eq!(log.marks(), vec![at(2), at(0)]);
    }

    #[tokio::test]
    async fn test_reconnect_resumes_after_commit() {
        let log = MemoryLog::new(1);
        for i in 0..4u8 {
            log.publish("orders", None, vec![i]);
        }

        let session = log.connect(&config()).await.unwrap();
        session
            .mark_processed(&MessagePosition {
                topic: "orders".into(),
                partition: 0,
                offset: 1,
            })
            .await
            .unwrap();
        session.close().await.unwrap();

        let mut session = log.connect(&config()).await.unwrap();
        let mut messages = session.messages().unwrap();
        assert_eq!(messages.next().await.unwrap().offset, 2);
    }

    #[tokio::test]
    async fn test_latest_reset_skips_backlog() {
        let log = MemoryLog::new(1);
        log.publish("orders", None, b"old".to_vec());

        let latest = MessagingConfig::new(["memory"], ["orders"], "audit");
        let mut session = log.connect(&latest).await.unwrap();
        let mut messages = session.messages().unwrap();

        log.publish("orders", None, b"new".to_vec());
        assert_eq!(messages.next().await.unwrap().value, b"new");
    }

    #[tokio::test]
    async fn test_close_ends_streams_and_rejects_marks() {
        let log = MemoryLog::new(1);
        let mut session = log.connect(&config()).await.unwrap();
        let mut messages = session.messages().unwrap();

        session.close().await.unwrap();

        assert!(messages.next().await.is_none());
        assert_eq!(log.close_count(), 1);
        assert_eq!(log.live_sessions(), 0);
        let mark = session
            .mark_processed(&MessagePosition {
                topic: "orders".into(),
                partition: 0,
                offset: 0,
            })
            .await;
        assert!(matches!(mark, Err(MessagingError::ChannelClosed(_))));
    }

    #[tokio::test]
    async fn test_fail_next_connect() {
        let log = MemoryLog::new(1);
        log.fail_next_connect();

        assert!(matches!(
            log.connect(&config()).await,
            Err(MessagingError::Connection(_))
        ));
        assert!(log.connect(&config()).await.is_ok());
        assert_eq!(log.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_producer_send() {
        let log = MemoryLog::new(3);
        let delivery = log.send("orders", "user-9", b"{}").await.unwrap();

        assert_eq!(log.len("orders", delivery.partition), 1);
        assert_eq!(delivery.offset, 0);
    }

    #[tokio::test]
    async fn test_dropped_session_detaches() {
        let log = MemoryLog::new(1);
        let session = log.connect(&config()).await.unwrap();
        assert_eq!(log.live_sessions(), 1);

        drop(session);
        assert_eq!(log.live_sessions(), 0);
        assert_eq!(log.close_count(), 0);
    }
}
