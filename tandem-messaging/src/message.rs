//! Message, position and rebalance types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt;

use crate::MessagingError;

/// A record read from one partition of the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Topic the record belongs to
    pub topic: String,
    /// Partition within the topic
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
    /// Optional partitioning key
    pub key: Option<Vec<u8>>,
    /// Payload bytes
    pub value: Vec<u8>,
    /// Broker or producer timestamp, when known
    pub timestamp: Option<DateTime<Utc>>,
}

impl Message {
    /// Create a record at a known position.
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        offset: i64,
        key: Option<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key,
            value: value.into(),
            timestamp: None,
        }
    }

    /// Where this record sits in the log; what gets marked after handling.
    pub fn position(&self) -> MessagePosition {
        MessagePosition {
            topic: self.topic.clone(),
            partition: self.partition,
            offset: self.offset,
        }
    }

    /// The key as UTF-8, if present and valid.
    pub fn key_str(&self) -> Option<&str> {
        self.key.as_deref().and_then(|k| std::str::from_utf8(k).ok())
    }

    /// The payload as UTF-8.
    pub fn payload_str(&self) -> Result<&str, MessagingError> {
        std::str::from_utf8(&self.value).map_err(|e| MessagingError::Deserialization(e.to_string()))
    }

    /// Parse the payload as JSON.
    pub fn parse_json<T: DeserializeOwned>(&self) -> Result<T, MessagingError> {
        serde_json::from_slice(&self.value).map_err(|e| MessagingError::Deserialization(e.to_string()))
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Message {{ topic: {}, partition: {}, offset: {}, size: {} bytes }}",
            self.topic,
            self.partition,
            self.offset,
            self.value.len()
        )
    }
}

/// Topic, partition and offset of a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessagePosition {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl MessagePosition {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

impl fmt::Display for MessagePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]@{}", self.topic, self.partition, self.offset)
    }
}

/// A single partition of a topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition)
    }
}

/// Partition reassignment notice for the group member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebalanceEvent {
    /// Partitions now owned by this member.
    Assigned(Vec<TopicPartition>),
    /// Partitions taken away from this member.
    Revoked(Vec<TopicPartition>),
    /// The rebalance itself failed.
    Failed(String),
}

impl fmt::Display for RebalanceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let list = |parts: &[TopicPartition]| {
            parts
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        };
        match self {
            RebalanceEvent::Assigned(parts) => write!(f, "assigned [{}]", list(parts)),
            RebalanceEvent::Revoked(parts) => write!(f, "revoked [{}]", list(parts)),
            RebalanceEvent::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Where a produced record landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub partition: i32,
    pub offset: i64,
}
