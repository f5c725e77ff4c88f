//! Broker seams.
//!
//! The publisher and the group member only talk to a broker through these two
//! traits. `memory` implements them in-process, `kafka` over librdkafka.
//!
//! Offsets passed to [`GroupConsumer::commit`] follow the Kafka convention:
//! the committed value is the offset of the *next* record to read, i.e. the
//! last processed offset plus one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;

use crate::error::StreamResult;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
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

/// An encoded record on its way to the log.
#[derive(Debug, Clone)]
pub struct OutboundRecord {
    pub key: Vec<u8>,
    pub payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    /// Producer-side idempotence token (the record id)
    pub idempotency_key: String,
}

/// Where the broker placed a published record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub partition: i32,
    pub offset: i64,
    /// The broker recognised the send as a retry of an already-appended record
    pub duplicate: bool,
}

/// A raw message read from a partition.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl InboundMessage {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

/// What a poll can return.
#[derive(Debug, Clone)]
pub enum ConsumerEvent {
    /// The coordinator handed these partitions to this member
    Assigned(Vec<TopicPartition>),
    /// These partitions are being taken away; stop working on them
    Revoked(Vec<TopicPartition>),
    /// Records from a single partition, in log order
    Messages(Vec<InboundMessage>),
}

/// Append side of a partitioned log.
///
/// Implementations must be safe to call concurrently; per-partition order is
/// the order in which sends to that partition complete.
#[async_trait]
pub trait LogProducer: Send + Sync {
    /// Number of partitions of `topic`.
    async fn partition_count(&self, topic: &str) -> StreamResult<i32>;

    /// Append `record` to `topic`/`partition`, waiting for full acknowledgment.
    async fn send(
        &self,
        topic: &str,
        partition: i32,
        record: OutboundRecord,
    ) -> StreamResult<DeliveryReport>;

    /// Wait for outstanding sends.
    async fn flush(&self, timeout: Duration) -> StreamResult<()>;
}

/// Read side of a partitioned log, as one member of a consumer group.
///
/// A member is driven by a single task; implementations do not need to be
/// `Sync`.
#[async_trait]
pub trait GroupConsumer: Send {
    fn member_id(&self) -> String;

    /// Register with the group coordinator for `topic`.
    async fn subscribe(&mut self, topic: &str) -> StreamResult<()>;

    /// Wait up to `timeout` for the next event. `Ok(None)` means nothing happened.
    ///
    /// Must be cancel-safe: dropping the future must not lose an event.
    async fn poll(&mut self, timeout: Duration) -> StreamResult<Option<ConsumerEvent>>;

    /// Signal liveness to the coordinator.
    async fn heartbeat(&mut self) -> StreamResult<()>;

    /// Durably record `next_offset` for `tp`. Fails with a rebalance error if this
    /// member no longer owns `tp`.
    async fn commit(&mut self, tp: &TopicPartition, next_offset: i64) -> StreamResult<()>;

    /// Leave the group so partitions are reassigned without waiting for the
    /// session timeout.
    async fn leave(&mut self) -> StreamResult<()>;
}
